use std::io;

use tandem_net::NetError;
use tandem_types::TandemError;

/// Coarse failure class used by callers to decide between retrying, tearing
/// the node down, or reporting a programming error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// I/O hiccup during steady state.
    Transient,
    /// Peer sent something malformed, unexpected, or from an unknown rank.
    Protocol,
    /// Device or host memory could not be obtained.
    ResourceExhausted,
    /// The device runtime failed: bad handle, unknown device, copy overrun.
    Device,
    /// A peer stopped answering or closed its connection.
    NodeLoss,
    /// The pool or channel was stopped while the call was blocked.
    Shutdown,
    /// Called in the wrong state, role, or with bad configuration.
    Usage,
}

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("network error: {0}")]
    Net(#[from] NetError),

    #[error("i/o error: {0}")]
    Io(#[from] io::Error),

    #[error("configuration error: {0}")]
    Config(#[from] TandemError),

    #[error("planning error: {0}")]
    Planning(String),

    #[error("invalid state transition: {from} → {to}")]
    InvalidTransition { from: String, to: String },

    #[error("operation `{op}` is not available on the {role}")]
    WrongRole { op: &'static str, role: &'static str },

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("registration of rank {rank} rejected by master")]
    Rejected { rank: usize },

    #[error("allocation failed: {0}")]
    Allocation(String),

    #[error("device error: {0}")]
    Device(String),

    #[error("node {rank} lost: {reason}")]
    NodeLost { rank: usize, reason: String },

    #[error("could not reach {addr} after {attempts} attempts")]
    ConnectFailed { addr: String, attempts: u32 },

    #[error("collective backend error: {0}")]
    Collective(String),

    #[error("buffer pool stopped")]
    Stopped,

    #[error("control channel closed")]
    Closed,
}

impl PipelineError {
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Net(e) if e.is_protocol() => ErrorClass::Protocol,
            Self::Net(_) | Self::Io(_) | Self::ConnectFailed { .. } | Self::Collective(_) => {
                ErrorClass::Transient
            }
            Self::Protocol(_) | Self::Rejected { .. } => ErrorClass::Protocol,
            Self::Allocation(_) => ErrorClass::ResourceExhausted,
            Self::Device(_) => ErrorClass::Device,
            Self::NodeLost { .. } => ErrorClass::NodeLoss,
            Self::Stopped | Self::Closed => ErrorClass::Shutdown,
            Self::Config(_)
            | Self::Planning(_)
            | Self::InvalidTransition { .. }
            | Self::WrongRole { .. } => ErrorClass::Usage,
        }
    }

    /// Fatal errors end the process; the cluster cannot recover in place.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self.class(),
            ErrorClass::Protocol | ErrorClass::ResourceExhausted | ErrorClass::Device | ErrorClass::NodeLoss
        )
    }
}

/// Convenience alias used throughout this crate.
pub type Result<T> = std::result::Result<T, PipelineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification() {
        assert_eq!(PipelineError::Stopped.class(), ErrorClass::Shutdown);
        assert!(!PipelineError::Stopped.is_fatal());

        let lost = PipelineError::NodeLost { rank: 1, reason: "heartbeat timeout".into() };
        assert_eq!(lost.class(), ErrorClass::NodeLoss);
        assert!(lost.is_fatal());

        let bad_frame = PipelineError::from(NetError::UnknownPacketType(42));
        assert_eq!(bad_frame.class(), ErrorClass::Protocol);

        let reset = PipelineError::from(NetError::Io(io::Error::from(io::ErrorKind::ConnectionReset)));
        assert_eq!(reset.class(), ErrorClass::Transient);
        assert!(!reset.is_fatal());

        let oom = PipelineError::Allocation("out of memory".into());
        assert_eq!(oom.class(), ErrorClass::ResourceExhausted);
        assert!(oom.is_fatal());

        let overrun = PipelineError::Device("copy overruns allocation".into());
        assert_eq!(overrun.class(), ErrorClass::Device);
        assert!(overrun.is_fatal());

        let bad_tp = PipelineError::from(TandemError::Config("tensor parallel size 4 exceeds 2 devices".into()));
        assert_eq!(bad_tp.class(), ErrorClass::Usage);
    }
}
