// Cluster membership value types.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{Result, TandemError};

/// Rank 0 is always the master.
pub const MASTER_RANK: usize = 0;

/// Hosts travel in NUL-padded fixed fields of this width, so at most
/// `HOST_FIELD_LEN - 1` bytes of host text fit.
pub const HOST_FIELD_LEN: usize = 16;

// ── DataAddr ──────────────────────────────────────────────────────────────────

/// Address of a node's data-channel listener.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DataAddr {
    pub host: String,
    pub port: u16,
}

impl DataAddr {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self { host: host.into(), port }
    }

    /// Check that the host fits the fixed wire field.
    pub fn validate(&self) -> Result<()> {
        validate_host(&self.host)
    }

    /// `host:port` form accepted by socket connect/bind calls.
    pub fn socket_string(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl fmt::Display for DataAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Reject hosts that cannot be carried in a `[u8; HOST_FIELD_LEN]` field.
pub fn validate_host(host: &str) -> Result<()> {
    if host.is_empty() {
        return Err(TandemError::InvalidHost {
            host: host.to_string(),
            reason: "empty".into(),
        });
    }
    if host.len() >= HOST_FIELD_LEN {
        return Err(TandemError::InvalidHost {
            host: host.to_string(),
            reason: format!("longer than {} bytes", HOST_FIELD_LEN - 1),
        });
    }
    if host.as_bytes().contains(&0) {
        return Err(TandemError::InvalidHost {
            host: host.to_string(),
            reason: "contains NUL".into(),
        });
    }
    Ok(())
}

// ── Node ──────────────────────────────────────────────────────────────────────

/// A cluster participant as recorded in the master's membership table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    pub rank: usize,
    pub data_addr: DataAddr,
}

impl Node {
    pub fn new(rank: usize, data_addr: DataAddr) -> Self {
        Self { rank, data_addr }
    }

    pub fn is_master(&self) -> bool {
        self.rank == MASTER_RANK
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_limits() {
        assert!(validate_host("10.0.0.1").is_ok());
        assert!(validate_host("255.255.255.255").is_ok()); // 15 bytes
        assert!(validate_host("a-very-long-hostname").is_err());
        assert!(validate_host("").is_err());
    }

    #[test]
    fn display_and_master() {
        let node = Node::new(0, DataAddr::new("127.0.0.1", 9000));
        assert!(node.is_master());
        assert_eq!(node.data_addr.to_string(), "127.0.0.1:9000");
    }
}
