// Shared error type for configuration and value validation.

#[derive(Debug, thiserror::Error)]
pub enum TandemError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("invalid host {host:?}: {reason}")]
    InvalidHost { host: String, reason: String },

    #[error("invalid collective token: {0} bytes (expected 128)")]
    TokenLength(usize),

    #[error("unknown dtype: {0}")]
    UnknownDtype(String),
}

/// Convenience alias used throughout this crate.
pub type Result<T> = std::result::Result<T, TandemError>;
