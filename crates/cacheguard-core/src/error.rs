use thiserror::Error;

/// Errors raised by a remote store backend.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Store pool error: {0}")]
    Pool(String),

    #[error("Store connection error: {0}")]
    Connection(String),

    #[error("Store command error: {0}")]
    Command(String),

    #[error("Store script error: {0}")]
    Script(String),
}

impl StoreError {
    /// Create a new Pool error
    pub fn pool(message: impl Into<String>) -> Self {
        Self::Pool(message.into())
    }

    /// Create a new Connection error
    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection(message.into())
    }

    /// Create a new Command error
    pub fn command(message: impl Into<String>) -> Self {
        Self::Command(message.into())
    }

    /// Create a new Script error
    pub fn script(message: impl Into<String>) -> Self {
        Self::Script(message.into())
    }

    /// Whether retrying on a fresh connection could succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Pool(_) | Self::Connection(_))
    }
}

/// Errors raised while encoding or decoding a cache payload.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("JSON codec error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("MessagePack encode error: {0}")]
    MsgPackEncode(#[from] rmp_serde::encode::Error),

    #[error("MessagePack decode error: {0}")]
    MsgPackDecode(#[from] rmp_serde::decode::Error),
}

/// Result type for store operations
pub type StoreResult<T> = Result<T, StoreError>;
