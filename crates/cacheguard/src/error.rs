use cacheguard_core::{CodecError, StoreError};
use thiserror::Error;

/// Errors surfaced by the lock, cache and rate-limit engine.
#[derive(Debug, Error)]
pub enum CacheError {
    /// Every acquisition attempt found the lock held.
    #[error("Lock busy: {key} (gave up after {attempts} attempts)")]
    LockBusy { key: String, attempts: u64 },

    #[error("Remote store unavailable: {0}")]
    StoreUnavailable(#[from] StoreError),

    /// A cached payload could not be encoded or decoded. Never a cache miss.
    #[error("Serialization error for {key}: {source}")]
    Serialization {
        key: String,
        #[source]
        source: CodecError,
    },

    #[error("Rate limited: {key} allows {quota} requests per {window_secs}s")]
    RateLimited {
        key: String,
        quota: u64,
        window_secs: u64,
    },

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Unknown cache tier: {0}")]
    UnknownTier(String),
}

impl CacheError {
    /// Create a new LockBusy error
    pub fn lock_busy(key: impl Into<String>, attempts: u64) -> Self {
        Self::LockBusy {
            key: key.into(),
            attempts,
        }
    }

    /// Create a new Serialization error
    pub fn serialization(key: impl Into<String>, source: CodecError) -> Self {
        Self::Serialization {
            key: key.into(),
            source,
        }
    }

    /// Create a new Configuration error
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }

    /// Expected outcomes that drive a fallback path rather than a failure.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::LockBusy { .. } | Self::RateLimited { .. })
    }

    /// Get error category for logging/monitoring
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::LockBusy { .. } => ErrorCategory::Contention,
            Self::RateLimited { .. } => ErrorCategory::Quota,
            Self::StoreUnavailable(_) => ErrorCategory::Store,
            Self::Serialization { .. } => ErrorCategory::Serialization,
            Self::Configuration(_) | Self::UnknownTier(_) => ErrorCategory::Configuration,
        }
    }
}

/// Error categories for monitoring and classification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Contention,
    Quota,
    Store,
    Serialization,
    Configuration,
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Contention => write!(f, "contention"),
            Self::Quota => write!(f, "quota"),
            Self::Store => write!(f, "store"),
            Self::Serialization => write!(f, "serialization"),
            Self::Configuration => write!(f, "configuration"),
        }
    }
}

/// Result type alias for engine operations
pub type CacheResult<T> = Result<T, CacheError>;
