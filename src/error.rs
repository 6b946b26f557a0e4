//! Error values used across the sync core.
//!
//! Errors travel as `anyhow::Error`; the concrete kind is recovered by
//! downcast (`err.is::<TransportError>()`) where a caller needs to
//! branch, e.g. to decide whether a retry is worthwhile.

/// Network or provider I/O failure. Retryable unless `retryable` is
/// explicitly cleared (auth failures, quota).
#[derive(Debug)]
pub struct TransportError {
    pub message: String,
    pub retryable: bool,
}

impl TransportError {
    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: true,
        }
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: false,
        }
    }
}

impl std::fmt::Display for TransportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "transport error: {}", self.message)
    }
}

impl std::error::Error for TransportError {}

/// The remote rejected an upload because its sequence advanced past what
/// this client last saw. Resolved by re-downloading, then retrying.
#[derive(Debug)]
pub struct ConflictError {
    pub server_seq: i64,
}

impl std::fmt::Display for ConflictError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "remote sequence conflict at seq {}", self.server_seq)
    }
}

impl std::error::Error for ConflictError {}

/// A state snapshot failed structural invariants and could not be
/// repaired. Terminal for the current operation; never silently dropped.
#[derive(Clone, Debug)]
pub struct ValidationError {
    pub message: String,
    pub cross_model: Option<String>,
}

impl ValidationError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            cross_model: None,
        }
    }

    pub fn with_cross_model(message: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            cross_model: Some(detail.into()),
        }
    }
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.cross_model {
            Some(detail) => write!(f, "invalid state: {} ({detail})", self.message),
            None => write!(f, "invalid state: {}", self.message),
        }
    }
}

impl std::error::Error for ValidationError {}

/// Missing credentials, client ID, or other local configuration that
/// requires user action. Never retried.
#[derive(Debug)]
pub struct ConfigError {
    pub message: String,
}

impl ConfigError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "config error: {}", self.message)
    }
}

impl std::error::Error for ConfigError {}

/// The AEAD self-test failed. Checked before any destructive remote
/// step so a broken crypto stack can never wipe data it cannot replace.
#[derive(Debug)]
pub struct CryptoUnavailableError;

impl std::fmt::Display for CryptoUnavailableError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "encryption primitives unavailable")
    }
}

impl std::error::Error for CryptoUnavailableError {}

/// True when the error is worth retrying with backoff.
pub fn is_retryable(err: &anyhow::Error) -> bool {
    if let Some(t) = err.downcast_ref::<TransportError>() {
        return t.retryable;
    }
    false
}
