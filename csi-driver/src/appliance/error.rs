use thiserror::Error;

/// Failure categories a verb call can resolve to. spec.md §4.1.
///
/// The client never panics on a malformed reply; unparsable or
/// unrecognised appliance error payloads become `Unknown`.
#[derive(Error, Debug, Clone)]
pub enum ApplianceError {
    #[error("transport error, reconnect in progress: {0}")]
    Transport(String),

    #[error("resource not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("resource busy: {0}")]
    Busy(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("unknown appliance error: {0}")]
    Unknown(String),
}

impl ApplianceError {
    /// True for the categories the controller engine is allowed to retry
    /// with bounded backoff, per spec.md §7.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ApplianceError::Transport(_) | ApplianceError::Busy(_))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, ApplianceError::NotFound(_))
    }
}
