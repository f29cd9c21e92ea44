use thiserror::Error;

use crate::session::credential::FieldError;

/// A failed call across the backend boundary. Carries the backend's message verbatim.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{0}")]
pub struct RemoteError(pub String);

impl RemoteError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

impl From<std::io::Error> for RemoteError {
    fn from(e: std::io::Error) -> Self {
        Self(e.to_string())
    }
}

impl From<serde_json::Error> for RemoteError {
    fn from(e: serde_json::Error) -> Self {
        Self(e.to_string())
    }
}

#[derive(Error, Debug)]
pub enum MonitorError {
    #[error("Invalid input: {}", format_field_errors(.0))]
    Validation(Vec<FieldError>),

    #[error("Remote call failed: {0}")]
    Remote(#[from] RemoteError),

    #[error("Invalid loop interval: {0}")]
    InvalidInterval(String),

    #[error("Not logged in")]
    NotAuthenticated,

    #[error("Another {0} request is still in flight")]
    Busy(&'static str),

    #[error("Already logged in")]
    AlreadyAuthenticated,

    #[error("A job is already being tracked")]
    JobAlreadyTracked,

    #[error("No job is being tracked")]
    NoJobTracked,
}

pub type Result<T> = std::result::Result<T, MonitorError>;

/// Result of a single backend operation.
pub type RemoteResult<T> = std::result::Result<T, RemoteError>;

fn format_field_errors(errors: &[FieldError]) -> String {
    errors
        .iter()
        .map(|e| format!("{}: {}", e.field, e.message))
        .collect::<Vec<_>>()
        .join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_error_lists_every_field() {
        let err = MonitorError::Validation(vec![
            FieldError::new("username", "Required"),
            FieldError::new("port", "Invalid number"),
        ]);
        assert_eq!(
            err.to_string(),
            "Invalid input: username: Required, port: Invalid number"
        );
    }

    #[test]
    fn remote_error_keeps_backend_message() {
        let err: MonitorError = RemoteError::new("No loop currently running").into();
        assert_eq!(err.to_string(), "Remote call failed: No loop currently running");
    }
}
