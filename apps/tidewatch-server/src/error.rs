use thiserror::Error;
use tidewatch_proto::{Status, MAX_RECORDING_SECS, MIN_RECORDING_SECS};

use crate::{capture::DeviceError, files::ResourceError, router::HandlerError};

/// Everything a command can fail with before or while its producer runs.
///
/// Each variant maps onto one error status envelope; none of them ever end the
/// receive loop.
#[derive(Debug, Error)]
pub enum CommandError {
    #[error("{0}")]
    Validation(String),
    #[error(transparent)]
    Resource(#[from] ResourceError),
    #[error(transparent)]
    Device(#[from] DeviceError),
    #[error("A recording is already in progress")]
    AlreadyActive,
    #[error("No recording in progress")]
    NotRecording,
    #[error(transparent)]
    Handler(#[from] HandlerError),
}

impl CommandError {
    pub fn invalid_duration() -> Self {
        CommandError::Validation(format!(
            "Duration must be between {MIN_RECORDING_SECS} and {MAX_RECORDING_SECS} seconds"
        ))
    }

    pub fn missing_argument(verb: &str) -> Self {
        CommandError::Validation(format!("{verb} requires an argument"))
    }

    pub fn kind(&self) -> &'static str {
        match self {
            CommandError::Validation(_) => "validation",
            CommandError::Resource(_) => "resource",
            CommandError::Device(_) => "device",
            CommandError::AlreadyActive | CommandError::NotRecording => "state",
            CommandError::Handler(_) => "handler",
        }
    }

    pub fn to_status(&self) -> Status {
        Status::error(self.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_timeout::timeout]
    fn duration_error_names_the_accepted_range() {
        let status = CommandError::invalid_duration().to_status();
        assert!(status.is_error());
        assert_eq!(status.message, "Duration must be between 5 and 300 seconds");
    }

    #[test_timeout::timeout]
    fn nested_errors_keep_their_message() {
        let err = CommandError::from(ResourceError::NotFound("/nope".into()));
        assert_eq!(err.kind(), "resource");
        assert_eq!(err.to_status().message, "Path not found: /nope");
    }
}
