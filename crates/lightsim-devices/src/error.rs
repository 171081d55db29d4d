/*!
 * Error types for the device engine.
 */
use thiserror::Error;

use lightsim_core::error::Error as CoreError;

use crate::protocol::MessageKind;

/// Error type for device operations
#[derive(Error, Debug)]
pub enum DeviceError {
    /// A serial could not be parsed
    #[error("Invalid serial: {0}")]
    InvalidSerial(String),

    /// `state_for` expected one state and got a different number
    #[error("Expected exactly one {kind} state, got {got}")]
    ExpectedOneState {
        /// The requested kind
        kind: MessageKind,
        /// How many states plugins produced
        got: usize,
    },

    /// `state_for` expected at least one state and got none
    #[error("Expected at least one {kind} state, got none")]
    NoStates {
        /// The requested kind
        kind: MessageKind,
    },

    /// An IO plugin did not name its channel
    #[error("IO plugin {0} has no io_source")]
    MissingIoSource(String),

    /// `restart_session` was called before any session was started
    #[error("Cannot restart session for {0} without a previous shutdown signal")]
    RestartWithoutShutdown(String),

    /// Plugin options in the value store did not validate
    #[error("Invalid options for {plugin}: {reason}")]
    InvalidOptions {
        /// Plugin name
        plugin: String,
        /// What was wrong
        reason: String,
    },

    /// No IO plugin claims the named channel
    #[error("No IO channel named {0}")]
    UnknownIo(String),

    /// An IO channel has no running session
    #[error("IO channel {0} has no running session")]
    NoSession(String),

    /// The device has not been prepared, or was deleted
    #[error("Device {0} is not prepared")]
    NotPrepared(String),

    /// Decoding or encoding a packet failed
    #[error("Codec error: {0}")]
    Codec(String),

    /// Misuse of the attribute store
    #[error("Attribute error: {0}")]
    Attribute(String),

    /// Core error
    #[error("Core error: {0}")]
    Core(#[from] CoreError),
}

/// Result type for device operations
pub type Result<T> = std::result::Result<T, DeviceError>;

impl DeviceError {
    /// Create a new attribute error
    pub fn attribute<S: AsRef<str>>(msg: S) -> Self {
        DeviceError::Attribute(msg.as_ref().to_string())
    }

    /// Create a new invalid options error
    pub fn invalid_options<P: AsRef<str>, R: std::fmt::Display>(plugin: P, reason: R) -> Self {
        DeviceError::InvalidOptions {
            plugin: plugin.as_ref().to_string(),
            reason: reason.to_string(),
        }
    }
}

/// What a plugin's `respond` can return besides success
#[derive(Error, Debug)]
pub enum RespondError {
    /// Abort the rest of dispatch for the current event
    #[error("stop dispatch")]
    Stop,

    /// The plugin failed; other plugins still see the event
    #[error(transparent)]
    Failed(#[from] anyhow::Error),
}

impl From<DeviceError> for RespondError {
    fn from(err: DeviceError) -> Self {
        RespondError::Failed(anyhow::Error::new(err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_messages() {
        let err = DeviceError::ExpectedOneState {
            kind: MessageKind::StatePower,
            got: 2,
        };
        assert_eq!(err.to_string(), "Expected exactly one StatePower state, got 2");

        let err = DeviceError::invalid_options("clean", "duration_s must be positive");
        assert_eq!(
            err.to_string(),
            "Invalid options for clean: duration_s must be positive"
        );
    }

    #[test]
    fn test_respond_error_from_device_error() {
        let err: RespondError = DeviceError::attribute("nope").into();
        assert!(matches!(err, RespondError::Failed(_)));
        assert_eq!(err.to_string(), "Attribute error: nope");
    }
}
