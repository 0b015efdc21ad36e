//! Error taxonomy shared by every component of the core.
//!
//! Channel- and device-level faults are normally recovered locally and
//! surface as events; the variants here are what callers see when a command
//! is rejected synchronously.

use crate::session::SessionState;
use thiserror::Error;

/// Errors reported by the communication core.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CoreError {
    /// Framing or decoding failure on a channel. Fatal to that channel only.
    #[error("protocol desync: {0}")]
    ProtocolDesync(String),

    /// `start` was called while a session already exists.
    #[error("a debug session is already active")]
    SessionAlreadyActive,

    /// The command is not accepted in the current session state.
    #[error("`{command}` is not valid while the session is {state}")]
    InvalidSessionState {
        command: &'static str,
        state: SessionState,
    },

    /// The device already has an open connection.
    #[error("device {0} is already open")]
    DeviceBusy(String),

    /// The device is not (or no longer) attached.
    #[error("device {0} is not available")]
    DeviceUnavailable(String),

    /// The device disappeared while a connection was open.
    #[error("device {0} was lost")]
    DeviceLost(String),

    /// Input was sent to a device without an open connection.
    #[error("device {0} is not open")]
    DeviceNotOpen(String),

    /// I/O failure on an open connection.
    #[error("connection error on {identifier}: {message}")]
    ConnectionError { identifier: String, message: String },

    /// The runner exited abnormally or became unreachable.
    #[error("runner crashed: {0}")]
    RunnerCrashed(String),

    /// The runner process could not be spawned.
    #[error("failed to launch runner: {0}")]
    LaunchFailed(String),

    /// A configuration value is outside its allowed bounds.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Result alias used across the command surface.
pub type CoreResult<T> = Result<T, CoreError>;

impl CoreError {
    /// Short machine-readable tag for the error category.
    pub fn tag(&self) -> &'static str {
        match self {
            Self::ProtocolDesync(_) => "ProtocolDesync",
            Self::SessionAlreadyActive => "SessionAlreadyActive",
            Self::InvalidSessionState { .. } => "InvalidSessionState",
            Self::DeviceBusy(_) => "DeviceBusy",
            Self::DeviceUnavailable(_) => "DeviceUnavailable",
            Self::DeviceLost(_) => "DeviceLost",
            Self::DeviceNotOpen(_) => "DeviceNotOpen",
            Self::ConnectionError { .. } => "ConnectionError",
            Self::RunnerCrashed(_) => "RunnerCrashed",
            Self::LaunchFailed(_) => "LaunchFailed",
            Self::InvalidConfig(_) => "InvalidConfig",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = CoreError::InvalidSessionState {
            command: "continue",
            state: SessionState::Running,
        };
        assert_eq!(err.to_string(), "`continue` is not valid while the session is running");
        assert_eq!(err.tag(), "InvalidSessionState");

        let err = CoreError::DeviceBusy("/dev/ttyACM0".to_string());
        assert_eq!(err.to_string(), "device /dev/ttyACM0 is already open");
    }
}
