//! Tuncat Error Types

use thiserror::Error;

/// Result type alias for tuncat operations
pub type Result<T> = std::result::Result<T, Error>;

/// Tuncat error types
#[derive(Error, Debug)]
pub enum Error {
    // Input errors
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration file: {0}")]
    ConfigParse(#[from] toml::de::Error),

    // Handshake errors
    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Handshake timed out after {0:?}")]
    Timeout(std::time::Duration),

    // Network configuration errors
    #[error("Command `{command}` failed: {reason}")]
    Configuration { command: String, reason: String },

    // Device errors
    #[error("Device error: {0}")]
    Device(String),

    // Forwarding errors
    #[error("Transport error: {0}")]
    Transport(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Check if this error ends the current session before forwarding starts
    pub fn is_session_fatal(&self) -> bool {
        matches!(
            self,
            Error::Protocol(_)
                | Error::Timeout(_)
                | Error::Configuration { .. }
                | Error::Device(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_session_fatal_classification() {
        assert!(Error::Protocol("bad key".into()).is_session_fatal());
        assert!(Error::Timeout(Duration::from_secs(10)).is_session_fatal());
        assert!(Error::Configuration {
            command: "ip link set tun0 up".into(),
            reason: "exit status: 2".into(),
        }
        .is_session_fatal());
        assert!(!Error::Transport("reset".into()).is_session_fatal());
        assert!(!Error::Validation("bad ip".into()).is_session_fatal());
    }

    #[test]
    fn test_configuration_message_names_command() {
        let err = Error::Configuration {
            command: "route -n add 10.1.0.0/24 10.0.0.2".into(),
            reason: "exit status: 1".into(),
        };
        assert_eq!(
            err.to_string(),
            "Command `route -n add 10.1.0.0/24 10.0.0.2` failed: exit status: 1"
        );
    }
}
