//! Gateway error types and transport error classification.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, GatewayError>;

#[derive(Debug, Error)]
pub enum GatewayError {
    /// Configuration is invalid. Fatal at startup (exit 1).
    #[error("Configuration error: {0}")]
    Config(String),

    /// The process could not be brought up (bind failure, etc.). Fatal.
    #[error("Startup error: {0}")]
    Startup(String),

    /// A single upstream failed; the rest of the gateway proceeds.
    #[error("Upstream '{name}': {message}")]
    Upstream { name: String, message: String },

    /// Anything that goes wrong after startup.
    #[error("Runtime error: {0}")]
    Runtime(String),
}

impl GatewayError {
    pub fn upstream(name: impl Into<String>, message: impl std::fmt::Display) -> Self {
        Self::Upstream {
            name: name.into(),
            message: message.to_string(),
        }
    }
}

/// How a transport-level I/O error should be treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportErrorClass {
    /// Count and continue (peer reset, timeout, host not found, broken pipe).
    Transient,
    /// Clean up the affected session or upstream immediately.
    Critical,
    Unknown,
}

/// Classify an I/O error per the session error policy.
///
/// Critical errors are those that will not get better by retrying on the
/// same socket: refused connections, permission problems, and file
/// descriptor exhaustion.
pub fn classify_io(err: &std::io::Error) -> TransportErrorClass {
    use std::io::ErrorKind;

    #[cfg(unix)]
    if matches!(err.raw_os_error(), Some(libc::EMFILE) | Some(libc::ENFILE)) {
        return TransportErrorClass::Critical;
    }

    match err.kind() {
        ErrorKind::ConnectionReset
        | ErrorKind::ConnectionAborted
        | ErrorKind::TimedOut
        | ErrorKind::BrokenPipe
        | ErrorKind::NotConnected
        | ErrorKind::HostUnreachable => TransportErrorClass::Transient,
        ErrorKind::ConnectionRefused | ErrorKind::PermissionDenied => TransportErrorClass::Critical,
        _ => TransportErrorClass::Unknown,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Error, ErrorKind};

    #[test]
    fn resets_and_pipes_are_transient() {
        for kind in [
            ErrorKind::ConnectionReset,
            ErrorKind::TimedOut,
            ErrorKind::BrokenPipe,
            ErrorKind::HostUnreachable,
        ] {
            assert_eq!(
                classify_io(&Error::from(kind)),
                TransportErrorClass::Transient,
                "{kind:?}"
            );
        }
    }

    #[test]
    fn refused_and_permission_are_critical() {
        for kind in [ErrorKind::ConnectionRefused, ErrorKind::PermissionDenied] {
            assert_eq!(
                classify_io(&Error::from(kind)),
                TransportErrorClass::Critical,
                "{kind:?}"
            );
        }
    }

    #[cfg(unix)]
    #[test]
    fn fd_exhaustion_is_critical() {
        let err = Error::from_raw_os_error(libc::EMFILE);
        assert_eq!(classify_io(&err), TransportErrorClass::Critical);
    }

    #[test]
    fn everything_else_is_unknown() {
        assert_eq!(
            classify_io(&Error::from(ErrorKind::InvalidData)),
            TransportErrorClass::Unknown
        );
    }
}
