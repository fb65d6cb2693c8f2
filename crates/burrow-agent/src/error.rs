//! Tunnel agent errors

use std::io;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("Tunnel agent already started")]
    AlreadyStarted,

    #[error("Tunnel agent closed")]
    Closed,

    #[error("Failed to bind to {address}: {reason}\n\nTroubleshooting:\n  • Check if another process is using this port: lsof -i :{port}\n  • Try using a different address or port")]
    Bind {
        address: String,
        port: u16,
        reason: String,
    },

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Socket-layer failures that are part of normal tunnel churn.
///
/// A remote tunnel client disappearing mid-relay shows up as one of these;
/// they are logged at debug and never surfaced.
pub fn is_benign_io_error(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::TimedOut
    )
}

/// Accept errors after which the listener keeps accepting.
pub(crate) fn is_transient_accept_error(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
            | io::ErrorKind::TimedOut
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_benign_errors() {
        assert!(is_benign_io_error(&io::Error::from(
            io::ErrorKind::ConnectionReset
        )));
        assert!(is_benign_io_error(&io::Error::from(io::ErrorKind::TimedOut)));
        assert!(!is_benign_io_error(&io::Error::from(
            io::ErrorKind::PermissionDenied
        )));
    }

    #[test]
    fn test_transient_accept_errors() {
        assert!(is_transient_accept_error(&io::Error::from(
            io::ErrorKind::Interrupted
        )));
        assert!(!is_transient_accept_error(&io::Error::other("too many open files")));
    }

    #[test]
    fn test_bind_error_message() {
        let err = AgentError::Bind {
            address: "10.0.0.1".to_string(),
            port: 0,
            reason: "Cannot assign requested address".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.starts_with("Failed to bind to 10.0.0.1"));
        assert!(msg.contains("Troubleshooting"));
    }
}
