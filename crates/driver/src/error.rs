//! Class driver error types

use host::{ClientEvent, HostError};
use thiserror::Error;

use crate::action::Action;

/// Fatal driver errors, handed to the supervisor
#[derive(Debug, Error)]
pub enum DriverError {
    #[error("{op} failed: {source}")]
    Host {
        op: &'static str,
        #[source]
        source: HostError,
    },

    #[error("{action} precondition violated: {reason}")]
    Precondition {
        action: Action,
        reason: &'static str,
    },

    #[error("Illegal transition {from} -> {to}")]
    InvalidTransition { from: Action, to: Action },

    #[error("Unexpected host event {0:?}")]
    UnexpectedEvent(ClientEvent),

    #[error("Host controller unavailable: {0}")]
    Connect(String),
}

impl DriverError {
    /// Wrap a host error raised by `op`
    pub fn host(op: &'static str) -> impl FnOnce(HostError) -> Self {
        move |source| DriverError::Host { op, source }
    }

    /// Whether restarting enumeration could help
    ///
    /// Host failures may be transient; everything else is a logic error.
    pub fn is_restartable(&self) -> bool {
        matches!(self, DriverError::Host { .. })
    }
}

pub type Result<T> = std::result::Result<T, DriverError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_host_error_wrapping() {
        let err = DriverError::host("device_open")(HostError::InvalidClient);
        assert_eq!(err.to_string(), "device_open failed: Client is not registered");
        assert!(err.is_restartable());
    }

    #[test]
    fn test_logic_errors_not_restartable() {
        let err = DriverError::Precondition {
            action: Action::Poll,
            reason: "no device open",
        };
        assert_eq!(
            err.to_string(),
            "TRANSFER precondition violated: no device open"
        );
        assert!(!err.is_restartable());
        assert!(
            !DriverError::InvalidTransition {
                from: Action::Open,
                to: Action::Exit
            }
            .is_restartable()
        );
    }
}
