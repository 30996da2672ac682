//! Error taxonomy shared by the command bus, both transports, and the scheduler.

use crate::bus::TransportKind;

/// Errors surfaced by command execution and the services built on it.
///
/// Local handler errors arrive as `Internal` (or whatever variant the
/// handler chose) and propagate to the caller unchanged. Remote handler
/// errors arrive as `Remote` carrying the peer's error text.
#[derive(Debug, thiserror::Error)]
pub enum RouterError {
    #[error("command not registered: {name}")]
    CommandNotRegistered { name: String },
    #[error("{transport} round trip timed out after {timeout_ms}ms")]
    TransportTimeout {
        transport: TransportKind,
        timeout_ms: u64,
    },
    #[error("no open connection to peer: {peer}")]
    TransportUnavailable { peer: String },
    #[error("validation failed: {}", errors.join("; "))]
    ValidationFailed { errors: Vec<String> },
    #[error("a task with idempotency key {key:?} is already scheduled")]
    TaskConflict { key: String },
    #[error("handler failed: {message}")]
    HandlerFailure { message: String },
    #[error("remote error: {message}")]
    Remote { message: String },
    #[error("broker error: {0}")]
    Broker(String),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl RouterError {
    /// Returns `true` for failures a caller may reasonably retry.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::TransportTimeout { .. } | Self::TransportUnavailable { .. } | Self::Broker(_)
        )
    }
}

impl From<orbit_core::TaskValidationError> for RouterError {
    fn from(err: orbit_core::TaskValidationError) -> Self {
        Self::ValidationFailed { errors: err.errors }
    }
}

impl From<serde_json::Error> for RouterError {
    fn from(err: serde_json::Error) -> Self {
        Self::ValidationFailed {
            errors: vec![err.to_string()],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transport_errors_are_retryable() {
        assert!(RouterError::TransportTimeout {
            transport: TransportKind::Mesh,
            timeout_ms: 10
        }
        .is_retryable());
        assert!(RouterError::TransportUnavailable {
            peer: "orders".into()
        }
        .is_retryable());
        assert!(!RouterError::CommandNotRegistered { name: "x.y".into() }.is_retryable());
        assert!(!RouterError::TaskConflict { key: "k".into() }.is_retryable());
    }

    #[test]
    fn display_includes_context() {
        let err = RouterError::TransportTimeout {
            transport: TransportKind::Broker,
            timeout_ms: 5000,
        };
        assert_eq!(err.to_string(), "broker round trip timed out after 5000ms");

        let err = RouterError::ValidationFailed {
            errors: vec!["a".into(), "b".into()],
        };
        assert_eq!(err.to_string(), "validation failed: a; b");
    }

    #[test]
    fn anyhow_errors_keep_their_message() {
        let err: RouterError = anyhow::anyhow!("disk full").into();
        assert_eq!(err.to_string(), "disk full");
    }
}
