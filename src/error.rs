//! Crate-wide error taxonomy.

use thiserror::Error;

/// Errors surfaced by the runner core.
#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("runner is shutting down")]
    RunnerShutdown,

    #[error("actor not found: {0}")]
    ActorNotFound(String),

    #[error("message acknowledgment timeout")]
    AckTimeout,

    #[error("websocket message index skipped (expected {expected}, got {got})")]
    MessageIndexSkip { expected: u16, got: u16 },

    #[error("handler error: {0}")]
    HandlerException(#[source] anyhow::Error),

    #[error("unknown protocol message tag: {0}")]
    ProtocolMismatch(u8),

    #[error("control socket error: {0}")]
    ControlSocketError(#[source] anyhow::Error),

    #[error("kv request timed out")]
    KvRequestTimeout,

    #[error("runner lost: control channel unreachable past the runner-lost threshold")]
    RunnerLost,

    #[error("invalid runner configuration: {0}")]
    InvalidConfig(String),

    #[error("protocol encode error: {0}")]
    Encode(#[source] anyhow::Error),

    #[error("protocol decode error: {0}")]
    Decode(#[source] anyhow::Error),

    #[error("response body exceeds maximum size ({size} > {max})")]
    BodyTooLarge { size: usize, max: usize },

    #[error("restore_hibernating_requests called twice for actor {0}")]
    AlreadyRestored(String),
}

pub type Result<T> = std::result::Result<T, RunnerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_context() {
        let e = RunnerError::ActorNotFound("a1".into());
        assert_eq!(e.to_string(), "actor not found: a1");

        let e = RunnerError::MessageIndexSkip {
            expected: 4,
            got: 9,
        };
        assert!(e.to_string().contains("expected 4"));
        assert!(e.to_string().contains("got 9"));
    }

    #[test]
    fn body_too_large_formats_both_sizes() {
        let e = RunnerError::BodyTooLarge {
            size: 100,
            max: 20,
        };
        assert_eq!(
            e.to_string(),
            "response body exceeds maximum size (100 > 20)"
        );
    }
}
