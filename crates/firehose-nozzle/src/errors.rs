// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

/// Failures reported by a streaming session.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("no data received before the idle timeout")]
    IdleTimeout,

    #[error("stream closed by the server")]
    NormalClosure,

    #[error("stream closed for policy violation, the nozzle cannot keep up: {0}")]
    PolicyViolation(String),

    #[error("unauthorized, refreshing token")]
    Unauthorized,

    #[error("unexpected status code: {0}")]
    Http(u16),

    #[error("transport error: {0}")]
    Io(String),

    #[error("failed to decode envelope batch: {0}")]
    Decode(String),

    #[error("giving up after {0} consecutive reconnect attempts")]
    RetriesExhausted(u32),
}

impl TransportError {
    /// Whether the session may keep going after this error. Non-retryable errors stop the nozzle.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            TransportError::PolicyViolation(_) | TransportError::RetriesExhausted(_)
        )
    }
}

/// Errors surfaced by the nozzle to its owner.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum NozzleError {
    #[error("nozzle already started")]
    AlreadyStarted,

    #[error("nozzle is not running")]
    NotRunning,

    #[error("nozzle is still reading, stop it before draining")]
    StillReading,

    #[error("fatal transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("failed to obtain token: {0}")]
    Token(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_error_classification() {
        assert!(TransportError::IdleTimeout.is_retryable());
        assert!(TransportError::NormalClosure.is_retryable());
        assert!(TransportError::Unauthorized.is_retryable());
        assert!(TransportError::Http(502).is_retryable());
        assert!(TransportError::Io("reset".into()).is_retryable());
        assert!(TransportError::Decode("bad json".into()).is_retryable());
        assert!(!TransportError::PolicyViolation("slow consumer".into()).is_retryable());
        assert!(!TransportError::RetriesExhausted(3).is_retryable());
    }

    #[test]
    fn test_error_display() {
        let error = NozzleError::from(TransportError::RetriesExhausted(5));
        assert_eq!(
            error.to_string(),
            "fatal transport error: giving up after 5 consecutive reconnect attempts"
        );
    }
}
