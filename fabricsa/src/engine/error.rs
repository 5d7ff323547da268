//! Error types surfaced by the query engine.

use thiserror::Error;

/// Errors returned synchronously at submission time.
#[derive(Debug, Error)]
pub enum SubmitError {
    /// The outstanding-query limit is reached. Callers recover by backing
    /// off and resubmitting; the engine never queues past the limit.
    #[error("outstanding query limit of {limit} reached")]
    ResourceExhausted { limit: usize },

    /// The engine task has shut down and no longer accepts work.
    #[error("query engine is shut down")]
    EngineDown,
}

/// Terminal failure reasons carried inside a failed query outcome.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QueryError {
    /// No response after the retry budget was exhausted.
    #[error("no response after {attempts} send attempts")]
    Timeout { attempts: u32 },

    /// The transport reported a fatal send failure.
    #[error("send failed: {0}")]
    SendFailed(String),

    /// The service answered with a defined error status. Not retried: a
    /// defined status is assumed to reproduce on resend.
    #[error("subnet administrator returned status {status:#06x}")]
    Protocol { status: u16 },

    /// The response correlated correctly but could not be decoded. Terminal
    /// without retry.
    #[error("malformed response: {0}")]
    Decode(String),

    /// The transport reported an unrecoverable error for this query.
    #[error("transport error: {0}")]
    Transport(String),

    /// The engine shut down before the query completed.
    #[error("query engine shut down before completion")]
    EngineDown,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_submit_error_display() {
        let err = SubmitError::ResourceExhausted { limit: 64 };
        assert_eq!(err.to_string(), "outstanding query limit of 64 reached");
    }

    #[test]
    fn test_query_error_display() {
        assert_eq!(
            QueryError::Timeout { attempts: 3 }.to_string(),
            "no response after 3 send attempts"
        );
        assert_eq!(
            QueryError::Protocol { status: 0x0100 }.to_string(),
            "subnet administrator returned status 0x0100"
        );
        assert_eq!(
            QueryError::Decode("truncated record".into()).to_string(),
            "malformed response: truncated record"
        );
    }
}
