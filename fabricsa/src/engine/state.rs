//! Query lifecycle states.
//!
//! Every outstanding request moves through these states under the registry's
//! structural lock. The two terminal states differ only in how the record is
//! delivered: `QueryComplete` carries a result or failure to the caller,
//! `QueryDestroy` means the record was cancelled and is reclaimed without a
//! success outcome.

use std::fmt;

/// Lifecycle state of a query record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryState {
    /// Registered but not yet sent (or re-armed for a retry send).
    ReadyToSend,
    /// A send attempt failed transiently; the sweeper will retry it.
    NotAbleToSend,
    /// Sent, awaiting a correlated reply or a timeout.
    WaitingForResult,
    /// The service reported busy; waiting out a backoff delay before resend.
    BusyRetryDelay,
    /// Primary response decoded; child sub-queries are outstanding.
    WaitingForChildToComplete,
    /// A thread is decoding the response outside the registry lock.
    ProcessingResponse,
    /// Finished (successfully or not), ready for delivery to the caller.
    QueryComplete,
    /// Cancelled; reclaimed without a success outcome.
    QueryDestroy,
}

impl QueryState {
    /// Whether this state ends the record's lifecycle.
    pub fn is_terminal(&self) -> bool {
        matches!(self, QueryState::QueryComplete | QueryState::QueryDestroy)
    }

    /// Whether the timeout sweeper examines records in this state.
    ///
    /// `ReadyToSend` is deliberately exempt: a record that was never sent
    /// cannot have waited too long for a reply.
    pub fn is_swept(&self) -> bool {
        matches!(
            self,
            QueryState::WaitingForResult
                | QueryState::NotAbleToSend
                | QueryState::BusyRetryDelay
        )
    }
}

impl fmt::Display for QueryState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            QueryState::ReadyToSend => "ready-to-send",
            QueryState::NotAbleToSend => "not-able-to-send",
            QueryState::WaitingForResult => "waiting-for-result",
            QueryState::BusyRetryDelay => "busy-retry-delay",
            QueryState::WaitingForChildToComplete => "waiting-for-children",
            QueryState::ProcessingResponse => "processing-response",
            QueryState::QueryComplete => "complete",
            QueryState::QueryDestroy => "destroy",
        };
        write!(f, "{}", name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_states() {
        assert!(QueryState::QueryComplete.is_terminal());
        assert!(QueryState::QueryDestroy.is_terminal());
        assert!(!QueryState::ReadyToSend.is_terminal());
        assert!(!QueryState::WaitingForResult.is_terminal());
        assert!(!QueryState::ProcessingResponse.is_terminal());
        assert!(!QueryState::WaitingForChildToComplete.is_terminal());
    }

    #[test]
    fn test_swept_states() {
        assert!(QueryState::WaitingForResult.is_swept());
        assert!(QueryState::NotAbleToSend.is_swept());
        assert!(QueryState::BusyRetryDelay.is_swept());
        assert!(!QueryState::ReadyToSend.is_swept());
        assert!(!QueryState::ProcessingResponse.is_swept());
        assert!(!QueryState::QueryComplete.is_swept());
    }

    #[test]
    fn test_display_names() {
        assert_eq!(QueryState::ReadyToSend.to_string(), "ready-to-send");
        assert_eq!(QueryState::QueryDestroy.to_string(), "destroy");
    }
}
