//! Caller-side view of one submitted query.

use std::sync::PoisonError;
use std::sync::Arc;

use tokio::sync::watch;

use super::error::QueryError;
use super::query::{QueryId, QueryOutcome};
use super::record::OutcomeSlot;
use super::registry::QueryRegistry;
use super::state::QueryState;

/// Handle returned by submission.
///
/// Observes lifecycle state changes, polls or awaits the terminal outcome,
/// and requests cancellation. Dropping the handle does not cancel the
/// query; the engine keeps driving it and discards the outcome.
pub struct QueryHandle {
    id: QueryId,
    registry: Arc<QueryRegistry>,
    status_rx: watch::Receiver<QueryState>,
    outcome_slot: OutcomeSlot,
}

impl QueryHandle {
    pub(crate) fn new(
        id: QueryId,
        registry: Arc<QueryRegistry>,
        status_rx: watch::Receiver<QueryState>,
        outcome_slot: OutcomeSlot,
    ) -> Self {
        QueryHandle {
            id,
            registry,
            status_rx,
            outcome_slot,
        }
    }

    /// Correlation id of the underlying query.
    pub fn id(&self) -> QueryId {
        self.id
    }

    /// Last published lifecycle state.
    pub fn state(&self) -> QueryState {
        *self.status_rx.borrow()
    }

    /// Non-blocking check for the terminal outcome.
    ///
    /// Returns `None` while the query is still in flight.
    pub fn poll(&self) -> Option<QueryOutcome> {
        self.outcome_slot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Await the terminal outcome.
    ///
    /// Never blocks inside the engine: waits on the record's state channel
    /// and re-checks the staged outcome at each change. If the engine task
    /// goes away without delivering, resolves to an engine-down failure.
    pub async fn wait(&mut self) -> QueryOutcome {
        loop {
            if let Some(outcome) = self.poll() {
                return outcome;
            }
            if self.status_rx.changed().await.is_err() {
                // Sender dropped: the record is gone. A delivery may still
                // have raced ahead of the channel closing.
                return self
                    .poll()
                    .unwrap_or(QueryOutcome::Failure(QueryError::EngineDown));
            }
        }
    }

    /// Request cancellation; always returns immediately.
    ///
    /// Best-effort and idempotent: a query whose response is mid-decode is
    /// destroyed once decoding finishes, and a query that already completed
    /// keeps its delivered outcome.
    pub fn cancel(&self) {
        self.registry.cancel(self.id);
    }
}

impl std::fmt::Debug for QueryHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryHandle")
            .field("id", &self.id)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}
