//! Per-query state tracked by the registry.
//!
//! A [`QueryRecord`] is the unit of bookkeeping for one outstanding request:
//! lifecycle state, retry accounting, parent/child composition, and the
//! processing refcount that defers destruction while another thread is
//! decoding the record's response. All fields are mutated only under the
//! registry's structural lock.

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::Instant;
use tracing::trace;

use super::error::QueryError;
use super::query::{
    CommandKind, FanOutMode, Priority, QueryId, QueryOutcome, ResultBuffer, SaRequest,
};
use super::state::QueryState;

/// Callback fired once when a fabric operation reaches a terminal outcome.
/// Invoked with no registry lock held.
pub(crate) type CompletionCallback = Box<dyn FnOnce(QueryId, QueryOutcome) + Send>;

/// Shared slot a handle polls for the staged terminal outcome.
pub(crate) type OutcomeSlot = Arc<Mutex<Option<QueryOutcome>>>;

/// Non-owning back-reference from a child record to its parent.
///
/// Carries the child's fan-out position so the aggregator can place results
/// by position rather than arrival order. The parent is found by id lookup,
/// never through a direct reference, so a child can never extend its
/// parent's lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ParentLink {
    pub id: QueryId,
    pub slot: usize,
}

/// Retry and timeout accounting for one record.
#[derive(Debug, Clone)]
pub(crate) struct RetryControl {
    /// Hard retry budget remaining. Decremented on timeout-driven retries,
    /// never on busy backoff.
    pub retries_left: u32,
    /// Budget the record started with; children inherit this.
    pub max_retries: u32,
    /// Deadline interval armed at each (re)send.
    pub attempt_timeout: Duration,
    /// Sends actually handed to the transport so far. Transiently failed
    /// tries arm the deadline but are not counted.
    pub attempts: u32,
    /// When the record was last sent or last failed to send. The waiting
    /// deadline resets here, not at original submission.
    pub sent_at: Option<Instant>,
    /// Busy backoff expiry, set when the service reports busy.
    pub backoff_until: Option<Instant>,
}

impl RetryControl {
    pub fn new(max_retries: u32, attempt_timeout: Duration) -> Self {
        RetryControl {
            retries_left: max_retries,
            max_retries,
            attempt_timeout,
            attempts: 0,
            sent_at: None,
            backoff_until: None,
        }
    }

    /// Record a successful hand-off to the transport.
    pub fn note_send(&mut self, now: Instant) {
        self.attempts += 1;
        self.sent_at = Some(now);
        self.backoff_until = None;
    }

    /// Record a transiently failed send attempt; the deadline runs from the
    /// failed try.
    pub fn note_send_deferred(&mut self, now: Instant) {
        self.sent_at = Some(now);
        self.backoff_until = None;
    }

    /// Whether the per-attempt deadline has elapsed.
    pub fn deadline_elapsed(&self, now: Instant) -> bool {
        match self.sent_at {
            Some(sent_at) => now >= sent_at + self.attempt_timeout,
            None => false,
        }
    }

    /// Consume one retry from the budget. Returns false when exhausted.
    pub fn consume_retry(&mut self) -> bool {
        if self.retries_left > 0 {
            self.retries_left -= 1;
            true
        } else {
            false
        }
    }

    pub fn start_backoff(&mut self, until: Instant) {
        self.backoff_until = Some(until);
    }

    pub fn backoff_elapsed(&self, now: Instant) -> bool {
        match self.backoff_until {
            Some(until) => now >= until,
            None => true,
        }
    }
}

/// Terminal result of one child, recorded at its fan-out slot.
#[derive(Debug, Clone)]
pub(crate) enum ChildOutcome {
    Success(ResultBuffer),
    Failure(QueryError),
    Cancelled,
}

/// One fan-out position of a composite query.
#[derive(Debug)]
pub(crate) struct ChildSlot {
    /// Correlation id of the child once allocated. Serialized children not
    /// yet issued have no id.
    pub id: Option<QueryId>,
    /// Set exactly once, when the child reaches a terminal state.
    pub outcome: Option<ChildOutcome>,
}

/// Child bookkeeping attached to a composite parent.
pub(crate) struct ChildSet {
    pub mode: FanOutMode,
    /// One slot per child, in fan-out position order.
    pub slots: Vec<ChildSlot>,
    /// Serialized children waiting for their predecessor to complete,
    /// keyed by their slot position. Not yet present in the registry.
    pub queued: VecDeque<(usize, SaRequest)>,
}

impl ChildSet {
    /// Whether every slot has a recorded outcome.
    pub fn all_done(&self) -> bool {
        self.slots.iter().all(|slot| slot.outcome.is_some())
    }
}

/// One outstanding request tracked by the registry.
pub(crate) struct QueryRecord {
    pub id: QueryId,
    pub kind: CommandKind,
    /// Request snapshot, including the current destination. Redirects
    /// rewrite the destination in place.
    pub request: SaRequest,
    pub state: QueryState,
    pub control: RetryControl,
    pub priority: Priority,
    /// Back-reference for child records; `None` for top-level queries.
    pub parent: Option<ParentLink>,
    /// Fan-out bookkeeping; `None` until (and unless) the primary response
    /// spawns children.
    pub children: Option<ChildSet>,
    /// Count of threads currently decoding this record's response without
    /// the structural lock. Nonzero blocks physical removal.
    pub processing_refcount: u32,
    /// Cancellation latched while the record was being processed; applied
    /// when the refcount returns to zero.
    pub destroy_pending: bool,
    /// Engine-issued maintenance query; completes without client delivery.
    pub self_issued: bool,
    /// Whether this record counts against the outstanding-query limit.
    pub counted: bool,
    /// Decoded leaf result, staged until delivery.
    pub result: Option<ResultBuffer>,
    /// Terminal failure, staged until delivery.
    pub failure: Option<QueryError>,
    /// Protocol-level status from the last response, zero if none.
    pub protocol_status: u16,
    /// Publishes non-terminal state changes to the handle. Terminal states
    /// are published during delivery, after the outcome is staged.
    pub status_tx: watch::Sender<QueryState>,
    pub outcome_slot: OutcomeSlot,
    pub on_complete: Option<CompletionCallback>,
}

impl QueryRecord {
    /// Transition to `next`, publishing the change to the handle unless the
    /// state is terminal.
    pub fn set_state(&mut self, next: QueryState) {
        if self.state == next {
            return;
        }
        trace!(query_id = %self.id, from = %self.state, to = %next, "state transition");
        self.state = next;
        if !next.is_terminal() {
            let _ = self.status_tx.send(next);
        }
    }

    pub fn is_processing(&self) -> bool {
        self.processing_refcount > 0
    }
}

impl fmt::Debug for QueryRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryRecord")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("state", &self.state)
            .field("processing_refcount", &self.processing_refcount)
            .field("destroy_pending", &self.destroy_pending)
            .field("parent", &self.parent)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_control_budget() {
        let mut control = RetryControl::new(2, Duration::from_millis(100));
        assert!(control.consume_retry());
        assert!(control.consume_retry());
        assert!(!control.consume_retry());
        assert_eq!(control.retries_left, 0);
        assert_eq!(control.max_retries, 2);
    }

    #[test]
    fn test_deadline_runs_from_last_send() {
        let mut control = RetryControl::new(1, Duration::from_millis(100));
        let start = Instant::now();
        assert!(!control.deadline_elapsed(start), "unsent record has no deadline");

        control.note_send(start);
        assert_eq!(control.attempts, 1);
        assert!(!control.deadline_elapsed(start + Duration::from_millis(50)));
        assert!(control.deadline_elapsed(start + Duration::from_millis(100)));

        // A resend re-arms the deadline from the new send time.
        control.note_send(start + Duration::from_millis(100));
        assert!(!control.deadline_elapsed(start + Duration::from_millis(150)));
        assert_eq!(control.attempts, 2);
    }

    #[test]
    fn test_backoff_window() {
        let mut control = RetryControl::new(1, Duration::from_millis(100));
        let start = Instant::now();
        assert!(control.backoff_elapsed(start), "no backoff armed");

        control.start_backoff(start + Duration::from_millis(200));
        assert!(!control.backoff_elapsed(start + Duration::from_millis(199)));
        assert!(control.backoff_elapsed(start + Duration::from_millis(200)));

        // A send clears the backoff window.
        control.note_send(start + Duration::from_millis(200));
        assert!(control.backoff_until.is_none());
    }

    #[test]
    fn test_child_set_completion() {
        let set = ChildSet {
            mode: FanOutMode::Parallel,
            slots: vec![
                ChildSlot {
                    id: Some(QueryId::new(1)),
                    outcome: Some(ChildOutcome::Success(ResultBuffer::new())),
                },
                ChildSlot {
                    id: Some(QueryId::new(2)),
                    outcome: None,
                },
            ],
            queued: VecDeque::new(),
        };
        assert!(!set.all_done());

        let set = ChildSet {
            mode: FanOutMode::Parallel,
            slots: vec![ChildSlot {
                id: Some(QueryId::new(1)),
                outcome: Some(ChildOutcome::Cancelled),
            }],
            queued: VecDeque::new(),
        };
        assert!(set.all_done());
    }
}
