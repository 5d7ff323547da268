//! Correlation-id registry and lifecycle transitions.
//!
//! The registry owns the id-to-record map and is the single serialization
//! point for structural mutation: state assignment, insert, remove, and
//! child accounting all happen under one short-held lock. Response decoding
//! and outcome callbacks never run under that lock; a record being decoded
//! is protected by its processing refcount instead, which defers physical
//! removal until the decoding thread releases its token.
//!
//! Mutating operations return [`EngineAction`] lists describing the sends
//! and deliveries the caller must perform after the lock is dropped.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use super::aggregate;
use super::decode::{DecodeError, DecodedResponse};
use super::error::{QueryError, SubmitError};
use super::query::{
    CommandKind, Priority, QueryId, QueryOutcome, ResultBuffer, SaDestination, SaRequest,
};
use super::record::{
    ChildOutcome, CompletionCallback, OutcomeSlot, ParentLink, QueryRecord, RetryControl,
};
use super::state::QueryState;

// ============================================================================
// Actions and delivery
// ============================================================================

/// Deferred work produced by a registry transition, executed by the caller
/// with no lock held.
#[derive(Debug)]
pub(crate) enum EngineAction {
    /// Hand the request snapshot to the transport.
    Send { id: QueryId, request: SaRequest },
    /// The record reached a terminal state; claim it and deliver its
    /// outcome.
    Complete { id: QueryId },
}

/// A terminal record removed from the registry, ready for delivery.
pub(crate) struct Delivery {
    pub id: QueryId,
    pub outcome: QueryOutcome,
    self_issued: bool,
    terminal_state: QueryState,
    status_tx: watch::Sender<QueryState>,
    outcome_slot: OutcomeSlot,
    on_complete: Option<CompletionCallback>,
}

impl Delivery {
    /// Stage the outcome for the handle, publish the terminal state, and
    /// fire the completion callback. Runs with no registry lock held.
    pub fn dispatch(self) {
        if self.self_issued {
            debug!(query_id = %self.id, outcome = %self.outcome, "self-issued query finished");
        } else {
            info!(query_id = %self.id, outcome = %self.outcome, "query delivered");
            let mut slot = self
                .outcome_slot
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            *slot = Some(self.outcome.clone());
        }
        let _ = self.status_tx.send(self.terminal_state);
        if let Some(callback) = self.on_complete {
            callback(self.id, self.outcome);
        }
    }
}

/// Terminal disposition funneled through [`complete`].
pub(super) enum Completion {
    Success(ResultBuffer),
    Failure(QueryError),
    Cancelled,
}

// ============================================================================
// Allocation inputs and outputs
// ============================================================================

/// Everything needed to create one record.
pub(crate) struct AllocSpec {
    pub request: SaRequest,
    pub kind: CommandKind,
    pub max_retries: u32,
    pub attempt_timeout: Duration,
    pub priority: Priority,
    pub parent: Option<ParentLink>,
    pub self_issued: bool,
    pub on_complete: Option<CompletionCallback>,
}

/// Handle-side artifacts of a successful allocation.
#[derive(Debug)]
pub(crate) struct Allocated {
    pub id: QueryId,
    pub status_rx: watch::Receiver<QueryState>,
    pub outcome_slot: OutcomeSlot,
    /// Snapshot for the first send attempt.
    pub request: SaRequest,
}

// ============================================================================
// Registry
// ============================================================================

pub(super) struct RegistryInner {
    pub records: HashMap<QueryId, QueryRecord>,
    pub next_id: u64,
    /// Externally submitted records currently live; children and
    /// self-issued maintenance queries are not counted.
    pub outstanding: usize,
}

/// Mapping of correlation ids to query records for one transport.
///
/// Explicitly instantiated per engine; never a process-wide singleton.
pub(crate) struct QueryRegistry {
    max_outstanding: usize,
    inner: Mutex<RegistryInner>,
}

impl QueryRegistry {
    pub fn new(max_outstanding: usize) -> Self {
        QueryRegistry {
            max_outstanding,
            inner: Mutex::new(RegistryInner {
                records: HashMap::new(),
                next_id: 1,
                outstanding: 0,
            }),
        }
    }

    /// Acquire the structural lock, continuing past poisoning: every
    /// critical section leaves the map consistent before any call that
    /// could unwind.
    fn lock(&self) -> MutexGuard<'_, RegistryInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Number of live records, children included.
    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.lock().records.len()
    }

    /// Externally submitted records currently counted against the limit.
    pub fn outstanding(&self) -> usize {
        self.lock().outstanding
    }

    // ------------------------------------------------------------------
    // Allocation and send bookkeeping
    // ------------------------------------------------------------------

    /// Reserve a correlation id and insert a record in `ReadyToSend`.
    ///
    /// Fails with `ResourceExhausted` when the outstanding-query limit is
    /// reached; child and self-issued records are exempt from the limit.
    pub fn allocate(&self, spec: AllocSpec) -> Result<Allocated, SubmitError> {
        let mut inner = self.lock();
        let counted = spec.parent.is_none() && !spec.self_issued;
        if counted && inner.outstanding >= self.max_outstanding {
            warn!(
                limit = self.max_outstanding,
                "submission rejected, outstanding query limit reached"
            );
            return Err(SubmitError::ResourceExhausted {
                limit: self.max_outstanding,
            });
        }
        let allocated = insert_record(&mut inner, spec);
        debug!(query_id = %allocated.id, "query allocated");
        Ok(allocated)
    }

    /// Record a successful hand-off to the transport.
    pub fn mark_sent(&self, id: QueryId, now: Instant) {
        let mut inner = self.lock();
        if let Some(record) = inner.records.get_mut(&id) {
            if record.state == QueryState::ReadyToSend {
                record.control.note_send(now);
                record.set_state(QueryState::WaitingForResult);
            }
        }
    }

    /// Record a transiently failed send; the sweeper retries it after the
    /// retry interval.
    pub fn mark_send_deferred(&self, id: QueryId, now: Instant) {
        let mut inner = self.lock();
        if let Some(record) = inner.records.get_mut(&id) {
            if record.state == QueryState::ReadyToSend {
                record.control.note_send_deferred(now);
                record.set_state(QueryState::NotAbleToSend);
            }
        }
    }

    /// Fail a record immediately (fatal send error, transport error).
    pub fn fail(&self, id: QueryId, err: QueryError) -> Vec<EngineAction> {
        let mut actions = Vec::new();
        let mut inner = self.lock();
        let eligible = matches!(
            inner.records.get(&id).map(|r| r.state),
            Some(
                QueryState::ReadyToSend
                    | QueryState::NotAbleToSend
                    | QueryState::WaitingForResult
                    | QueryState::BusyRetryDelay
            )
        );
        if eligible {
            complete(&mut inner, id, Completion::Failure(err), &mut actions);
        }
        actions
    }

    // ------------------------------------------------------------------
    // Inbound transitions
    // ------------------------------------------------------------------

    /// The service reported busy; arm the backoff window. Does not consume
    /// the retry budget.
    pub fn note_busy(&self, id: QueryId, backoff_until: Instant) {
        let mut inner = self.lock();
        if let Some(record) = inner.records.get_mut(&id) {
            if record.state == QueryState::WaitingForResult {
                warn!(query_id = %id, "service busy, backing off before resend");
                record.control.start_backoff(backoff_until);
                record.set_state(QueryState::BusyRetryDelay);
            }
        }
    }

    /// Rewrite the record's destination and re-arm it for sending. Does not
    /// consume the retry budget.
    pub fn redirect(&self, id: QueryId, destination: SaDestination) -> Option<EngineAction> {
        let mut inner = self.lock();
        let record = inner.records.get_mut(&id)?;
        if !record.state.is_swept() {
            return None;
        }
        info!(query_id = %id, %destination, "query redirected");
        record.request.destination = destination;
        record.set_state(QueryState::ReadyToSend);
        Some(EngineAction::Send {
            id,
            request: record.request.clone(),
        })
    }

    /// Transport-reported reply timeout: retry if budget remains, else fail.
    pub fn timeout(&self, id: QueryId) -> Vec<EngineAction> {
        let mut actions = Vec::new();
        let mut inner = self.lock();
        let waiting = matches!(
            inner.records.get(&id).map(|r| r.state),
            Some(QueryState::WaitingForResult | QueryState::NotAbleToSend)
        );
        if waiting {
            expire(&mut inner, id, &mut actions);
        }
        actions
    }

    /// Begin response processing for a correlated reply.
    ///
    /// Transitions the record to `ProcessingResponse` and takes a scoped
    /// token whose existence blocks physical removal. Returns `None` when
    /// the id is unknown or not awaiting a reply (stale or duplicate
    /// responses are dropped by the caller).
    pub fn begin_processing(self: &Arc<Self>, id: QueryId) -> Option<ProcessingToken> {
        let mut inner = self.lock();
        let record = inner.records.get_mut(&id)?;
        if record.state != QueryState::WaitingForResult {
            return None;
        }
        record.processing_refcount += 1;
        record.set_state(QueryState::ProcessingResponse);
        Some(ProcessingToken {
            registry: Arc::clone(self),
            id,
            request: record.request.clone(),
            finished: false,
        })
    }

    /// Shared release path for [`ProcessingToken::finish`] and the token's
    /// drop guard. `decoded` is `None` when the token was dropped without
    /// finishing.
    fn finish_processing(
        &self,
        id: QueryId,
        decoded: Option<Result<DecodedResponse, DecodeError>>,
    ) -> Vec<EngineAction> {
        let mut actions = Vec::new();
        let mut inner = self.lock();
        let Some(record) = inner.records.get_mut(&id) else {
            debug_assert!(false, "record removed while processing refcount held");
            return actions;
        };
        debug_assert!(record.processing_refcount > 0, "unbalanced processing release");
        record.processing_refcount = record.processing_refcount.saturating_sub(1);
        if record.processing_refcount > 0 {
            return actions;
        }

        // A cancel latched while this thread was decoding wins over the
        // decode result.
        if record.destroy_pending {
            debug!(query_id = %id, "applying deferred destroy after processing");
            complete(&mut inner, id, Completion::Cancelled, &mut actions);
            return actions;
        }

        match decoded {
            Some(Ok(DecodedResponse::Records(buffer))) => {
                complete(&mut inner, id, Completion::Success(buffer), &mut actions);
            }
            Some(Ok(DecodedResponse::FanOut { children })) => {
                aggregate::fan_out(&mut inner, id, children, &mut actions);
            }
            Some(Ok(DecodedResponse::Error { protocol_status })) => {
                if let Some(record) = inner.records.get_mut(&id) {
                    record.protocol_status = protocol_status;
                }
                complete(
                    &mut inner,
                    id,
                    Completion::Failure(QueryError::Protocol {
                        status: protocol_status,
                    }),
                    &mut actions,
                );
            }
            Some(Err(err)) => {
                complete(
                    &mut inner,
                    id,
                    Completion::Failure(QueryError::Decode(err.to_string())),
                    &mut actions,
                );
            }
            None => {
                complete(
                    &mut inner,
                    id,
                    Completion::Failure(QueryError::Decode(
                        "response processing aborted".into(),
                    )),
                    &mut actions,
                );
            }
        }
        actions
    }

    // ------------------------------------------------------------------
    // Sweep
    // ------------------------------------------------------------------

    /// Scan for elapsed deadlines and drive the affected records through
    /// the retry/fail path. `ReadyToSend` records are exempt.
    ///
    /// Eligible resends are ordered by priority, highest first.
    pub fn sweep(&self, now: Instant) -> Vec<EngineAction> {
        enum Due {
            Expired,
            BackoffOver,
        }

        let mut actions = Vec::new();
        let mut inner = self.lock();
        let mut due: Vec<(Priority, QueryId, Due)> = Vec::new();
        for record in inner.records.values() {
            match record.state {
                QueryState::WaitingForResult | QueryState::NotAbleToSend
                    if record.control.deadline_elapsed(now) =>
                {
                    due.push((record.priority, record.id, Due::Expired));
                }
                QueryState::BusyRetryDelay if record.control.backoff_elapsed(now) => {
                    due.push((record.priority, record.id, Due::BackoffOver));
                }
                _ => {}
            }
        }
        due.sort_by(|a, b| b.0.cmp(&a.0));

        for (_, id, kind) in due {
            match kind {
                Due::Expired => expire(&mut inner, id, &mut actions),
                Due::BackoffOver => {
                    let Some(record) = inner.records.get_mut(&id) else {
                        continue;
                    };
                    debug!(query_id = %id, "busy backoff elapsed, resending");
                    record.set_state(QueryState::ReadyToSend);
                    actions.push(EngineAction::Send {
                        id,
                        request: record.request.clone(),
                    });
                }
            }
        }
        actions
    }

    // ------------------------------------------------------------------
    // Cancellation and delivery
    // ------------------------------------------------------------------

    /// Cancel a record, honoring the deferred-destroy rule, and dispatch
    /// any resulting deliveries. Idempotent; always returns immediately.
    pub fn cancel(&self, id: QueryId) {
        let mut actions = Vec::new();
        {
            let mut inner = self.lock();
            cancel_record(&mut inner, id, &mut actions);
        }
        self.dispatch_completions(actions);
    }

    /// Cancel every live top-level record; children are cancelled through
    /// their parents. Used at engine shutdown.
    pub fn cancel_all(&self) {
        let mut actions = Vec::new();
        {
            let mut inner = self.lock();
            let top_level: Vec<QueryId> = inner
                .records
                .values()
                .filter(|r| r.parent.is_none())
                .map(|r| r.id)
                .collect();
            if !top_level.is_empty() {
                info!(count = top_level.len(), "cancelling all outstanding queries");
            }
            for id in top_level {
                cancel_record(&mut inner, id, &mut actions);
            }
        }
        self.dispatch_completions(actions);
    }

    /// Remove and deliver a record once terminal. Returns `None` when the
    /// id is unknown or the record has not reached a terminal state.
    pub fn remove_if_terminal(&self, id: QueryId) -> Option<Delivery> {
        let record = {
            let mut inner = self.lock();
            if !inner.records.get(&id)?.state.is_terminal() {
                return None;
            }
            remove_record(&mut inner, id)?
        };
        debug_assert_eq!(record.processing_refcount, 0);
        let outcome = match record.state {
            QueryState::QueryDestroy => QueryOutcome::Cancelled,
            _ => match record.failure {
                Some(err) => QueryOutcome::Failure(err),
                None => QueryOutcome::Success(record.result.unwrap_or_default()),
            },
        };
        Some(Delivery {
            id,
            outcome,
            self_issued: record.self_issued,
            terminal_state: record.state,
            status_tx: record.status_tx,
            outcome_slot: record.outcome_slot,
            on_complete: record.on_complete,
        })
    }

    /// Dispatch completion actions produced by a cancel path. Cancellation
    /// never schedules sends.
    fn dispatch_completions(&self, actions: Vec<EngineAction>) {
        for action in actions {
            match action {
                EngineAction::Complete { id } => {
                    if let Some(delivery) = self.remove_if_terminal(id) {
                        delivery.dispatch();
                    }
                }
                EngineAction::Send { id, .. } => {
                    debug_assert!(false, "cancel path produced a send");
                    error!(query_id = %id, "dropping unexpected send during cancellation");
                }
            }
        }
    }
}

// ============================================================================
// Processing token
// ============================================================================

/// Scoped access token for decoding one response outside the registry lock.
///
/// Holding the token pins the record: cancellation is latched rather than
/// applied while it exists. Dropping the token without calling
/// [`ProcessingToken::finish`] releases the reference and fails the record.
pub(crate) struct ProcessingToken {
    registry: Arc<QueryRegistry>,
    id: QueryId,
    request: SaRequest,
    finished: bool,
}

impl ProcessingToken {
    pub fn id(&self) -> QueryId {
        self.id
    }

    pub fn request(&self) -> &SaRequest {
        &self.request
    }

    /// Release the processing reference and apply the decode result.
    pub fn finish(
        mut self,
        decoded: Result<DecodedResponse, DecodeError>,
    ) -> Vec<EngineAction> {
        self.finished = true;
        self.registry.finish_processing(self.id, Some(decoded))
    }
}

impl Drop for ProcessingToken {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        // Reached only if decoding unwound; release the reference so the
        // record cannot leak with a nonzero refcount.
        let actions = self.registry.finish_processing(self.id, None);
        for action in actions {
            match action {
                EngineAction::Complete { id } => {
                    if let Some(delivery) = self.registry.remove_if_terminal(id) {
                        delivery.dispatch();
                    }
                }
                EngineAction::Send { id, .. } => {
                    error!(query_id = %id, "dropping send scheduled by aborted processing");
                }
            }
        }
    }
}

// ============================================================================
// Lock-held helpers (free functions over RegistryInner)
// ============================================================================

/// Insert a new record in `ReadyToSend`. Caller enforces the outstanding
/// limit; child and self-issued allocations bypass it.
pub(super) fn insert_record(inner: &mut RegistryInner, spec: AllocSpec) -> Allocated {
    let id = QueryId::new(inner.next_id);
    inner.next_id += 1;
    let (status_tx, status_rx) = watch::channel(QueryState::ReadyToSend);
    let outcome_slot: OutcomeSlot = Arc::new(Mutex::new(None));
    let counted = spec.parent.is_none() && !spec.self_issued;
    let request = spec.request.clone();
    let record = QueryRecord {
        id,
        kind: spec.kind,
        request: spec.request,
        state: QueryState::ReadyToSend,
        control: RetryControl::new(spec.max_retries, spec.attempt_timeout),
        priority: spec.priority,
        parent: spec.parent,
        children: None,
        processing_refcount: 0,
        destroy_pending: false,
        self_issued: spec.self_issued,
        counted,
        result: None,
        failure: None,
        protocol_status: 0,
        status_tx,
        outcome_slot: Arc::clone(&outcome_slot),
        on_complete: spec.on_complete,
    };
    inner.records.insert(id, record);
    if counted {
        inner.outstanding += 1;
    }
    Allocated {
        id,
        status_rx,
        outcome_slot,
        request,
    }
}

/// Remove a record, adjusting the outstanding count.
fn remove_record(inner: &mut RegistryInner, id: QueryId) -> Option<QueryRecord> {
    let record = inner.records.remove(&id)?;
    if record.counted {
        inner.outstanding = inner.outstanding.saturating_sub(1);
    }
    Some(record)
}

/// Drive a record to a terminal disposition.
///
/// Top-level records stay in the map in `QueryComplete`/`QueryDestroy` until
/// claimed through `remove_if_terminal`; child records are removed here and
/// reported to their parent's aggregation.
pub(super) fn complete(
    inner: &mut RegistryInner,
    id: QueryId,
    completion: Completion,
    actions: &mut Vec<EngineAction>,
) {
    let Some(parent) = inner.records.get(&id).map(|r| r.parent) else {
        debug_assert!(false, "completing a missing record");
        return;
    };

    if let Some(link) = parent {
        let Some(record) = remove_record(inner, id) else {
            return;
        };
        debug_assert_eq!(record.processing_refcount, 0);
        let outcome = match completion {
            Completion::Success(buffer) => {
                debug!(query_id = %id, records = buffer.record_count(), "child query succeeded");
                ChildOutcome::Success(buffer)
            }
            Completion::Failure(err) => {
                debug!(query_id = %id, error = %err, "child query failed");
                ChildOutcome::Failure(err)
            }
            Completion::Cancelled => ChildOutcome::Cancelled,
        };
        aggregate::child_terminal(inner, link, outcome, actions);
        return;
    }

    let Some(record) = inner.records.get_mut(&id) else {
        return;
    };
    match completion {
        Completion::Success(buffer) => {
            record.result = Some(buffer);
            record.set_state(QueryState::QueryComplete);
        }
        Completion::Failure(err) => {
            if let QueryError::Protocol { status } = &err {
                record.protocol_status = *status;
            }
            record.failure = Some(err);
            record.set_state(QueryState::QueryComplete);
        }
        Completion::Cancelled => {
            record.set_state(QueryState::QueryDestroy);
        }
    }
    actions.push(EngineAction::Complete { id });
}

/// Timeout-driven retry: consume one retry and re-arm the send, or fail the
/// record when the budget is exhausted.
pub(super) fn expire(inner: &mut RegistryInner, id: QueryId, actions: &mut Vec<EngineAction>) {
    let Some(record) = inner.records.get_mut(&id) else {
        return;
    };
    if record.control.consume_retry() {
        warn!(
            query_id = %id,
            retries_left = record.control.retries_left,
            "query timed out, retrying"
        );
        record.set_state(QueryState::ReadyToSend);
        actions.push(EngineAction::Send {
            id,
            request: record.request.clone(),
        });
    } else {
        let attempts = record.control.attempts;
        warn!(query_id = %id, attempts, "retry budget exhausted");
        complete(
            inner,
            id,
            Completion::Failure(QueryError::Timeout { attempts }),
            actions,
        );
    }
}

/// Cancel one record. Processing records are latched for deferred destroy;
/// composite parents wait for their children to resolve.
pub(super) fn cancel_record(
    inner: &mut RegistryInner,
    id: QueryId,
    actions: &mut Vec<EngineAction>,
) {
    let Some(record) = inner.records.get_mut(&id) else {
        return;
    };

    if record.state.is_terminal() {
        // Staged for delivery but not yet claimed: flip to destroy so the
        // delivery reports Cancelled instead of the staged outcome.
        record.state = QueryState::QueryDestroy;
        return;
    }

    if record.is_processing() {
        debug!(query_id = %id, "cancel latched while response processing in flight");
        record.destroy_pending = true;
        return;
    }

    if record.children.is_some() {
        record.destroy_pending = true;
        let mut live = Vec::new();
        if let Some(children) = record.children.as_mut() {
            while let Some((slot, _)) = children.queued.pop_front() {
                children.slots[slot].outcome = Some(ChildOutcome::Cancelled);
            }
            for slot in &children.slots {
                if slot.outcome.is_none() {
                    if let Some(child_id) = slot.id {
                        live.push(child_id);
                    }
                }
            }
        }
        debug!(query_id = %id, live_children = live.len(), "cancelling composite query");
        for child_id in live {
            cancel_record(inner, child_id, actions);
        }
        // All children may already have resolved (or were only queued).
        aggregate::maybe_complete_parent(inner, id, actions);
        return;
    }

    complete(inner, id, Completion::Cancelled, actions);
}
