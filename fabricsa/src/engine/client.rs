//! Submission facade handed to calling code.

use std::sync::Arc;

use tracing::info;

use super::driver::EngineCore;
use super::error::SubmitError;
use super::handle::QueryHandle;
use super::query::{CommandKind, QueryId, QueryOptions, QueryOutcome, SaRequest};
use super::record::CompletionCallback;
use super::registry::AllocSpec;

/// Cheaply cloneable entry point for submitting queries to one engine.
///
/// Submission registers the record and issues the first send attempt before
/// returning; completion is observed through the returned handle (poll,
/// await, or callback), never by blocking inside the engine.
#[derive(Clone)]
pub struct SaClient {
    core: Arc<EngineCore>,
}

impl SaClient {
    pub(crate) fn new(core: Arc<EngineCore>) -> Self {
        SaClient { core }
    }

    /// Submit an information query.
    ///
    /// # Errors
    ///
    /// Returns `ResourceExhausted` when the outstanding-query limit is
    /// reached (back off and resubmit), or `EngineDown` once the engine
    /// task has stopped.
    pub fn submit(
        &self,
        request: SaRequest,
        options: QueryOptions,
    ) -> Result<QueryHandle, SubmitError> {
        self.submit_inner(request, options, CommandKind::InformationQuery, false, None)
    }

    /// Submit a fabric-mutating operation.
    ///
    /// `on_complete` fires exactly once with the terminal outcome, with no
    /// engine lock held. The returned handle can still be polled or
    /// awaited.
    pub fn submit_operation<F>(
        &self,
        request: SaRequest,
        options: QueryOptions,
        on_complete: F,
    ) -> Result<QueryHandle, SubmitError>
    where
        F: FnOnce(QueryId, QueryOutcome) + Send + 'static,
    {
        self.submit_inner(
            request,
            options,
            CommandKind::FabricOperation,
            false,
            Some(Box::new(on_complete)),
        )
    }

    /// Submit a maintenance query on the engine's own behalf.
    ///
    /// Exempt from the outstanding-query limit; the outcome is logged and
    /// discarded rather than delivered.
    pub fn submit_detached(&self, request: SaRequest) -> Result<QueryId, SubmitError> {
        let handle = self.submit_inner(
            request,
            QueryOptions::default(),
            CommandKind::InformationQuery,
            true,
            None,
        )?;
        Ok(handle.id())
    }

    /// Externally submitted queries currently outstanding.
    pub fn outstanding(&self) -> usize {
        self.core.registry.outstanding()
    }

    fn submit_inner(
        &self,
        request: SaRequest,
        options: QueryOptions,
        kind: CommandKind,
        self_issued: bool,
        on_complete: Option<CompletionCallback>,
    ) -> Result<QueryHandle, SubmitError> {
        if self.core.is_down() {
            return Err(SubmitError::EngineDown);
        }
        let config = &self.core.config;
        let attribute = request.attribute;
        let allocated = self.core.registry.allocate(AllocSpec {
            request,
            kind,
            max_retries: options.max_retries.unwrap_or(config.max_retries),
            attempt_timeout: options
                .per_attempt_timeout
                .unwrap_or(config.attempt_timeout),
            priority: options.priority,
            parent: None,
            self_issued,
            on_complete,
        })?;
        info!(query_id = %allocated.id, attribute, kind = %kind, "query submitted");

        self.core.issue_send(allocated.id, allocated.request);

        Ok(QueryHandle::new(
            allocated.id,
            Arc::clone(&self.core.registry),
            allocated.status_rx,
            allocated.outcome_slot,
        ))
    }
}
