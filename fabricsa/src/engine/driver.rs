//! Engine task: inbound event dispatch and send execution.
//!
//! Wiring overview:
//!
//! ```text
//!   SaClient ──submit──▶ QueryRegistry ◀──sweep── TimeoutSweeper
//!                            │  ▲
//!                   actions  │  │ transitions
//!                            ▼  │
//!   transport events ──▶ QueryEngine ──send──▶ SaTransport
//! ```
//!
//! Registry transitions return action lists (sends, deliveries) that the
//! engine executes with no registry lock held, so transport calls, response
//! decoding, and completion callbacks never block other threads out of the
//! registry.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::transport::{InboundReceiver, SaTransport, SendError, TransportEvent};

use super::client::SaClient;
use super::config::EngineConfig;
use super::decode::ResponseDecoder;
use super::error::QueryError;
use super::query::{QueryId, SaRequest};
use super::registry::{EngineAction, QueryRegistry};
use super::sweeper::TimeoutSweeper;

/// Shared internals behind the engine task, the client facade, and the
/// sweeper.
pub(crate) struct EngineCore {
    pub registry: Arc<QueryRegistry>,
    pub transport: Arc<dyn SaTransport>,
    pub decoder: Arc<dyn ResponseDecoder>,
    pub config: EngineConfig,
    /// Set once the engine task has exited; submissions are rejected from
    /// then on, since nothing would drive them to completion.
    down: AtomicBool,
}

impl EngineCore {
    /// Whether the engine task has stopped.
    pub fn is_down(&self) -> bool {
        self.down.load(Ordering::Acquire)
    }

    fn mark_down(&self) {
        self.down.store(true, Ordering::Release);
    }

    /// Execute deferred work produced by a registry transition.
    pub fn apply(&self, actions: Vec<EngineAction>) {
        for action in actions {
            match action {
                EngineAction::Send { id, request } => self.issue_send(id, request),
                EngineAction::Complete { id } => {
                    if let Some(delivery) = self.registry.remove_if_terminal(id) {
                        delivery.dispatch();
                    }
                }
            }
        }
    }

    /// Hand one request to the transport and record the result.
    pub fn issue_send(&self, id: QueryId, request: SaRequest) {
        match self.transport.send(id, &request.destination, &request) {
            Ok(()) => {
                debug!(
                    query_id = %id,
                    attribute = request.attribute,
                    transport = self.transport.name(),
                    "request sent"
                );
                self.registry.mark_sent(id, Instant::now());
            }
            Err(SendError::Transient(cause)) => {
                warn!(query_id = %id, cause = %cause, "transient send failure, deferring");
                self.registry.mark_send_deferred(id, Instant::now());
            }
            Err(SendError::Fatal(cause)) => {
                error!(query_id = %id, cause = %cause, "fatal send failure");
                let actions = self.registry.fail(id, QueryError::SendFailed(cause));
                self.apply(actions);
            }
        }
    }

    /// Dispatch one inbound transport event.
    pub fn handle_event(&self, event: TransportEvent) {
        match event {
            TransportEvent::Response { id, payload } => match self.registry.begin_processing(id) {
                Some(token) => {
                    // Decode runs outside the registry lock; the token pins
                    // the record against concurrent removal.
                    let decoded = self.decoder.decode(token.request(), &payload);
                    debug!(query_id = %token.id(), ok = decoded.is_ok(), "response decoded");
                    let actions = token.finish(decoded);
                    self.apply(actions);
                }
                None => {
                    debug!(query_id = %id, "dropping stale or uncorrelated response");
                }
            },
            TransportEvent::Redirect { id, destination } => {
                if let Some(action) = self.registry.redirect(id, destination) {
                    self.apply(vec![action]);
                }
            }
            TransportEvent::Busy { id } => {
                let backoff = self.config.busy_backoff + self.backoff_jitter();
                self.registry.note_busy(id, Instant::now() + backoff);
            }
            TransportEvent::Timeout { id } => {
                let actions = self.registry.timeout(id);
                self.apply(actions);
            }
            TransportEvent::TransportError { id, cause } => {
                warn!(query_id = %id, cause = %cause, "transport error");
                let actions = self.registry.fail(id, QueryError::Transport(cause));
                self.apply(actions);
            }
        }
    }

    /// One timeout sweep pass.
    pub fn sweep_once(&self) {
        let actions = self.registry.sweep(Instant::now());
        if !actions.is_empty() {
            debug!(actions = actions.len(), "sweep produced work");
        }
        self.apply(actions);
    }

    /// Randomized addition to the busy backoff so backed-off clients do not
    /// resend in lockstep.
    fn backoff_jitter(&self) -> Duration {
        let max_ms = self.config.busy_jitter.as_millis() as u64;
        if max_ms == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rand::thread_rng().gen_range(0..=max_ms))
    }
}

/// The engine task. Owns the inbound event stream; everything else is
/// shared through [`EngineCore`].
pub struct QueryEngine {
    core: Arc<EngineCore>,
    inbound: InboundReceiver,
}

impl QueryEngine {
    /// Build an engine and its client facade over one transport.
    ///
    /// `inbound` is the receiving half of the channel the transport (or its
    /// wire-layer task) delivers events on; create it with
    /// [`crate::transport::inbound_channel`].
    pub fn new(
        transport: Arc<dyn SaTransport>,
        decoder: Arc<dyn ResponseDecoder>,
        config: EngineConfig,
        inbound: InboundReceiver,
    ) -> (Self, SaClient) {
        let registry = Arc::new(QueryRegistry::new(config.max_outstanding));
        let core = Arc::new(EngineCore {
            registry,
            transport,
            decoder,
            config,
            down: AtomicBool::new(false),
        });
        let engine = QueryEngine {
            core: Arc::clone(&core),
            inbound,
        };
        (engine, SaClient::new(core))
    }

    /// Run until `shutdown` fires or the inbound channel closes.
    ///
    /// On exit every outstanding query is cancelled and delivered as
    /// `Cancelled`, so no waiter is left hanging.
    pub async fn run(mut self, shutdown: CancellationToken) {
        info!(transport = self.core.transport.name(), "query engine started");

        let sweeper = TimeoutSweeper::new(Arc::clone(&self.core));
        let sweep_task = tokio::spawn(sweeper.run(shutdown.clone()));

        loop {
            tokio::select! {
                biased;

                _ = shutdown.cancelled() => {
                    info!("query engine shutdown requested");
                    break;
                }

                event = self.inbound.recv() => {
                    match event {
                        Some(event) => self.core.handle_event(event),
                        None => {
                            info!("inbound event channel closed");
                            break;
                        }
                    }
                }
            }
        }

        // Reject further submissions before draining, so nothing slips into
        // the registry after the last cancel pass.
        self.core.mark_down();

        // Stop the sweeper even when the loop exited from channel closure.
        shutdown.cancel();
        let _ = sweep_task.await;

        self.core.registry.cancel_all();
        info!("query engine stopped");
    }
}
