//! Transport seam between the engine and the fabric.
//!
//! The engine only needs two things from a transport: a non-blocking way to
//! send an encoded request datagram, and an inbound event stream delivering
//! correlated responses, busy indications, redirects, and transport-level
//! timeouts or errors. Device/port handling, RMPP segmentation, and wire
//! encoding all live behind this seam.

mod channel;

pub use channel::{ChannelTransport, OutboundDatagram};

use thiserror::Error;
use tokio::sync::mpsc;

use crate::engine::{QueryId, SaDestination, SaRequest};

/// Send-side failure, split by whether the condition is worth retrying.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SendError {
    /// Momentary condition (no transmit buffer, port briefly busy); the
    /// sweeper retries the send after the retry interval.
    #[error("transient send failure: {0}")]
    Transient(String),

    /// Unrecoverable condition (port down, invalid state); the query fails
    /// immediately.
    #[error("fatal send failure: {0}")]
    Fatal(String),
}

impl SendError {
    pub fn transient(message: impl Into<String>) -> Self {
        SendError::Transient(message.into())
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        SendError::Fatal(message.into())
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, SendError::Transient(_))
    }
}

/// One event on the transport's inbound path, already matched to a
/// correlation id by the wire layer.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// A correlated response payload arrived.
    Response { id: QueryId, payload: Vec<u8> },
    /// The service asked the client to resend to a different endpoint.
    Redirect {
        id: QueryId,
        destination: SaDestination,
    },
    /// The service reported busy; back off before resending.
    Busy { id: QueryId },
    /// The transport gave up waiting for a reply. The engine's own sweeper
    /// produces the same transition, so transports without reply timers may
    /// simply never emit this.
    Timeout { id: QueryId },
    /// The transport failed this query unrecoverably.
    TransportError { id: QueryId, cause: String },
}

impl TransportEvent {
    /// Correlation id this event refers to.
    pub fn id(&self) -> QueryId {
        match self {
            TransportEvent::Response { id, .. }
            | TransportEvent::Redirect { id, .. }
            | TransportEvent::Busy { id }
            | TransportEvent::Timeout { id }
            | TransportEvent::TransportError { id, .. } => *id,
        }
    }
}

/// Producer half of the inbound event stream, held by the transport.
pub type InboundSender = mpsc::UnboundedSender<TransportEvent>;

/// Consumer half of the inbound event stream, owned by the engine task.
pub type InboundReceiver = mpsc::UnboundedReceiver<TransportEvent>;

/// Create the inbound event channel wiring a transport to an engine.
pub fn inbound_channel() -> (InboundSender, InboundReceiver) {
    mpsc::unbounded_channel()
}

/// One open send path to the subnet administrator.
///
/// `send` must not block: it either hands the datagram to the wire layer or
/// reports why it could not. Implementations are called concurrently from
/// the engine task, the sweeper task, and submitting threads.
pub trait SaTransport: Send + Sync {
    fn send(
        &self,
        id: QueryId,
        destination: &SaDestination,
        request: &SaRequest,
    ) -> Result<(), SendError>;

    /// Short name for log output.
    fn name(&self) -> &str;
}
