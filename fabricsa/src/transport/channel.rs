//! In-process channel transport.
//!
//! Forwards outbound datagrams onto an mpsc channel for an external
//! responder (a wire layer task, a simulator, or a test harness) and leaves
//! the inbound path to whatever holds the matching [`InboundSender`]. Used
//! by integration tests and by embedders that drive the wire layer
//! themselves.

use tokio::sync::mpsc;

use super::{SaTransport, SendError};
use crate::engine::{QueryId, SaDestination, SaRequest};

/// One outbound request datagram captured by the channel transport.
#[derive(Debug, Clone)]
pub struct OutboundDatagram {
    pub id: QueryId,
    pub destination: SaDestination,
    pub attribute: u16,
    pub payload: Vec<u8>,
}

/// Transport that hands outbound datagrams to an in-process consumer.
pub struct ChannelTransport {
    outbound: mpsc::UnboundedSender<OutboundDatagram>,
}

impl ChannelTransport {
    /// Create the transport and the receiver its datagrams arrive on.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<OutboundDatagram>) {
        let (outbound, rx) = mpsc::unbounded_channel();
        (ChannelTransport { outbound }, rx)
    }
}

impl SaTransport for ChannelTransport {
    fn send(
        &self,
        id: QueryId,
        destination: &SaDestination,
        request: &SaRequest,
    ) -> Result<(), SendError> {
        let datagram = OutboundDatagram {
            id,
            destination: *destination,
            attribute: request.attribute,
            payload: request.payload.clone(),
        };
        self.outbound
            .send(datagram)
            .map_err(|_| SendError::fatal("outbound channel closed"))
    }

    fn name(&self) -> &str {
        "channel"
    }
}
