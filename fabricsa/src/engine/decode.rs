//! Response decoding seam.
//!
//! Wire formats (MAD headers, RMPP reassembly, attribute layouts) live
//! outside the engine. The engine hands a correlated response payload to a
//! [`ResponseDecoder`] and acts on the shape that comes back: plain records,
//! a child fan-out plan, or a protocol-level error status.

use thiserror::Error;

use super::query::{ResultBuffer, SaRequest};

/// A response payload that could not be interpreted.
///
/// Treated as terminal by the engine: resending would reproduce the same
/// bytes unless the service itself is misbehaving.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct DecodeError(pub String);

/// Decoded meaning of one correlated response.
#[derive(Debug, Clone)]
pub enum DecodedResponse {
    /// The response carried result records; the query is done.
    Records(ResultBuffer),
    /// The response requires follow-up sub-queries before the caller can be
    /// answered. Child order here fixes the result slot order.
    FanOut { children: Vec<SaRequest> },
    /// The service answered with a defined error status.
    Error { protocol_status: u16 },
}

/// Decodes correlated response payloads for the engine.
///
/// Implementations must be cheap to call concurrently; the engine invokes
/// `decode` without holding any registry lock.
pub trait ResponseDecoder: Send + Sync {
    fn decode(
        &self,
        request: &SaRequest,
        payload: &[u8],
    ) -> Result<DecodedResponse, DecodeError>;
}
