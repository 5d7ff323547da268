//! # fabricsa
//!
//! Client-side Subnet Administration (SA) query engine for fabric
//! management. Issues requests to a subnet administrator over an unreliable
//! datagram transport, tracks each one through a retry/timeout protocol,
//! fans composite queries out into child sub-queries with deterministic
//! result aggregation, and keeps cancellation safe while responses are
//! being decoded on other threads.
//!
//! Wire encoding, RMPP segmentation, and device/port handling stay outside
//! this crate behind the [`transport::SaTransport`] and
//! [`engine::ResponseDecoder`] seams.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use fabricsa::engine::{EngineConfig, QueryEngine, QueryOptions, SaRequest};
//! use fabricsa::transport::{inbound_channel, ChannelTransport};
//! use tokio_util::sync::CancellationToken;
//!
//! # struct NodeRecordDecoder;
//! # impl fabricsa::engine::ResponseDecoder for NodeRecordDecoder {
//! #     fn decode(
//! #         &self,
//! #         _request: &SaRequest,
//! #         payload: &[u8],
//! #     ) -> Result<fabricsa::engine::DecodedResponse, fabricsa::engine::DecodeError> {
//! #         Ok(fabricsa::engine::DecodedResponse::Records(
//! #             fabricsa::engine::ResultBuffer::from_records(vec![payload.to_vec()]),
//! #         ))
//! #     }
//! # }
//! # async fn example() {
//! let (inbound_tx, inbound_rx) = inbound_channel();
//! let (transport, _outbound) = ChannelTransport::new();
//! // A wire-layer task consumes `_outbound` and feeds `inbound_tx`.
//!
//! let (engine, client) = QueryEngine::new(
//!     Arc::new(transport),
//!     Arc::new(NodeRecordDecoder),
//!     EngineConfig::default(),
//!     inbound_rx,
//! );
//! let shutdown = CancellationToken::new();
//! tokio::spawn(engine.run(shutdown.clone()));
//!
//! let mut handle = client
//!     .submit(SaRequest::new(0x0011, vec![]), QueryOptions::default())
//!     .expect("within the outstanding limit");
//! let outcome = handle.wait().await;
//! println!("query finished: {}", outcome);
//! # shutdown.cancel();
//! # }
//! ```

pub mod engine;
pub mod logging;
pub mod transport;
