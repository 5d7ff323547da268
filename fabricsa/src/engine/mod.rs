//! Query engine subsystem.
//!
//! Tracks every outstanding subnet administration request through its
//! retry/timeout lifecycle, aggregates composite fan-outs, and keeps
//! cancellation safe against responses being decoded concurrently.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────┐ submit  ┌───────────────┐         ┌────────────────┐
//! │ SaClient │────────▶│ QueryRegistry │◀────────│ TimeoutSweeper │
//! └──────────┘         │  id ─▶ record │  sweep  └────────────────┘
//!      │               └───────┬───────┘
//!      ▼ handle                │ actions (send / deliver)
//! ┌─────────────┐              ▼
//! │ QueryHandle │      ┌─────────────┐  send   ┌─────────────┐
//! │ poll/wait/  │      │ QueryEngine │────────▶│ SaTransport │
//! │ cancel      │      │  event loop │◀────────│  (inbound)  │
//! └─────────────┘      └─────────────┘ events  └─────────────┘
//! ```
//!
//! The registry's lock is the single serialization point for structural
//! state; response decoding and outcome delivery always run outside it. A
//! record whose response is mid-decode is pinned by a processing token, so
//! a concurrent cancel is latched and applied when the token is released
//! rather than freeing the record out from under the decoder.

mod aggregate;
mod client;
mod config;
mod decode;
mod driver;
mod error;
mod handle;
mod query;
mod record;
mod registry;
mod state;
mod sweeper;

// Client surface
pub use client::SaClient;
pub use driver::QueryEngine;
pub use handle::QueryHandle;

// Request/result types
pub use query::{
    CommandKind, FanOutMode, Priority, QueryId, QueryOptions, QueryOutcome, ResultBuffer,
    SaDestination, SaRequest,
};
pub use state::QueryState;

// Configuration
pub use config::{
    EngineConfig, DEFAULT_ATTEMPT_TIMEOUT, DEFAULT_BUSY_BACKOFF, DEFAULT_BUSY_JITTER,
    DEFAULT_MAX_OUTSTANDING, DEFAULT_RETRY_COUNT, DEFAULT_SWEEP_INTERVAL,
};

// Decode seam
pub use decode::{DecodeError, DecodedResponse, ResponseDecoder};

// Errors
pub use error::{QueryError, SubmitError};
