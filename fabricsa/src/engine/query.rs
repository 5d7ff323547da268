//! Request and result types exchanged with the query engine.
//!
//! The engine treats request payloads and result records as opaque bytes;
//! attribute encoding and decoding belong to the transport-side collaborators.

use std::fmt;
use std::time::Duration;

use super::error::QueryError;

/// Correlation identifier for one outstanding query.
///
/// Embedded in the outbound request and echoed back in its response, it is
/// the key used to match asynchronous replies to registry records. Unique
/// among live records; never reused while the record is present.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct QueryId(u64);

impl QueryId {
    pub(crate) fn new(raw: u64) -> Self {
        QueryId(raw)
    }

    /// Raw correlation value carried on the wire.
    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for QueryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "q-{:08x}", self.0)
    }
}

/// The two request variants the engine tracks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandKind {
    /// Read-only query returning records to the caller.
    InformationQuery,
    /// Fabric-mutating operation completing through a callback.
    FabricOperation,
}

impl fmt::Display for CommandKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CommandKind::InformationQuery => write!(f, "information-query"),
            CommandKind::FabricOperation => write!(f, "fabric-operation"),
        }
    }
}

/// Child issue discipline for composite queries.
///
/// A property of the command kind, not a runtime choice: serialized families
/// issue child k+1 only after child k completes, parallel families issue all
/// children at once.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FanOutMode {
    Parallel,
    Serialized,
}

/// Addressing for the subnet administrator endpoint.
///
/// Updated in place when the service redirects the query to another GSI
/// endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SaDestination {
    pub lid: u16,
    pub qp: u32,
    pub qkey: u32,
    pub sl: u8,
}

impl Default for SaDestination {
    /// The well-known GSI queue pair for subnet administration.
    fn default() -> Self {
        SaDestination {
            lid: 0,
            qp: 1,
            qkey: 1,
            sl: 0,
        }
    }
}

impl fmt::Display for SaDestination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "lid={:#06x} qp={} sl={}", self.lid, self.qp, self.sl)
    }
}

/// One encoded request to the subnet administrator.
#[derive(Debug, Clone)]
pub struct SaRequest {
    /// SA attribute identifier; opaque to the engine, meaningful to the
    /// decoder and to the service.
    pub attribute: u16,
    /// Encoded component mask and record, ready for the wire.
    pub payload: Vec<u8>,
    /// Current destination; redirects rewrite this.
    pub destination: SaDestination,
    /// Issue discipline applied if this request fans out into children.
    pub fan_out: FanOutMode,
}

impl SaRequest {
    pub fn new(attribute: u16, payload: Vec<u8>) -> Self {
        SaRequest {
            attribute,
            payload,
            destination: SaDestination::default(),
            fan_out: FanOutMode::Parallel,
        }
    }

    pub fn with_destination(mut self, destination: SaDestination) -> Self {
        self.destination = destination;
        self
    }

    /// Mark this request's child fan-out as serialized.
    pub fn serialized(mut self) -> Self {
        self.fan_out = FanOutMode::Serialized;
        self
    }
}

/// Resend ordering hint used when the sweeper re-issues eligible records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Priority(u8);

impl Priority {
    pub const LOW: Priority = Priority(10);
    pub const NORMAL: Priority = Priority(50);
    pub const HIGH: Priority = Priority(90);

    pub fn new(value: u8) -> Self {
        Priority(value)
    }

    pub fn value(&self) -> u8 {
        self.0
    }
}

impl Default for Priority {
    fn default() -> Self {
        Priority::NORMAL
    }
}

/// Per-submission overrides of the engine's retry policy.
///
/// Fields left unset fall back to the engine configuration defaults.
#[derive(Debug, Clone, Default)]
pub struct QueryOptions {
    pub max_retries: Option<u32>,
    pub per_attempt_timeout: Option<Duration>,
    pub priority: Priority,
}

impl QueryOptions {
    pub fn new() -> Self {
        QueryOptions::default()
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    pub fn with_timeout(mut self, per_attempt_timeout: Duration) -> Self {
        self.per_attempt_timeout = Some(per_attempt_timeout);
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }
}

/// Accumulated result records for one query.
///
/// For composite queries each child's records land at the slot matching its
/// fan-out position, so the flattened order here is deterministic regardless
/// of the order in which children actually completed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResultBuffer {
    records: Vec<Vec<u8>>,
}

impl ResultBuffer {
    pub fn new() -> Self {
        ResultBuffer::default()
    }

    pub fn from_records(records: Vec<Vec<u8>>) -> Self {
        ResultBuffer { records }
    }

    pub fn push(&mut self, record: Vec<u8>) {
        self.records.push(record);
    }

    /// Append all of `other`'s records, preserving their order.
    pub fn extend(&mut self, other: ResultBuffer) {
        self.records.extend(other.records);
    }

    pub fn record_count(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn records(&self) -> &[Vec<u8>] {
        &self.records
    }

    pub fn into_records(self) -> Vec<Vec<u8>> {
        self.records
    }
}

/// Terminal result of a query, delivered exactly once per record.
#[derive(Debug, Clone, PartialEq)]
pub enum QueryOutcome {
    Success(ResultBuffer),
    Failure(QueryError),
    Cancelled,
}

impl QueryOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, QueryOutcome::Success(_))
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, QueryOutcome::Failure(_))
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, QueryOutcome::Cancelled)
    }
}

impl fmt::Display for QueryOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QueryOutcome::Success(buffer) => {
                write!(f, "success ({} records)", buffer.record_count())
            }
            QueryOutcome::Failure(err) => write!(f, "failure: {}", err),
            QueryOutcome::Cancelled => write!(f, "cancelled"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_query_id_display() {
        assert_eq!(QueryId::new(0x2a).to_string(), "q-0000002a");
        assert_eq!(QueryId::new(0x2a).raw(), 0x2a);
    }

    #[test]
    fn test_default_destination_is_gsi() {
        let dest = SaDestination::default();
        assert_eq!(dest.qp, 1);
        assert_eq!(dest.qkey, 1);
    }

    #[test]
    fn test_request_builders() {
        let req = SaRequest::new(0x11, vec![1, 2, 3]).serialized();
        assert_eq!(req.attribute, 0x11);
        assert_eq!(req.fan_out, FanOutMode::Serialized);

        let dest = SaDestination {
            lid: 7,
            ..SaDestination::default()
        };
        let req = SaRequest::new(0x12, vec![]).with_destination(dest);
        assert_eq!(req.destination.lid, 7);
    }

    #[test]
    fn test_priority_ordering() {
        assert!(Priority::HIGH > Priority::NORMAL);
        assert!(Priority::NORMAL > Priority::LOW);
        assert_eq!(Priority::default(), Priority::NORMAL);
    }

    #[test]
    fn test_options_defaults_unset() {
        let opts = QueryOptions::new();
        assert!(opts.max_retries.is_none());
        assert!(opts.per_attempt_timeout.is_none());
    }

    #[test]
    fn test_result_buffer_extend_preserves_order() {
        let mut left = ResultBuffer::from_records(vec![vec![1], vec![2]]);
        let right = ResultBuffer::from_records(vec![vec![3]]);
        left.extend(right);
        assert_eq!(left.records(), &[vec![1], vec![2], vec![3]]);
        assert_eq!(left.record_count(), 3);
    }

    #[test]
    fn test_outcome_predicates() {
        assert!(QueryOutcome::Success(ResultBuffer::new()).is_success());
        assert!(QueryOutcome::Cancelled.is_cancelled());
        assert!(
            QueryOutcome::Failure(QueryError::Protocol { status: 3 }).is_failure()
        );
    }
}
