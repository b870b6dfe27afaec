use crate::value_objects::indicator_snapshot::IndicatorSnapshot;
use crate::value_objects::ranking::Ranking;

#[derive(Debug, Clone, PartialEq)]
pub enum SinkError {
    /// Timeouts, lost connections, pool exhaustion. Worth retrying.
    Transient(String),
    /// Schema or data errors that will fail again on retry.
    Permanent(String),
}

impl SinkError {
    pub fn is_transient(&self) -> bool {
        matches!(self, SinkError::Transient(_))
    }
}

impl std::fmt::Display for SinkError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SinkError::Transient(msg) => write!(f, "transient: {msg}"),
            SinkError::Permanent(msg) => write!(f, "permanent: {msg}"),
        }
    }
}

/// Durable destination for indicator snapshots and rankings.
///
/// Implementations must be idempotent: writing the same snapshot batch or ranking twice
/// leaves the same persisted rows as writing it once, and a failed call persists nothing.
pub trait MetricsSink {
    /// Upserts keyed on `(timestamp, symbol)`. Returns the number of rows written.
    fn write_snapshots(&self, snapshots: &[IndicatorSnapshot]) -> Result<usize, SinkError>;

    /// Replaces the gainers and losers lists wholesale.
    fn replace_rankings(&self, ranking: &Ranking) -> Result<(), SinkError>;
}
