use parking_lot::Mutex;
use std::collections::BTreeMap;
use tickscope_domain::repositories::sink::{MetricsSink, SinkError};
use tickscope_domain::value_objects::indicator_snapshot::IndicatorSnapshot;
use tickscope_domain::value_objects::ranking::{Ranking, RankingEntry};

#[derive(Debug, Default)]
struct MemoryState {
    metrics: BTreeMap<(i64, String), IndicatorSnapshot>,
    ranking: Option<Ranking>,
    snapshot_writes: u64,
    ranking_writes: u64,
}

/// In-process sink with the same keys as the Postgres tables.
#[derive(Debug, Default)]
pub struct MemoryMetricsSink {
    state: Mutex<MemoryState>,
}

impl MemoryMetricsSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// All stored rows ordered by `(timestamp, symbol)`.
    pub fn rows(&self) -> Vec<IndicatorSnapshot> {
        self.state.lock().metrics.values().cloned().collect()
    }

    pub fn row(&self, timestamp: i64, symbol: &str) -> Option<IndicatorSnapshot> {
        self.state
            .lock()
            .metrics
            .get(&(timestamp, symbol.to_string()))
            .cloned()
    }

    pub fn row_count(&self) -> usize {
        self.state.lock().metrics.len()
    }

    pub fn ranking(&self) -> Option<Ranking> {
        self.state.lock().ranking.clone()
    }

    pub fn gainers(&self) -> Vec<RankingEntry> {
        self.state
            .lock()
            .ranking
            .as_ref()
            .map(|r| r.gainers.clone())
            .unwrap_or_default()
    }

    pub fn losers(&self) -> Vec<RankingEntry> {
        self.state
            .lock()
            .ranking
            .as_ref()
            .map(|r| r.losers.clone())
            .unwrap_or_default()
    }

    /// `(snapshot batches, ranking replacements)` accepted so far.
    pub fn write_calls(&self) -> (u64, u64) {
        let state = self.state.lock();
        (state.snapshot_writes, state.ranking_writes)
    }
}

impl MetricsSink for MemoryMetricsSink {
    fn write_snapshots(&self, rows: &[IndicatorSnapshot]) -> Result<usize, SinkError> {
        let mut state = self.state.lock();
        for row in rows {
            state
                .metrics
                .insert((row.timestamp, row.symbol.clone()), row.clone());
        }
        state.snapshot_writes += 1;
        Ok(rows.len())
    }

    fn replace_rankings(&self, ranking: &Ranking) -> Result<(), SinkError> {
        let mut state = self.state.lock();
        state.ranking = Some(ranking.clone());
        state.ranking_writes += 1;
        Ok(())
    }
}
