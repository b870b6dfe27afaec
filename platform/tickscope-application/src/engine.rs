use crate::board::SnapshotBoard;
use crate::sink_writer::RetryPolicy;
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tickscope_domain::services::indicators::{IndicatorCalculator, IndicatorConfig};
use tickscope_domain::services::normalizer::{NormalizeReport, TickNormalizer};
use tickscope_domain::services::ranking;
use tickscope_domain::services::window::{AppendOutcome, WindowStore, DEFAULT_MAX_FUTURE_SKEW_MS};
use tickscope_domain::value_objects::cycle::CycleOutput;
use tickscope_domain::value_objects::ranking::{Ranking, RankingMetric};
use tickscope_domain::value_objects::tick::Tick;
use tracing::info_span;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EngineSettings {
    pub eval_interval_ms: i64,
    pub ranking_interval_ms: i64,
    pub ma_period: usize,
    /// Effective retention horizon (already raised to cover every lookback).
    pub retention_ms: i64,
    /// Ticks stamped further than this past the arrival clock are refused.
    pub max_future_skew_ms: i64,
    pub ranking_metric: RankingMetric,
    pub batch_size: usize,
    pub retry: RetryPolicy,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            eval_interval_ms: 30_000,
            ranking_interval_ms: 300_000,
            ma_period: 5,
            retention_ms: 360_000,
            max_future_skew_ms: DEFAULT_MAX_FUTURE_SKEW_MS,
            ranking_metric: RankingMetric::Change1Min,
            batch_size: 1000,
            retry: RetryPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct IngestReport {
    pub received: u64,
    pub rejected: u64,
    pub appended: u64,
    pub inserted_late: u64,
    pub duplicates: u64,
    pub stale: u64,
    pub future: u64,
}

impl IngestReport {
    pub fn accepted(&self) -> u64 {
        self.appended + self.inserted_late
    }

    pub fn merge(&mut self, other: &IngestReport) {
        self.received += other.received;
        self.rejected += other.rejected;
        self.appended += other.appended;
        self.inserted_late += other.inserted_late;
        self.duplicates += other.duplicates;
        self.stale += other.stale;
        self.future += other.future;
    }
}

struct EngineState {
    normalizer: TickNormalizer,
    windows: WindowStore,
    calculator: IndicatorCalculator,
    cycle: u64,
}

/// Normalizer, window store and indicator calculator behind one lock, plus the board the
/// ranking cadence reads from.
///
/// Ingestion and evaluation take the lock; ranking only touches the board.
pub struct AnalyticsEngine {
    settings: EngineSettings,
    state: Mutex<EngineState>,
    board: Arc<SnapshotBoard>,
    ranking_cycle: AtomicU64,
}

impl AnalyticsEngine {
    pub fn new(settings: EngineSettings) -> Result<Self, String> {
        let windows =
            WindowStore::new(settings.retention_ms)?.with_max_future_skew(settings.max_future_skew_ms)?;
        let calculator = IndicatorCalculator::new(IndicatorConfig::new(settings.ma_period)?);
        Ok(Self {
            settings,
            state: Mutex::new(EngineState {
                normalizer: TickNormalizer::new(),
                windows,
                calculator,
                cycle: 0,
            }),
            board: Arc::new(SnapshotBoard::new()),
            ranking_cycle: AtomicU64::new(0),
        })
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    pub fn board(&self) -> Arc<SnapshotBoard> {
        self.board.clone()
    }

    pub fn normalize_report(&self) -> NormalizeReport {
        self.state.lock().normalizer.report().clone()
    }

    pub fn tracked_symbols(&self) -> usize {
        self.state.lock().windows.len()
    }

    /// Decodes payloads into ticks. Malformed ones are logged, counted and skipped.
    pub fn normalize_batch(&self, payloads: &[String]) -> (Vec<Tick>, u64) {
        let mut state = self.state.lock();
        let mut ticks = Vec::with_capacity(payloads.len());
        let mut rejected = 0u64;
        for payload in payloads {
            match state.normalizer.normalize(payload) {
                Ok(tick) => ticks.push(tick),
                Err(err) => {
                    rejected += 1;
                    metrics::counter!("tickscope.normalizer.rejected_total", "reason" => err.reason())
                        .increment(1);
                    tracing::warn!(error = %err, "dropping malformed tick");
                }
            }
        }
        (ticks, rejected)
    }

    /// Normalizes and appends `payloads`, which arrived when the clock read `now`.
    pub fn ingest(&self, payloads: &[String], now: i64) -> IngestReport {
        let (ticks, rejected) = self.normalize_batch(payloads);
        let mut report = self.ingest_ticks(ticks, now);
        report.received += rejected;
        report.rejected = rejected;
        report
    }

    pub fn ingest_ticks(&self, ticks: Vec<Tick>, now: i64) -> IngestReport {
        let mut report = IngestReport {
            received: ticks.len() as u64,
            ..IngestReport::default()
        };
        let mut state = self.state.lock();
        for tick in ticks {
            let symbol = tick.symbol.clone();
            let timestamp = tick.timestamp;
            match state.windows.append(tick, now) {
                AppendOutcome::Appended => report.appended += 1,
                AppendOutcome::Inserted => report.inserted_late += 1,
                AppendOutcome::Duplicate => {
                    report.duplicates += 1;
                    tracing::debug!(%symbol, timestamp, "ignoring duplicate tick");
                }
                AppendOutcome::Stale => {
                    report.stale += 1;
                    tracing::info!(%symbol, timestamp, "discarding stale tick");
                }
                AppendOutcome::Future => {
                    report.future += 1;
                    tracing::warn!(%symbol, timestamp, now, "discarding tick stamped ahead of the clock");
                }
            }
        }
        drop(state);

        metrics::counter!("tickscope.ingest.ticks_total", "outcome" => "appended")
            .increment(report.appended);
        metrics::counter!("tickscope.ingest.ticks_total", "outcome" => "inserted_late")
            .increment(report.inserted_late);
        metrics::counter!("tickscope.ingest.ticks_total", "outcome" => "duplicate")
            .increment(report.duplicates);
        metrics::counter!("tickscope.ingest.ticks_total", "outcome" => "stale")
            .increment(report.stale);
        metrics::counter!("tickscope.ingest.ticks_total", "outcome" => "future")
            .increment(report.future);
        report
    }

    /// Runs one evaluation cycle at `now`: evict, snapshot, compute, publish.
    pub fn evaluate(&self, now: i64) -> Arc<CycleOutput> {
        let started = Instant::now();
        let output = {
            let mut state = self.state.lock();
            state.cycle += 1;
            let cycle = state.cycle;
            let _span = info_span!("engine.evaluate", cycle, now).entered();

            let eviction = state.windows.evict(now);
            for symbol in &eviction.dropped_symbols {
                state.calculator.forget(symbol);
            }
            let views = state.windows.snapshot_all();
            let snapshots = state.calculator.evaluate(now, &views);

            metrics::gauge!("tickscope.window.symbols").set(state.windows.len() as f64);
            metrics::gauge!("tickscope.window.ticks").set(state.windows.tick_count() as f64);
            metrics::counter!("tickscope.window.evicted_total").increment(eviction.evicted_ticks as u64);
            tracing::debug!(
                evicted = eviction.evicted_ticks,
                dropped_symbols = eviction.dropped_symbols.len(),
                snapshots = snapshots.len(),
                "evaluation cycle computed"
            );

            CycleOutput {
                cycle,
                evaluated_at: now,
                snapshots,
            }
        };

        let published = self.board.publish(output);
        metrics::histogram!("tickscope.engine.evaluate_ms")
            .record(started.elapsed().as_secs_f64() * 1000.0);
        metrics::counter!("tickscope.engine.cycles_total", "kind" => "evaluation").increment(1);
        published
    }

    /// Ranks the latest published cycle. `None` until a cycle has been published.
    pub fn rank(&self, now: i64) -> Option<Ranking> {
        let Some(latest) = self.board.latest() else {
            tracing::debug!("no evaluation cycle published yet; skipping ranking");
            return None;
        };
        let cycle = self.ranking_cycle.fetch_add(1, Ordering::Relaxed) + 1;
        let _span = info_span!("engine.rank", cycle, source_cycle = latest.cycle).entered();

        let ranking = ranking::rank(cycle, now, &latest.snapshots, self.settings.ranking_metric);
        metrics::counter!("tickscope.engine.cycles_total", "kind" => "ranking").increment(1);
        tracing::info!(
            gainers = ranking.gainers.len(),
            losers = ranking.losers.len(),
            metric = %ranking.metric,
            "ranking computed"
        );
        Some(ranking)
    }
}
