use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tickscope_domain::repositories::sink::{MetricsSink, SinkError};
use tickscope_domain::value_objects::indicator_snapshot::IndicatorSnapshot;
use tickscope_domain::value_objects::ranking::Ranking;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub max_deferred_batches: usize,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff_ms: 200,
            max_backoff_ms: 5_000,
            max_deferred_batches: 16,
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (1-based), doubling up to `max_backoff_ms`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(16);
        let ms = self
            .initial_backoff_ms
            .saturating_mul(1u64 << shift)
            .min(self.max_backoff_ms);
        Duration::from_millis(ms)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    Written,
    /// Transient failures exhausted the retries; kept for the next cycle.
    Deferred,
    /// Permanent failure; the batch is gone.
    Dropped,
    /// A ranking of this cycle or a newer one was already written or queued; this one was
    /// discarded.
    Superseded,
}

/// Ranking writes are serialized through this slot so an older cycle can never land after
/// a newer one, whichever cadence sends it.
#[derive(Debug, Default)]
struct RankingSlot {
    /// Highest cycle the sink has accepted.
    written: Option<u64>,
    deferred: Option<Ranking>,
}

impl RankingSlot {
    fn is_superseded(&self, cycle: u64) -> bool {
        self.written.is_some_and(|written| cycle <= written)
    }

    fn mark_written(&mut self, cycle: u64) {
        self.written = Some(self.written.map_or(cycle, |prev| prev.max(cycle)));
        if self.deferred.as_ref().is_some_and(|r| r.cycle <= cycle) {
            self.deferred = None;
        }
    }

    /// Queues `ranking` unless a newer one is already queued. Returns whether it was kept.
    fn defer(&mut self, ranking: Ranking) -> bool {
        if self.deferred.as_ref().is_some_and(|r| r.cycle >= ranking.cycle) {
            return false;
        }
        self.deferred = Some(ranking);
        true
    }
}

type Sleeper = Box<dyn Fn(Duration) + Send + Sync>;

/// Retrying, deferring front of a [`MetricsSink`].
///
/// Each write is attempted up to `max_attempts` times with bounded exponential backoff.
/// Batches that still fail transiently are queued and re-sent by [`SinkWriter::flush_deferred`]
/// on the next cycle instead of blocking the current one.
pub struct SinkWriter {
    sink: Arc<dyn MetricsSink + Send + Sync>,
    policy: RetryPolicy,
    deferred: Mutex<VecDeque<Vec<IndicatorSnapshot>>>,
    rankings: Mutex<RankingSlot>,
    sleeper: Sleeper,
}

impl SinkWriter {
    pub fn new(sink: Arc<dyn MetricsSink + Send + Sync>, policy: RetryPolicy) -> Self {
        Self {
            sink,
            policy,
            deferred: Mutex::new(VecDeque::new()),
            rankings: Mutex::new(RankingSlot::default()),
            sleeper: Box::new(std::thread::sleep),
        }
    }

    /// Replaces the backoff sleep, e.g. with a no-op in tests.
    pub fn with_sleeper(mut self, sleeper: impl Fn(Duration) + Send + Sync + 'static) -> Self {
        self.sleeper = Box::new(sleeper);
        self
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    pub fn deferred_snapshot_batches(&self) -> usize {
        self.deferred.lock().len()
    }

    pub fn has_deferred_ranking(&self) -> bool {
        self.rankings.lock().deferred.is_some()
    }

    /// Highest ranking cycle the sink has accepted.
    pub fn last_written_ranking(&self) -> Option<u64> {
        self.rankings.lock().written
    }

    pub fn write_snapshots(&self, batch: Vec<IndicatorSnapshot>) -> WriteOutcome {
        if batch.is_empty() {
            return WriteOutcome::Written;
        }
        let started = Instant::now();
        let result = self.with_retry("snapshots", || self.sink.write_snapshots(&batch));
        metrics::histogram!("tickscope.sink.write_snapshots_ms")
            .record(started.elapsed().as_secs_f64() * 1000.0);

        match result {
            Ok(rows) => {
                metrics::counter!("tickscope.sink.snapshot_rows_total").increment(rows as u64);
                WriteOutcome::Written
            }
            Err(err) if err.is_transient() => {
                self.defer_snapshots(batch);
                WriteOutcome::Deferred
            }
            Err(err) => {
                metrics::counter!("tickscope.sink.dropped_batches_total", "kind" => "snapshots")
                    .increment(1);
                tracing::error!(error = %err, rows = batch.len(), "dropping snapshot batch");
                WriteOutcome::Dropped
            }
        }
    }

    pub fn replace_rankings(&self, ranking: Ranking) -> WriteOutcome {
        let mut slot = self.rankings.lock();
        if slot.is_superseded(ranking.cycle) {
            tracing::debug!(cycle = ranking.cycle, written = ?slot.written, "skipping superseded ranking");
            return WriteOutcome::Superseded;
        }
        let result = self.with_retry("rankings", || self.sink.replace_rankings(&ranking));
        match result {
            Ok(()) => {
                slot.mark_written(ranking.cycle);
                WriteOutcome::Written
            }
            Err(err) if err.is_transient() => {
                let cycle = ranking.cycle;
                if !slot.defer(ranking) {
                    tracing::debug!(cycle, "newer ranking already queued; discarding");
                    return WriteOutcome::Superseded;
                }
                tracing::warn!(cycle, "deferring ranking to next cycle");
                metrics::counter!("tickscope.sink.deferred_batches_total", "kind" => "rankings")
                    .increment(1);
                WriteOutcome::Deferred
            }
            Err(err) => {
                metrics::counter!("tickscope.sink.dropped_batches_total", "kind" => "rankings")
                    .increment(1);
                tracing::error!(error = %err, cycle = ranking.cycle, "dropping ranking");
                WriteOutcome::Dropped
            }
        }
    }

    /// Re-sends deferred batches once each, oldest first. Stops at the first transient
    /// failure and keeps the rest queued. Returns the number of batches written.
    pub fn flush_deferred(&self) -> usize {
        let mut written = 0;
        loop {
            let Some(batch) = self.deferred.lock().pop_front() else {
                break;
            };
            match self.sink.write_snapshots(&batch) {
                Ok(_) => written += 1,
                Err(err) if err.is_transient() => {
                    tracing::warn!(error = %err, "deferred snapshot batch still failing");
                    self.deferred.lock().push_front(batch);
                    return written;
                }
                Err(err) => {
                    tracing::error!(error = %err, rows = batch.len(), "dropping deferred snapshot batch");
                }
            }
        }

        let mut slot = self.rankings.lock();
        if let Some(ranking) = slot.deferred.take() {
            if slot.is_superseded(ranking.cycle) {
                tracing::debug!(cycle = ranking.cycle, "deferred ranking already superseded");
            } else {
                match self.sink.replace_rankings(&ranking) {
                    Ok(()) => {
                        slot.mark_written(ranking.cycle);
                        written += 1;
                    }
                    Err(err) if err.is_transient() => {
                        tracing::warn!(error = %err, "deferred ranking still failing");
                        slot.defer(ranking);
                    }
                    Err(err) => {
                        tracing::error!(error = %err, cycle = ranking.cycle, "dropping deferred ranking");
                    }
                }
            }
        }
        drop(slot);
        if written > 0 {
            tracing::info!(batches = written, "flushed deferred writes");
        }
        written
    }

    fn defer_snapshots(&self, batch: Vec<IndicatorSnapshot>) {
        let mut deferred = self.deferred.lock();
        if deferred.len() >= self.policy.max_deferred_batches {
            if let Some(dropped) = deferred.pop_front() {
                metrics::counter!("tickscope.sink.dropped_batches_total", "kind" => "snapshots")
                    .increment(1);
                tracing::error!(rows = dropped.len(), "deferred queue full; dropping oldest batch");
            }
        }
        tracing::warn!(rows = batch.len(), queued = deferred.len() + 1, "deferring snapshot batch to next cycle");
        metrics::counter!("tickscope.sink.deferred_batches_total", "kind" => "snapshots")
            .increment(1);
        deferred.push_back(batch);
    }

    fn with_retry<T>(
        &self,
        what: &'static str,
        mut op: impl FnMut() -> Result<T, SinkError>,
    ) -> Result<T, SinkError> {
        let mut attempt = 1;
        loop {
            match op() {
                Ok(value) => return Ok(value),
                Err(err) if err.is_transient() && attempt < self.policy.max_attempts => {
                    let delay = self.policy.backoff(attempt);
                    tracing::warn!(
                        what,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "sink write failed; retrying"
                    );
                    metrics::counter!("tickscope.sink.retries_total", "kind" => what).increment(1);
                    (self.sleeper)(delay);
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tickscope_domain::value_objects::ranking::RankingMetric;

    /// Fails the first `failures` calls with the given error.
    struct FlakySink {
        failures: AtomicUsize,
        error: SinkError,
        calls: AtomicUsize,
        rows: Mutex<Vec<IndicatorSnapshot>>,
        rankings: Mutex<Vec<Ranking>>,
    }

    impl FlakySink {
        fn new(failures: usize, error: SinkError) -> Self {
            Self {
                failures: AtomicUsize::new(failures),
                error,
                calls: AtomicUsize::new(0),
                rows: Mutex::new(Vec::new()),
                rankings: Mutex::new(Vec::new()),
            }
        }

        fn fail(&self) -> Option<SinkError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let left = self.failures.load(Ordering::SeqCst);
            if left > 0 {
                self.failures.store(left - 1, Ordering::SeqCst);
                return Some(self.error.clone());
            }
            None
        }
    }

    impl MetricsSink for FlakySink {
        fn write_snapshots(&self, snapshots: &[IndicatorSnapshot]) -> Result<usize, SinkError> {
            if let Some(err) = self.fail() {
                return Err(err);
            }
            self.rows.lock().extend_from_slice(snapshots);
            Ok(snapshots.len())
        }

        fn replace_rankings(&self, ranking: &Ranking) -> Result<(), SinkError> {
            if let Some(err) = self.fail() {
                return Err(err);
            }
            self.rankings.lock().push(ranking.clone());
            Ok(())
        }
    }

    fn snapshot(symbol: &str) -> IndicatorSnapshot {
        IndicatorSnapshot {
            timestamp: 1,
            id: symbol.to_lowercase(),
            symbol: symbol.to_string(),
            price: 1.0,
            change_1min: None,
            change_5min: None,
            sma: None,
            ema: Some(1.0),
            volatility: None,
        }
    }

    fn ranking(cycle: u64) -> Ranking {
        Ranking {
            cycle,
            ranked_at: 0,
            metric: RankingMetric::Change1Min,
            gainers: Vec::new(),
            losers: Vec::new(),
        }
    }

    fn writer(sink: Arc<FlakySink>, max_attempts: u32) -> SinkWriter {
        SinkWriter::new(
            sink,
            RetryPolicy {
                max_attempts,
                initial_backoff_ms: 10,
                max_backoff_ms: 40,
                max_deferred_batches: 2,
            },
        )
        .with_sleeper(|_| {})
    }

    #[test]
    fn backoff_doubles_and_is_capped() {
        let policy = RetryPolicy {
            max_attempts: 5,
            initial_backoff_ms: 100,
            max_backoff_ms: 350,
            max_deferred_batches: 1,
        };
        assert_eq!(policy.backoff(1), Duration::from_millis(100));
        assert_eq!(policy.backoff(2), Duration::from_millis(200));
        assert_eq!(policy.backoff(3), Duration::from_millis(350));
        assert_eq!(policy.backoff(40), Duration::from_millis(350));
    }

    #[test]
    fn transient_failure_is_retried_within_budget() {
        let sink = Arc::new(FlakySink::new(2, SinkError::Transient("timeout".into())));
        let w = writer(sink.clone(), 3);
        assert_eq!(w.write_snapshots(vec![snapshot("BTC")]), WriteOutcome::Written);
        assert_eq!(sink.calls.load(Ordering::SeqCst), 3);
        assert_eq!(sink.rows.lock().len(), 1);
    }

    #[test]
    fn exhausted_retries_defer_until_next_flush() {
        let sink = Arc::new(FlakySink::new(2, SinkError::Transient("down".into())));
        let w = writer(sink.clone(), 2);
        assert_eq!(w.write_snapshots(vec![snapshot("BTC")]), WriteOutcome::Deferred);
        assert_eq!(w.deferred_snapshot_batches(), 1);
        assert!(sink.rows.lock().is_empty());

        assert_eq!(w.flush_deferred(), 1);
        assert_eq!(w.deferred_snapshot_batches(), 0);
        assert_eq!(sink.rows.lock().len(), 1);
    }

    #[test]
    fn permanent_failure_drops_without_retry() {
        let sink = Arc::new(FlakySink::new(1, SinkError::Permanent("bad column".into())));
        let w = writer(sink.clone(), 5);
        assert_eq!(w.write_snapshots(vec![snapshot("BTC")]), WriteOutcome::Dropped);
        assert_eq!(sink.calls.load(Ordering::SeqCst), 1);
        assert_eq!(w.deferred_snapshot_batches(), 0);
    }

    #[test]
    fn deferred_queue_is_bounded() {
        let sink = Arc::new(FlakySink::new(usize::MAX, SinkError::Transient("down".into())));
        let w = writer(sink, 1);
        for symbol in ["A", "B", "C"] {
            assert_eq!(w.write_snapshots(vec![snapshot(symbol)]), WriteOutcome::Deferred);
        }
        assert_eq!(w.deferred_snapshot_batches(), 2);
    }

    #[test]
    fn flush_stops_at_first_transient_failure() {
        let sink = Arc::new(FlakySink::new(4, SinkError::Transient("down".into())));
        let w = writer(sink.clone(), 1);
        w.write_snapshots(vec![snapshot("A")]);
        w.write_snapshots(vec![snapshot("B")]);
        assert_eq!(w.flush_deferred(), 0);
        assert_eq!(w.deferred_snapshot_batches(), 2);
        // One failure left after the flush above.
        assert_eq!(w.flush_deferred(), 0);
        assert_eq!(w.flush_deferred(), 2);
        let symbols: Vec<String> = sink.rows.lock().iter().map(|s| s.symbol.clone()).collect();
        assert_eq!(symbols, vec!["A".to_string(), "B".to_string()]);
    }

    #[test]
    fn newer_ranking_supersedes_deferred_one() {
        let sink = Arc::new(FlakySink::new(1, SinkError::Transient("down".into())));
        let w = writer(sink.clone(), 1);
        assert_eq!(w.replace_rankings(ranking(1)), WriteOutcome::Deferred);
        assert!(w.has_deferred_ranking());
        assert_eq!(w.replace_rankings(ranking(2)), WriteOutcome::Written);
        assert!(!w.has_deferred_ranking());
        assert_eq!(w.flush_deferred(), 0);
        let cycles: Vec<u64> = sink.rankings.lock().iter().map(|r| r.cycle).collect();
        assert_eq!(cycles, vec![2]);
    }

    #[test]
    fn older_ranking_is_never_sent_after_a_newer_one() {
        let sink = Arc::new(FlakySink::new(0, SinkError::Transient("unused".into())));
        let w = writer(sink.clone(), 1);
        assert_eq!(w.replace_rankings(ranking(2)), WriteOutcome::Written);
        assert_eq!(w.replace_rankings(ranking(1)), WriteOutcome::Superseded);
        assert_eq!(w.replace_rankings(ranking(2)), WriteOutcome::Superseded);
        assert_eq!(w.last_written_ranking(), Some(2));
        let cycles: Vec<u64> = sink.rankings.lock().iter().map(|r| r.cycle).collect();
        assert_eq!(cycles, vec![2]);
    }

    #[test]
    fn failing_older_ranking_does_not_displace_a_deferred_newer_one() {
        let sink = Arc::new(FlakySink::new(2, SinkError::Transient("down".into())));
        let w = writer(sink.clone(), 1);
        assert_eq!(w.replace_rankings(ranking(3)), WriteOutcome::Deferred);
        assert_eq!(w.replace_rankings(ranking(2)), WriteOutcome::Superseded);
        assert_eq!(w.flush_deferred(), 1);
        let cycles: Vec<u64> = sink.rankings.lock().iter().map(|r| r.cycle).collect();
        assert_eq!(cycles, vec![3]);
    }

    /// Holds the cycle-1 ranking inside the sink until released, then fails it.
    struct GatedSink {
        entered: Mutex<std::sync::mpsc::Sender<()>>,
        release: Mutex<std::sync::mpsc::Receiver<()>>,
        gate_open: std::sync::atomic::AtomicBool,
        stored: Mutex<Vec<u64>>,
    }

    impl MetricsSink for GatedSink {
        fn write_snapshots(&self, snapshots: &[IndicatorSnapshot]) -> Result<usize, SinkError> {
            Ok(snapshots.len())
        }

        fn replace_rankings(&self, ranking: &Ranking) -> Result<(), SinkError> {
            if ranking.cycle == 1 && !self.gate_open.load(Ordering::SeqCst) {
                let _ = self.entered.lock().send(());
                let _ = self.release.lock().recv();
                return Err(SinkError::Transient("connection reset".into()));
            }
            self.stored.lock().push(ranking.cycle);
            Ok(())
        }
    }

    #[test]
    fn flush_racing_the_ranking_cadence_keeps_the_newest_ranking() {
        let (entered_tx, entered_rx) = std::sync::mpsc::channel();
        let (release_tx, release_rx) = std::sync::mpsc::channel();
        let sink = Arc::new(GatedSink {
            entered: Mutex::new(entered_tx),
            release: Mutex::new(release_rx),
            gate_open: std::sync::atomic::AtomicBool::new(true),
            stored: Mutex::new(Vec::new()),
        });
        let w = Arc::new(
            SinkWriter::new(
                sink.clone(),
                RetryPolicy {
                    max_attempts: 1,
                    ..RetryPolicy::default()
                },
            )
            .with_sleeper(|_| {}),
        );

        // Cycle 1 is deferred by a first outage.
        sink.gate_open.store(false, Ordering::SeqCst);
        let first = {
            let w = w.clone();
            std::thread::spawn(move || w.replace_rankings(ranking(1)))
        };
        entered_rx.recv().unwrap();
        release_tx.send(()).unwrap();
        assert_eq!(first.join().unwrap(), WriteOutcome::Deferred);

        // The evaluation cadence flushes cycle 1 while the ranking cadence sends cycle 2.
        let flusher = {
            let w = w.clone();
            std::thread::spawn(move || w.flush_deferred())
        };
        entered_rx.recv().unwrap();
        let ranker = {
            let w = w.clone();
            std::thread::spawn(move || w.replace_rankings(ranking(2)))
        };
        std::thread::sleep(Duration::from_millis(50));
        release_tx.send(()).unwrap();
        flusher.join().unwrap();
        assert_eq!(ranker.join().unwrap(), WriteOutcome::Written);

        sink.gate_open.store(true, Ordering::SeqCst);
        w.flush_deferred();
        assert!(!w.has_deferred_ranking());
        assert_eq!(w.last_written_ranking(), Some(2));
        assert_eq!(sink.stored.lock().last().copied(), Some(2));
        assert!(!sink.stored.lock().contains(&1));
    }

    #[test]
    fn empty_batch_is_a_no_op() {
        let sink = Arc::new(FlakySink::new(0, SinkError::Transient("unused".into())));
        let w = writer(sink.clone(), 1);
        assert_eq!(w.write_snapshots(Vec::new()), WriteOutcome::Written);
        assert_eq!(sink.calls.load(Ordering::SeqCst), 0);
    }
}
