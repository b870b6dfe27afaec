use crate::value_objects::duration::FIVE_MINUTES_MS;
use crate::value_objects::tick::Tick;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

/// Longest lookback any indicator asks the store for.
pub const LONGEST_LOOKBACK_MS: i64 = FIVE_MINUTES_MS;

/// How far past the arrival clock a tick may be stamped before it is refused.
pub const DEFAULT_MAX_FUTURE_SKEW_MS: i64 = 60_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendOutcome {
    /// New tail of the window.
    Appended,
    /// Late tick placed at its chronological position.
    Inserted,
    /// A tick with the same timestamp is already held; ignored.
    Duplicate,
    /// Older than the retention horizon on arrival; discarded.
    Stale,
    /// Stamped further ahead of the arrival clock than the allowed skew; discarded.
    Future,
}

/// Ticks for one symbol, strictly ordered by timestamp.
#[derive(Debug, Clone, Default)]
pub struct SymbolWindow {
    ticks: VecDeque<Tick>,
}

impl SymbolWindow {
    pub fn len(&self) -> usize {
        self.ticks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ticks.is_empty()
    }

    pub fn latest_timestamp(&self) -> Option<i64> {
        self.ticks.back().map(|t| t.timestamp)
    }

    fn insert(&mut self, tick: Tick) -> AppendOutcome {
        let Some(last) = self.ticks.back() else {
            self.ticks.push_back(tick);
            return AppendOutcome::Appended;
        };
        if tick.timestamp > last.timestamp {
            self.ticks.push_back(tick);
            return AppendOutcome::Appended;
        }
        match self
            .ticks
            .binary_search_by_key(&tick.timestamp, |t| t.timestamp)
        {
            Ok(_) => AppendOutcome::Duplicate,
            Err(idx) => {
                self.ticks.insert(idx, tick);
                AppendOutcome::Inserted
            }
        }
    }

    fn evict_before(&mut self, cutoff: i64) -> usize {
        let mut evicted = 0;
        while self.ticks.front().is_some_and(|t| t.timestamp < cutoff) {
            self.ticks.pop_front();
            evicted += 1;
        }
        evicted
    }
}

/// Immutable copy of one symbol's window, safe to hand to another thread.
#[derive(Debug, Clone)]
pub struct WindowView {
    symbol: String,
    ticks: Arc<[Tick]>,
}

impl WindowView {
    pub fn new(symbol: impl Into<String>, ticks: Vec<Tick>) -> Self {
        Self {
            symbol: symbol.into(),
            ticks: ticks.into(),
        }
    }

    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    pub fn ticks(&self) -> &[Tick] {
        &self.ticks
    }

    pub fn len(&self) -> usize {
        self.ticks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ticks.is_empty()
    }

    /// Most recent tick at or before `at`.
    pub fn latest_at(&self, at: i64) -> Option<&Tick> {
        let end = self.ticks.partition_point(|t| t.timestamp <= at);
        end.checked_sub(1).map(|idx| &self.ticks[idx])
    }

    pub fn price_at(&self, at: i64) -> Option<f64> {
        self.latest_at(at).map(|t| t.price)
    }

    /// Ticks with `from <= timestamp <= to`.
    pub fn range(&self, from: i64, to: i64) -> &[Tick] {
        let start = self.ticks.partition_point(|t| t.timestamp < from);
        let end = self.ticks.partition_point(|t| t.timestamp <= to);
        if start >= end {
            &[]
        } else {
            &self.ticks[start..end]
        }
    }

    /// The last `n` ticks at or before `at`, or `None` if fewer exist.
    pub fn last_n(&self, n: usize, at: i64) -> Option<&[Tick]> {
        let end = self.ticks.partition_point(|t| t.timestamp <= at);
        if n == 0 || end < n {
            return None;
        }
        Some(&self.ticks[end - n..end])
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EvictionReport {
    pub evicted_ticks: usize,
    /// Symbols whose window became empty and was dropped.
    pub dropped_symbols: Vec<String>,
}

/// Keyed store of per-symbol windows bounded by a retention horizon.
#[derive(Debug, Clone)]
pub struct WindowStore {
    retention_ms: i64,
    max_future_skew_ms: i64,
    windows: HashMap<String, SymbolWindow>,
    evicted_before: Option<i64>,
}

impl WindowStore {
    /// `retention_ms` is raised to [`LONGEST_LOOKBACK_MS`] when shorter.
    pub fn new(retention_ms: i64) -> Result<Self, String> {
        if retention_ms <= 0 {
            return Err(format!("retention must be > 0 (got {retention_ms}ms)"));
        }
        Ok(Self {
            retention_ms: retention_ms.max(LONGEST_LOOKBACK_MS),
            max_future_skew_ms: DEFAULT_MAX_FUTURE_SKEW_MS,
            windows: HashMap::new(),
            evicted_before: None,
        })
    }

    pub fn with_max_future_skew(mut self, skew_ms: i64) -> Result<Self, String> {
        if skew_ms < 0 {
            return Err(format!("max future skew must be >= 0 (got {skew_ms}ms)"));
        }
        self.max_future_skew_ms = skew_ms;
        Ok(self)
    }

    pub fn retention_ms(&self) -> i64 {
        self.retention_ms
    }

    pub fn max_future_skew_ms(&self) -> i64 {
        self.max_future_skew_ms
    }

    /// Places `tick`, which arrived when the clock read `now`.
    ///
    /// A tick stamped past `now + max_future_skew` is refused: it would become the window's
    /// newest tick and move the symbol's stale horizon ahead of every valid tick.
    pub fn append(&mut self, tick: Tick, now: i64) -> AppendOutcome {
        if tick.timestamp > now.saturating_add(self.max_future_skew_ms) {
            return AppendOutcome::Future;
        }
        let mut horizon = self.evicted_before.unwrap_or(i64::MIN);
        if let Some(latest) = self
            .windows
            .get(&tick.symbol)
            .and_then(SymbolWindow::latest_timestamp)
        {
            horizon = horizon.max(latest.saturating_sub(self.retention_ms));
        }
        if tick.timestamp < horizon {
            return AppendOutcome::Stale;
        }

        self.windows
            .entry(tick.symbol.clone())
            .or_default()
            .insert(tick)
    }

    /// Drops ticks older than `now - retention`. Runs before every snapshot pass.
    pub fn evict(&mut self, now: i64) -> EvictionReport {
        let cutoff = now.saturating_sub(self.retention_ms);
        self.evicted_before = Some(self.evicted_before.map_or(cutoff, |prev| prev.max(cutoff)));

        let mut report = EvictionReport::default();
        for window in self.windows.values_mut() {
            report.evicted_ticks += window.evict_before(cutoff);
        }
        self.windows.retain(|symbol, window| {
            if window.is_empty() {
                report.dropped_symbols.push(symbol.clone());
                false
            } else {
                true
            }
        });
        report.dropped_symbols.sort();
        report
    }

    pub fn snapshot(&self, symbol: &str) -> WindowView {
        let ticks = self
            .windows
            .get(symbol)
            .map(|w| w.ticks.iter().cloned().collect())
            .unwrap_or_default();
        WindowView::new(symbol, ticks)
    }

    /// One view per symbol, ordered by symbol.
    pub fn snapshot_all(&self) -> Vec<WindowView> {
        self.symbols()
            .into_iter()
            .map(|symbol| self.snapshot(&symbol))
            .collect()
    }

    pub fn symbols(&self) -> Vec<String> {
        let mut symbols: Vec<String> = self.windows.keys().cloned().collect();
        symbols.sort();
        symbols
    }

    pub fn window(&self, symbol: &str) -> Option<&SymbolWindow> {
        self.windows.get(symbol)
    }

    pub fn len(&self) -> usize {
        self.windows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.windows.is_empty()
    }

    pub fn tick_count(&self) -> usize {
        self.windows.values().map(SymbolWindow::len).sum()
    }
}
