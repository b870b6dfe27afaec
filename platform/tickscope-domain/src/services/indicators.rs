use crate::services::window::WindowView;
use crate::value_objects::duration::{FIVE_MINUTES_MS, ONE_MINUTE_MS};
use crate::value_objects::indicator_snapshot::IndicatorSnapshot;
use rayon::prelude::*;
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndicatorConfig {
    /// Number of observations in the SMA and the EMA smoothing period.
    pub ma_period: usize,
}

impl IndicatorConfig {
    pub fn new(ma_period: usize) -> Result<Self, String> {
        if ma_period == 0 {
            return Err("ma_period must be > 0".to_string());
        }
        Ok(Self { ma_period })
    }

    pub fn alpha(&self) -> f64 {
        2.0 / (self.ma_period as f64 + 1.0)
    }
}

/// EMA state carried from one cycle to the next.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EmaCarry {
    pub value: f64,
    /// Timestamp of the last tick folded into `value`.
    pub last_tick_ts: i64,
}

/// Computes per-symbol indicators each evaluation cycle and owns the EMA carries.
#[derive(Debug, Clone)]
pub struct IndicatorCalculator {
    config: IndicatorConfig,
    carries: HashMap<String, EmaCarry>,
}

impl IndicatorCalculator {
    pub fn new(config: IndicatorConfig) -> Self {
        Self {
            config,
            carries: HashMap::new(),
        }
    }

    pub fn config(&self) -> IndicatorConfig {
        self.config
    }

    pub fn carry(&self, symbol: &str) -> Option<EmaCarry> {
        self.carries.get(symbol).copied()
    }

    pub fn forget(&mut self, symbol: &str) {
        self.carries.remove(symbol);
    }

    /// One snapshot per window holding a tick at or before `now`, in input order.
    ///
    /// Symbols are computed in parallel against the carries as they stood at the start
    /// of the cycle; the new carries are written back once every symbol is done.
    pub fn evaluate(&mut self, now: i64, windows: &[WindowView]) -> Vec<IndicatorSnapshot> {
        let config = self.config;
        let carries = &self.carries;
        let results: Vec<(IndicatorSnapshot, EmaCarry)> = windows
            .par_iter()
            .filter_map(|view| compute_symbol(config, now, view, carries.get(view.symbol()).copied()))
            .collect();

        let mut snapshots = Vec::with_capacity(results.len());
        for (snapshot, carry) in results {
            self.carries.insert(snapshot.symbol.clone(), carry);
            snapshots.push(snapshot);
        }
        snapshots
    }
}

/// Indicators for one symbol; `None` when the window has no tick at or before `now`.
pub fn compute_symbol(
    config: IndicatorConfig,
    now: i64,
    view: &WindowView,
    prior: Option<EmaCarry>,
) -> Option<(IndicatorSnapshot, EmaCarry)> {
    let latest = view.latest_at(now)?;
    let price = latest.price;

    let change_1min = view
        .price_at(now - ONE_MINUTE_MS)
        .and_then(|then| percent_change(then, price));
    let change_5min = view
        .price_at(now - FIVE_MINUTES_MS)
        .and_then(|then| percent_change(then, price));

    let sma = view.last_n(config.ma_period, now).and_then(|ticks| {
        let prices: Vec<f64> = ticks.iter().map(|t| t.price).collect();
        simple_moving_average(&prices)
    });

    let carry = match prior {
        Some(prev) if latest.timestamp > prev.last_tick_ts => EmaCarry {
            value: ema_step(config.alpha(), price, prev.value),
            last_tick_ts: latest.timestamp,
        },
        Some(prev) => prev,
        None => EmaCarry {
            value: sma.unwrap_or(price),
            last_tick_ts: latest.timestamp,
        },
    };

    let recent: Vec<f64> = view
        .range(now - FIVE_MINUTES_MS, now)
        .iter()
        .map(|t| t.price)
        .collect();
    let volatility = sample_std_dev(&percent_returns(&recent));

    let snapshot = IndicatorSnapshot {
        timestamp: now,
        id: latest.id.clone(),
        symbol: view.symbol().to_string(),
        price,
        change_1min,
        change_5min,
        sma,
        ema: Some(carry.value),
        volatility,
    };
    Some((snapshot, carry))
}

/// `(now - then) / then * 100`; `None` when `then` is zero or the result overflows.
pub fn percent_change(then: f64, now: f64) -> Option<f64> {
    if then == 0.0 || !then.is_finite() || !now.is_finite() {
        return None;
    }
    Some((now - then) / then * 100.0).filter(|change| change.is_finite())
}

pub fn simple_moving_average(prices: &[f64]) -> Option<f64> {
    if prices.is_empty() {
        return None;
    }
    Some(prices.iter().sum::<f64>() / prices.len() as f64)
}

pub fn ema_step(alpha: f64, price: f64, previous: f64) -> f64 {
    alpha * price + (1.0 - alpha) * previous
}

/// Percent returns between consecutive prices; pairs starting at zero are skipped.
pub fn percent_returns(prices: &[f64]) -> Vec<f64> {
    prices
        .windows(2)
        .filter_map(|pair| percent_change(pair[0], pair[1]))
        .collect()
}

/// Sample standard deviation (n - 1); `None` below two values.
pub fn sample_std_dev(values: &[f64]) -> Option<f64> {
    if values.len() < 2 {
        return None;
    }
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    let var = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (n - 1.0);
    Some(var.max(0.0).sqrt()).filter(|std| std.is_finite())
}
