use serde::{Deserialize, Serialize};

/// Indicators for one symbol at one evaluation cycle.
///
/// `timestamp` is the cycle's evaluation time (epoch ms); `id` and `price` come from the
/// latest tick at or before it. Indicator fields are `None` while history is insufficient.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndicatorSnapshot {
    pub timestamp: i64,
    pub id: String,
    pub symbol: String,
    pub price: f64,
    pub change_1min: Option<f64>,
    pub change_5min: Option<f64>,
    pub sma: Option<f64>,
    pub ema: Option<f64>,
    pub volatility: Option<f64>,
}
