use serde::{Deserialize, Serialize};
use std::fmt;

/// Which indicator the movers ranking sorts on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum RankingMetric {
    #[default]
    #[serde(rename = "change_1min")]
    Change1Min,
    #[serde(rename = "change_5min")]
    Change5Min,
}

impl RankingMetric {
    pub fn as_str(self) -> &'static str {
        match self {
            RankingMetric::Change1Min => "change_1min",
            RankingMetric::Change5Min => "change_5min",
        }
    }
}

impl fmt::Display for RankingMetric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RankingKind {
    Gainers,
    Losers,
}

impl RankingKind {
    pub fn as_str(self) -> &'static str {
        match self {
            RankingKind::Gainers => "gainers",
            RankingKind::Losers => "losers",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RankingEntry {
    pub rank: u32,
    pub id: String,
    pub symbol: String,
    /// Metric value the entry was ranked on (percent).
    pub change: f64,
}

/// Gainer and loser lists of one ranking cycle. Replaced wholesale each cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ranking {
    pub cycle: u64,
    pub ranked_at: i64,
    pub metric: RankingMetric,
    pub gainers: Vec<RankingEntry>,
    pub losers: Vec<RankingEntry>,
}

impl Ranking {
    pub fn entries(&self, kind: RankingKind) -> &[RankingEntry] {
        match kind {
            RankingKind::Gainers => &self.gainers,
            RankingKind::Losers => &self.losers,
        }
    }
}
