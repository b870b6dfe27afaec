use crate::value_objects::indicator_snapshot::IndicatorSnapshot;
use crate::value_objects::ranking::{Ranking, RankingEntry, RankingMetric};
use std::cmp::Ordering;

pub const RANKING_SIZE: usize = 5;

pub fn metric_value(snapshot: &IndicatorSnapshot, metric: RankingMetric) -> Option<f64> {
    let value = match metric {
        RankingMetric::Change1Min => snapshot.change_1min,
        RankingMetric::Change5Min => snapshot.change_5min,
    };
    value.filter(|v| v.is_finite())
}

/// Top movers by `metric`.
///
/// Gainers hold strictly positive values (descending), losers strictly negative values
/// (ascending); both are capped at [`RANKING_SIZE`] and never padded. Equal values are
/// ordered by symbol so the output only depends on the input set.
pub fn rank(
    cycle: u64,
    ranked_at: i64,
    snapshots: &[IndicatorSnapshot],
    metric: RankingMetric,
) -> Ranking {
    let eligible: Vec<(&IndicatorSnapshot, f64)> = snapshots
        .iter()
        .filter_map(|s| metric_value(s, metric).map(|v| (s, v)))
        .collect();

    let mut gainers: Vec<(&IndicatorSnapshot, f64)> =
        eligible.iter().copied().filter(|(_, v)| *v > 0.0).collect();
    gainers.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| by_symbol(a.0, b.0)));

    let mut losers: Vec<(&IndicatorSnapshot, f64)> =
        eligible.iter().copied().filter(|(_, v)| *v < 0.0).collect();
    losers.sort_by(|a, b| a.1.total_cmp(&b.1).then_with(|| by_symbol(a.0, b.0)));

    Ranking {
        cycle,
        ranked_at,
        metric,
        gainers: to_entries(gainers),
        losers: to_entries(losers),
    }
}

fn by_symbol(a: &IndicatorSnapshot, b: &IndicatorSnapshot) -> Ordering {
    a.symbol.cmp(&b.symbol)
}

fn to_entries(sorted: Vec<(&IndicatorSnapshot, f64)>) -> Vec<RankingEntry> {
    sorted
        .into_iter()
        .take(RANKING_SIZE)
        .enumerate()
        .map(|(idx, (snapshot, change))| RankingEntry {
            rank: idx as u32 + 1,
            id: snapshot.id.clone(),
            symbol: snapshot.symbol.clone(),
            change,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snap(symbol: &str, change_1min: Option<f64>) -> IndicatorSnapshot {
        IndicatorSnapshot {
            timestamp: 0,
            id: symbol.to_lowercase(),
            symbol: symbol.to_string(),
            price: 1.0,
            change_1min,
            change_5min: change_1min.map(|v| -v),
            sma: None,
            ema: None,
            volatility: None,
        }
    }

    fn symbols(entries: &[RankingEntry]) -> Vec<&str> {
        entries.iter().map(|e| e.symbol.as_str()).collect()
    }

    #[test]
    fn two_symbols_are_not_padded() {
        let ranking = rank(
            1,
            0,
            &[snap("BTC", Some(5.0)), snap("ETH", Some(-3.0))],
            RankingMetric::Change1Min,
        );
        assert_eq!(ranking.gainers.len(), 1);
        assert_eq!(ranking.gainers[0].rank, 1);
        assert_eq!(ranking.gainers[0].symbol, "BTC");
        assert_eq!(ranking.losers.len(), 1);
        assert_eq!(ranking.losers[0].rank, 1);
        assert_eq!(ranking.losers[0].symbol, "ETH");
    }

    #[test]
    fn caps_at_five_and_sorts_each_list() {
        let input: Vec<IndicatorSnapshot> = (1..=7)
            .flat_map(|i| {
                vec![
                    snap(&format!("UP{i}"), Some(i as f64)),
                    snap(&format!("DN{i}"), Some(-(i as f64))),
                ]
            })
            .collect();
        let ranking = rank(3, 0, &input, RankingMetric::Change1Min);
        assert_eq!(symbols(&ranking.gainers), vec!["UP7", "UP6", "UP5", "UP4", "UP3"]);
        assert_eq!(symbols(&ranking.losers), vec!["DN7", "DN6", "DN5", "DN4", "DN3"]);
        let ranks: Vec<u32> = ranking.gainers.iter().map(|e| e.rank).collect();
        assert_eq!(ranks, vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn ties_break_by_symbol() {
        let input = vec![
            snap("SOL", Some(2.0)),
            snap("ADA", Some(2.0)),
            snap("XRP", Some(2.0)),
            snap("DOT", Some(-1.0)),
            snap("BNB", Some(-1.0)),
        ];
        let forward = rank(1, 0, &input, RankingMetric::Change1Min);
        let mut reversed_input = input.clone();
        reversed_input.reverse();
        let backward = rank(1, 0, &reversed_input, RankingMetric::Change1Min);

        assert_eq!(symbols(&forward.gainers), vec!["ADA", "SOL", "XRP"]);
        assert_eq!(symbols(&forward.losers), vec!["BNB", "DOT"]);
        assert_eq!(forward, backward);
    }

    #[test]
    fn nulls_and_flat_symbols_are_excluded() {
        let ranking = rank(
            1,
            0,
            &[snap("BTC", None), snap("ETH", Some(0.0)), snap("SOL", Some(1.0))],
            RankingMetric::Change1Min,
        );
        assert_eq!(symbols(&ranking.gainers), vec!["SOL"]);
        assert!(ranking.losers.is_empty());
    }

    #[test]
    fn ranks_on_selected_metric() {
        let ranking = rank(
            1,
            0,
            &[snap("BTC", Some(5.0)), snap("ETH", Some(-3.0))],
            RankingMetric::Change5Min,
        );
        assert_eq!(symbols(&ranking.gainers), vec!["ETH"]);
        assert_eq!(symbols(&ranking.losers), vec!["BTC"]);
        assert_eq!(ranking.metric, RankingMetric::Change5Min);
    }

    #[test]
    fn empty_input_gives_empty_lists() {
        let ranking = rank(1, 0, &[], RankingMetric::Change1Min);
        assert!(ranking.gainers.is_empty());
        assert!(ranking.losers.is_empty());
    }
}
