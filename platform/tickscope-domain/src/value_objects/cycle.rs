use crate::value_objects::indicator_snapshot::IndicatorSnapshot;
use serde::Serialize;

/// The complete output of one evaluation cycle. Published as a unit.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CycleOutput {
    pub cycle: u64,
    pub evaluated_at: i64,
    pub snapshots: Vec<IndicatorSnapshot>,
}

impl CycleOutput {
    pub fn get(&self, symbol: &str) -> Option<&IndicatorSnapshot> {
        self.snapshots.iter().find(|s| s.symbol == symbol)
    }

    pub fn len(&self) -> usize {
        self.snapshots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshots.is_empty()
    }
}
