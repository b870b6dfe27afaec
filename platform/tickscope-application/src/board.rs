use parking_lot::RwLock;
use std::sync::Arc;
use tickscope_domain::value_objects::cycle::CycleOutput;

/// Latest complete evaluation cycle, shared between the evaluation and ranking cadences.
///
/// A cycle is built off to the side and published with a single pointer swap, so readers
/// see either the previous cycle or the new one in full.
#[derive(Debug, Default)]
pub struct SnapshotBoard {
    latest: RwLock<Option<Arc<CycleOutput>>>,
}

impl SnapshotBoard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn publish(&self, output: CycleOutput) -> Arc<CycleOutput> {
        let output = Arc::new(output);
        *self.latest.write() = Some(output.clone());
        output
    }

    pub fn latest(&self) -> Option<Arc<CycleOutput>> {
        self.latest.read().clone()
    }

    pub fn latest_cycle(&self) -> Option<u64> {
        self.latest.read().as_ref().map(|c| c.cycle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn output(cycle: u64) -> CycleOutput {
        CycleOutput {
            cycle,
            evaluated_at: cycle as i64 * 1000,
            snapshots: Vec::new(),
        }
    }

    #[test]
    fn empty_until_first_publish() {
        let board = SnapshotBoard::new();
        assert!(board.latest().is_none());
        board.publish(output(1));
        assert_eq!(board.latest_cycle(), Some(1));
    }

    #[test]
    fn readers_keep_their_cycle_after_swap() {
        let board = SnapshotBoard::new();
        board.publish(output(1));
        let held = board.latest().unwrap();
        board.publish(output(2));
        assert_eq!(held.cycle, 1);
        assert_eq!(board.latest().unwrap().cycle, 2);
    }

    #[test]
    fn concurrent_readers_only_see_whole_cycles() {
        let board = Arc::new(SnapshotBoard::new());
        let writer = {
            let board = board.clone();
            std::thread::spawn(move || {
                for cycle in 1..=200u64 {
                    board.publish(output(cycle));
                }
            })
        };
        let mut last = 0;
        for _ in 0..1000 {
            if let Some(current) = board.latest() {
                assert_eq!(current.evaluated_at, current.cycle as i64 * 1000);
                assert!(current.cycle >= last);
                last = current.cycle;
            }
        }
        writer.join().unwrap();
        assert_eq!(board.latest_cycle(), Some(200));
    }
}
