use std::future::Future;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// A job fired on a fixed cadence until the shutdown flag flips to `true`.
///
/// Ticks are never queued: when a run overruns the period, missed ticks are skipped so a
/// slow cycle delays the next one instead of stacking runs.
pub struct RecurringTask {
    name: &'static str,
    handle: JoinHandle<u64>,
}

impl RecurringTask {
    /// `job` receives the 1-based run number. The first run fires immediately.
    pub fn spawn<F, Fut>(
        name: &'static str,
        period: Duration,
        mut shutdown: watch::Receiver<bool>,
        mut job: F,
    ) -> Self
    where
        F: FnMut(u64) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            let mut runs = 0u64;
            loop {
                if *shutdown.borrow() {
                    break;
                }
                tokio::select! {
                    _ = interval.tick() => {}
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                        continue;
                    }
                }
                runs += 1;
                job(runs).await;
            }
            tracing::debug!(task = name, runs, "recurring task stopped");
            runs
        });
        Self { name, handle }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Waits for the task to stop and returns how many runs completed.
    pub async fn join(self) -> Result<u64, String> {
        self.handle
            .await
            .map_err(|err| format!("task {} failed: {err}", self.name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn runs_until_shutdown() {
        let (tx, rx) = watch::channel(false);
        let seen = Arc::new(AtomicU64::new(0));
        let counter = seen.clone();
        let task = RecurringTask::spawn("test", Duration::from_secs(10), rx, move |run| {
            let counter = counter.clone();
            async move {
                counter.store(run, Ordering::SeqCst);
            }
        });

        tokio::time::sleep(Duration::from_secs(25)).await;
        tx.send(true).unwrap();
        let runs = task.join().await.unwrap();

        // Fires at 0s, 10s and 20s.
        assert_eq!(runs, 3);
        assert_eq!(seen.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn stops_when_sender_is_dropped() {
        let (tx, rx) = watch::channel(false);
        let task = RecurringTask::spawn("test", Duration::from_secs(60), rx, |_| async {});
        tokio::time::sleep(Duration::from_secs(1)).await;
        drop(tx);
        assert_eq!(task.join().await.unwrap(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn already_stopped_never_runs() {
        let (_tx, rx) = watch::channel(true);
        let task = RecurringTask::spawn("test", Duration::from_secs(1), rx, |_| async {});
        assert_eq!(task.join().await.unwrap(), 0);
    }
}
