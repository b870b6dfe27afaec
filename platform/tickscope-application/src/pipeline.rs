use crate::engine::{AnalyticsEngine, EngineSettings, IngestReport};
use crate::scheduler::RecurringTask;
use crate::sink_writer::{SinkWriter, WriteOutcome};
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tickscope_domain::repositories::sink::MetricsSink;
use tickscope_domain::repositories::tick_source::{SourceError, TickSource};
use tokio::sync::watch;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PipelineSummary {
    pub evaluation_cycles: u64,
    pub ranking_cycles: u64,
    pub rankings_written: u64,
    pub ingest: IngestReport,
    pub snapshots_written: u64,
    pub deferred_batches: usize,
    pub source_errors: u64,
}

type SharedSource = Arc<Mutex<Box<dyn TickSource + Send>>>;

struct PipelineContext {
    engine: AnalyticsEngine,
    writer: SinkWriter,
    source: SharedSource,
    summary: Mutex<PipelineSummary>,
    fatal: Mutex<Option<String>>,
    exhausted_logged: Mutex<bool>,
}

pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Runs the evaluation and ranking cadences on wall-clock time until `shutdown` flips to
/// `true` or the source fails fatally.
///
/// Sink and source calls are blocking and run on the blocking pool. The in-flight cycle of
/// each cadence completes before this returns.
pub async fn run_pipeline(
    settings: EngineSettings,
    source: Box<dyn TickSource + Send>,
    sink: Arc<dyn MetricsSink + Send + Sync>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<PipelineSummary, String> {
    let eval_period = period("eval_interval", settings.eval_interval_ms)?;
    let ranking_period = period("ranking_interval", settings.ranking_interval_ms)?;
    let writer = SinkWriter::new(sink, settings.retry);
    let engine = AnalyticsEngine::new(settings)?;

    let ctx = Arc::new(PipelineContext {
        engine,
        writer,
        source: Arc::new(Mutex::new(source)),
        summary: Mutex::new(PipelineSummary::default()),
        fatal: Mutex::new(None),
        exhausted_logged: Mutex::new(false),
    });

    // Internal stop signal: set by the caller's shutdown or by a fatal source error.
    let (stop_tx, stop_rx) = watch::channel(false);
    let stop_tx = Arc::new(stop_tx);

    tracing::info!(
        eval_interval_ms = eval_period.as_millis() as u64,
        ranking_interval_ms = ranking_period.as_millis() as u64,
        "pipeline starting"
    );

    let evaluation = {
        let ctx = ctx.clone();
        let stop_tx = stop_tx.clone();
        RecurringTask::spawn("evaluation", eval_period, stop_rx.clone(), move |_| {
            let ctx = ctx.clone();
            let stop_tx = stop_tx.clone();
            async move {
                let job_ctx = ctx.clone();
                let result =
                    tokio::task::spawn_blocking(move || evaluation_cycle(&job_ctx, now_ms())).await;
                match result {
                    Ok(Ok(())) => {}
                    Ok(Err(err)) => {
                        tracing::error!(error = %err, "source failed; stopping pipeline");
                        *ctx.fatal.lock() = Some(err);
                        let _ = stop_tx.send(true);
                    }
                    Err(err) => tracing::error!(error = %err, "evaluation cycle panicked"),
                }
            }
        })
    };

    let ranking = {
        let ctx = ctx.clone();
        RecurringTask::spawn("ranking", ranking_period, stop_rx, move |_| {
            let ctx = ctx.clone();
            async move {
                let job_ctx = ctx.clone();
                let result =
                    tokio::task::spawn_blocking(move || ranking_cycle(&job_ctx, now_ms())).await;
                if let Err(err) = result {
                    tracing::error!(error = %err, "ranking cycle panicked");
                }
            }
        })
    };

    let mut stopped = stop_tx.subscribe();
    loop {
        if *shutdown.borrow() || *stopped.borrow() {
            break;
        }
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() {
                    break;
                }
            }
            changed = stopped.changed() => {
                if changed.is_err() {
                    break;
                }
            }
        }
    }
    let _ = stop_tx.send(true);
    tracing::info!("pipeline shutting down");

    evaluation.join().await?;
    ranking.join().await?;

    let flush_ctx = ctx.clone();
    let flushed = tokio::task::spawn_blocking(move || flush_ctx.writer.flush_deferred())
        .await
        .map_err(|err| format!("final flush failed: {err}"))?;
    if flushed > 0 {
        tracing::info!(batches = flushed, "flushed deferred writes on shutdown");
    }

    let mut summary = ctx.summary.lock().clone();
    summary.deferred_batches = ctx.writer.deferred_snapshot_batches();
    if summary.deferred_batches > 0 {
        tracing::warn!(batches = summary.deferred_batches, "exiting with unwritten snapshot batches");
    }
    if let Some(err) = ctx.fatal.lock().take() {
        return Err(err);
    }
    Ok(summary)
}

fn period(name: &str, ms: i64) -> Result<Duration, String> {
    u64::try_from(ms)
        .ok()
        .filter(|ms| *ms > 0)
        .map(Duration::from_millis)
        .ok_or_else(|| format!("{name} must be > 0 (got {ms}ms)"))
}

fn evaluation_cycle(ctx: &PipelineContext, now: i64) -> Result<(), String> {
    ctx.writer.flush_deferred();

    let batch_size = ctx.engine.settings().batch_size;
    let polled = {
        let mut source = ctx.source.lock();
        let polled = source.poll(batch_size);
        if source.is_exhausted() {
            let mut logged = ctx.exhausted_logged.lock();
            if !*logged {
                tracing::info!("tick source exhausted; evaluating retained windows only");
                *logged = true;
            }
        }
        polled
    };
    let payloads = match polled {
        Ok(payloads) => payloads,
        Err(SourceError::Transient(msg)) => {
            ctx.summary.lock().source_errors += 1;
            tracing::warn!(error = %msg, "tick source unavailable; evaluating without new ticks");
            Vec::new()
        }
        Err(SourceError::Fatal(msg)) => {
            ctx.summary.lock().source_errors += 1;
            return Err(format!("tick source failed: {msg}"));
        }
    };

    let report = ctx.engine.ingest(&payloads, now);
    let output = ctx.engine.evaluate(now);
    let rows = output.snapshots.len() as u64;
    let outcome = ctx.writer.write_snapshots(output.snapshots.clone());

    let mut summary = ctx.summary.lock();
    summary.evaluation_cycles += 1;
    summary.ingest.merge(&report);
    if outcome == WriteOutcome::Written {
        summary.snapshots_written += rows;
    }
    Ok(())
}

fn ranking_cycle(ctx: &PipelineContext, now: i64) {
    let Some(ranking) = ctx.engine.rank(now) else {
        return;
    };
    let outcome = ctx.writer.replace_rankings(ranking);
    let mut summary = ctx.summary.lock();
    summary.ranking_cycles += 1;
    if outcome == WriteOutcome::Written {
        summary.rankings_written += 1;
    }
}
