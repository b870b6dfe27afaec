use crate::engine::{AnalyticsEngine, EngineSettings, IngestReport};
use crate::sink_writer::{SinkWriter, WriteOutcome};
use serde::Serialize;
use std::sync::Arc;
use tickscope_domain::repositories::sink::MetricsSink;
use tickscope_domain::repositories::tick_source::{SourceError, TickSource};
use tickscope_domain::value_objects::ranking::Ranking;
use tickscope_domain::value_objects::tick::Tick;
use tracing::info_span;

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ReplaySummary {
    pub evaluation_cycles: u64,
    pub ranking_cycles: u64,
    pub ingest: IngestReport,
    pub snapshots_written: u64,
    /// Steps jumped over while every window was empty.
    pub idle_cycles_skipped: u64,
    pub first_tick_at: Option<i64>,
    pub last_tick_at: Option<i64>,
    pub final_ranking: Option<Ranking>,
}

/// Replays a finite source on event time.
///
/// The clock starts at the earliest tick and advances by `step_ms`. Before each evaluation
/// the ticks stamped at or before the clock are released, in file order among themselves.
/// While every window is empty the clock jumps straight to the step holding the next tick,
/// so a gap in the input costs one cycle rather than one per step. A ranking runs every
/// `ranking_interval_ms` of event time and once more after the last evaluation.
pub fn replay(
    settings: EngineSettings,
    source: &mut dyn TickSource,
    sink: Arc<dyn MetricsSink + Send + Sync>,
    step_ms: i64,
) -> Result<ReplaySummary, String> {
    if step_ms <= 0 {
        return Err(format!("replay step must be > 0 (got {step_ms}ms)"));
    }
    let ranking_interval_ms = settings.ranking_interval_ms;
    if ranking_interval_ms <= 0 {
        return Err(format!(
            "ranking_interval must be > 0 (got {ranking_interval_ms}ms)"
        ));
    }
    let batch_size = settings.batch_size.max(1);
    let writer = SinkWriter::new(sink, settings.retry);
    let engine = AnalyticsEngine::new(settings)?;

    let payloads = drain(source, batch_size)?;
    let (ticks, rejected) = engine.normalize_batch(&payloads);
    let mut summary = ReplaySummary {
        first_tick_at: ticks.iter().map(|t| t.timestamp).min(),
        last_tick_at: ticks.iter().map(|t| t.timestamp).max(),
        ..ReplaySummary::default()
    };
    summary.ingest.received = rejected;
    summary.ingest.rejected = rejected;

    let (Some(start), Some(end)) = (summary.first_tick_at, summary.last_tick_at) else {
        tracing::warn!(payloads = payloads.len(), "replay input holds no valid ticks");
        return Ok(summary);
    };
    let _span = info_span!("replay", start, end, step_ms).entered();

    let mut queued: Vec<(usize, Tick)> = ticks.into_iter().enumerate().collect();
    queued.sort_by_key(|(idx, tick)| (tick.timestamp, *idx));
    let mut pending = queued.into_iter().peekable();
    let mut next_rank_at = start.saturating_add(ranking_interval_ms);
    let mut last_ranked_at = None;
    let mut clock = start;
    loop {
        let mut released: Vec<(usize, Tick)> = Vec::new();
        while let Some(entry) = pending.next_if(|(_, tick)| tick.timestamp <= clock) {
            released.push(entry);
        }
        released.sort_by_key(|(idx, _)| *idx);
        let released = released.into_iter().map(|(_, tick)| tick).collect();
        summary.ingest.merge(&engine.ingest_ticks(released, clock));

        let output = engine.evaluate(clock);
        summary.evaluation_cycles += 1;
        let rows = output.snapshots.len() as u64;
        if writer.write_snapshots(output.snapshots.clone()) == WriteOutcome::Written {
            summary.snapshots_written += rows;
        }

        if clock >= next_rank_at {
            rank_at(&engine, &writer, clock, &mut summary);
            last_ranked_at = Some(clock);
            let missed = (clock - next_rank_at) / ranking_interval_ms + 1;
            next_rank_at = next_rank_at.saturating_add(missed.saturating_mul(ranking_interval_ms));
        }

        let Some((_, next_tick)) = pending.peek() else {
            if clock >= end {
                break;
            }
            clock = clock.saturating_add(step_ms);
            continue;
        };
        let mut steps = 1;
        if engine.tracked_symbols() == 0 && next_tick.timestamp > clock.saturating_add(step_ms) {
            steps = (next_tick.timestamp - clock + step_ms - 1) / step_ms;
            summary.idle_cycles_skipped += (steps - 1) as u64;
            tracing::debug!(from = clock, skipped = steps - 1, "windows empty; jumping to the next tick");
        }
        clock = clock.saturating_add(steps.saturating_mul(step_ms));
    }

    if last_ranked_at != Some(clock) {
        rank_at(&engine, &writer, clock, &mut summary);
    }
    writer.flush_deferred();

    tracing::info!(
        evaluation_cycles = summary.evaluation_cycles,
        ranking_cycles = summary.ranking_cycles,
        accepted = summary.ingest.accepted(),
        rejected = summary.ingest.rejected,
        "replay finished"
    );
    Ok(summary)
}

fn rank_at(engine: &AnalyticsEngine, writer: &SinkWriter, now: i64, summary: &mut ReplaySummary) {
    if let Some(ranking) = engine.rank(now) {
        summary.ranking_cycles += 1;
        writer.replace_rankings(ranking.clone());
        summary.final_ranking = Some(ranking);
    }
}

fn drain(source: &mut dyn TickSource, batch_size: usize) -> Result<Vec<String>, String> {
    let mut payloads = Vec::new();
    loop {
        match source.poll(batch_size) {
            Ok(batch) if batch.is_empty() => break,
            Ok(batch) => payloads.extend(batch),
            Err(SourceError::Transient(msg)) => {
                tracing::warn!(error = %msg, "stopping replay input early");
                break;
            }
            Err(SourceError::Fatal(msg)) => return Err(format!("failed to read replay input: {msg}")),
        }
        if source.is_exhausted() {
            break;
        }
    }
    Ok(payloads)
}
