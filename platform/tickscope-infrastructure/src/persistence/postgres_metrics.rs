use chrono::{DateTime, TimeZone, Utc};
use postgres::NoTls;
use r2d2::Pool;
use r2d2_postgres::PostgresConnectionManager;
use std::time::{Duration, Instant};
use tickscope_domain::repositories::sink::{MetricsSink, SinkError};
use tickscope_domain::value_objects::indicator_snapshot::IndicatorSnapshot;
use tickscope_domain::value_objects::ranking::{Ranking, RankingEntry, RankingKind};

type PgPool = Pool<PostgresConnectionManager<NoTls>>;

const CONNECTION_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SinkTables {
    pub metrics: String,
    pub gainers: String,
    pub losers: String,
}

impl SinkTables {
    pub fn validate(&self) -> Result<(), String> {
        for (field, table) in [
            ("metrics_table", &self.metrics),
            ("gainers_table", &self.gainers),
            ("losers_table", &self.losers),
        ] {
            validate_table_name(table).map_err(|err| format!("invalid {field} '{table}': {err}"))?;
        }
        if self.gainers == self.losers {
            return Err(format!(
                "gainers_table and losers_table must differ (both '{}')",
                self.gainers
            ));
        }
        Ok(())
    }

    fn ranking(&self, kind: RankingKind) -> &str {
        match kind {
            RankingKind::Gainers => &self.gainers,
            RankingKind::Losers => &self.losers,
        }
    }
}

/// Metrics sink over a pooled Postgres connection.
///
/// Snapshot batches upsert on `(timestamp, symbol)`; rankings replace both ranking tables.
/// Every call runs in a single transaction.
#[derive(Debug, Clone)]
pub struct PostgresMetricsSink {
    pool: PgPool,
    tables: SinkTables,
}

impl PostgresMetricsSink {
    pub fn new(db_url: &str, tables: SinkTables, pool_max_size: u32) -> Result<Self, String> {
        tables.validate()?;
        let config = db_url
            .parse::<postgres::Config>()
            .map_err(|err| format!("invalid postgres db url: {err}"))?;
        let manager = PostgresConnectionManager::new(config, NoTls);
        // Connections open lazily; an unreachable database shows up as a transient write error.
        let pool = Pool::builder()
            .max_size(pool_max_size.max(1))
            .connection_timeout(CONNECTION_TIMEOUT)
            .build_unchecked(manager);
        Ok(Self { pool, tables })
    }

    pub fn tables(&self) -> &SinkTables {
        &self.tables
    }

    /// Creates the metrics and ranking tables when missing.
    pub fn migrate(&self) -> Result<(), String> {
        let _span = tracing::info_span!("infra.postgres.migrate").entered();
        let mut client = self
            .pool
            .get()
            .map_err(|err| format!("failed to checkout postgres connection: {err}"))?;
        client
            .batch_execute(&create_tables_sql(&self.tables))
            .map_err(|err| format!("migration failed: {err}"))?;
        tracing::info!(
            metrics = %self.tables.metrics,
            gainers = %self.tables.gainers,
            losers = %self.tables.losers,
            "sink tables ready"
        );
        Ok(())
    }

    fn checkout(
        &self,
        op: &'static str,
    ) -> Result<r2d2::PooledConnection<PostgresConnectionManager<NoTls>>, SinkError> {
        let get_start = Instant::now();
        match self.pool.get() {
            Ok(client) => {
                metrics::histogram!("tickscope.infra.postgres.pool.get_ms")
                    .record(get_start.elapsed().as_secs_f64() * 1000.0);
                Ok(client)
            }
            Err(err) => {
                metrics::counter!("tickscope.infra.postgres.errors_total", "op" => op, "stage" => "pool_get")
                    .increment(1);
                tracing::warn!(error = %err, "failed to checkout postgres connection");
                Err(SinkError::Transient(format!(
                    "failed to checkout postgres connection: {err}"
                )))
            }
        }
    }
}

impl MetricsSink for PostgresMetricsSink {
    fn write_snapshots(&self, rows: &[IndicatorSnapshot]) -> Result<usize, SinkError> {
        if rows.is_empty() {
            return Ok(0);
        }
        let started = Instant::now();
        let _span = tracing::info_span!(
            "infra.postgres.write_snapshots",
            table = %self.tables.metrics,
            rows = rows.len()
        )
        .entered();

        let mut client = self.checkout("write_snapshots")?;
        let mut transaction = client
            .transaction()
            .map_err(|err| classify("write_snapshots", "begin", err))?;
        let statement = transaction
            .prepare(&upsert_metrics_sql(&self.tables.metrics))
            .map_err(|err| classify("write_snapshots", "prepare", err))?;

        for row in rows {
            let timestamp = to_datetime(row.timestamp)?;
            transaction
                .execute(
                    &statement,
                    &[
                        &timestamp,
                        &row.id,
                        &row.symbol,
                        &row.price,
                        &row.change_1min,
                        &row.change_5min,
                        &row.sma,
                        &row.ema,
                        &row.volatility,
                    ],
                )
                .map_err(|err| classify("write_snapshots", "upsert", err))?;
        }
        transaction
            .commit()
            .map_err(|err| classify("write_snapshots", "commit", err))?;

        metrics::counter!("tickscope.infra.postgres.rows_written_total", "table" => "metrics")
            .increment(rows.len() as u64);
        metrics::histogram!("tickscope.infra.postgres.write_snapshots_ms")
            .record(started.elapsed().as_secs_f64() * 1000.0);
        tracing::debug!(rows = rows.len(), "upserted indicator snapshots");
        Ok(rows.len())
    }

    fn replace_rankings(&self, ranking: &Ranking) -> Result<(), SinkError> {
        let started = Instant::now();
        let _span = tracing::info_span!("infra.postgres.replace_rankings", cycle = ranking.cycle)
            .entered();
        let ranked_at = to_datetime(ranking.ranked_at)?;
        let cycle = i64::try_from(ranking.cycle)
            .map_err(|_| SinkError::Permanent(format!("cycle {} out of range", ranking.cycle)))?;

        let mut client = self.checkout("replace_rankings")?;
        let mut transaction = client
            .transaction()
            .map_err(|err| classify("replace_rankings", "begin", err))?;

        for kind in [RankingKind::Gainers, RankingKind::Losers] {
            let table = self.tables.ranking(kind);
            transaction
                .execute(format!("DELETE FROM {table}").as_str(), &[])
                .map_err(|err| classify("replace_rankings", "delete", err))?;
            let statement = transaction
                .prepare(&insert_ranking_sql(table))
                .map_err(|err| classify("replace_rankings", "prepare", err))?;
            for entry in ranking.entries(kind) {
                let RankingEntry {
                    rank,
                    id,
                    symbol,
                    change,
                } = entry;
                let rank = i32::try_from(*rank)
                    .map_err(|_| SinkError::Permanent(format!("rank {rank} out of range")))?;
                transaction
                    .execute(
                        &statement,
                        &[
                            &cycle,
                            &rank,
                            id,
                            symbol,
                            change,
                            &ranking.metric.as_str(),
                            &ranked_at,
                        ],
                    )
                    .map_err(|err| classify("replace_rankings", "insert", err))?;
            }
        }
        transaction
            .commit()
            .map_err(|err| classify("replace_rankings", "commit", err))?;

        metrics::histogram!("tickscope.infra.postgres.replace_rankings_ms")
            .record(started.elapsed().as_secs_f64() * 1000.0);
        tracing::debug!(
            gainers = ranking.gainers.len(),
            losers = ranking.losers.len(),
            "replaced rankings"
        );
        Ok(())
    }
}

pub fn create_tables_sql(tables: &SinkTables) -> String {
    let mut sql = format!(
        "CREATE TABLE IF NOT EXISTS {} (
            timestamp TIMESTAMPTZ NOT NULL,
            id TEXT NOT NULL,
            symbol TEXT NOT NULL,
            price DOUBLE PRECISION NOT NULL,
            change_1min DOUBLE PRECISION,
            change_5min DOUBLE PRECISION,
            sma DOUBLE PRECISION,
            ema DOUBLE PRECISION,
            volatility DOUBLE PRECISION,
            PRIMARY KEY (timestamp, symbol)
        );\n",
        tables.metrics
    );
    for table in [&tables.gainers, &tables.losers] {
        sql.push_str(&format!(
            "CREATE TABLE IF NOT EXISTS {table} (
                cycle BIGINT NOT NULL,
                rank INTEGER NOT NULL,
                id TEXT NOT NULL,
                symbol TEXT NOT NULL,
                change DOUBLE PRECISION NOT NULL,
                metric TEXT NOT NULL,
                ranked_at TIMESTAMPTZ NOT NULL,
                PRIMARY KEY (cycle, rank)
            );\n"
        ));
    }
    sql
}

fn upsert_metrics_sql(table: &str) -> String {
    format!(
        "INSERT INTO {table} (
            timestamp, id, symbol, price, change_1min, change_5min, sma, ema, volatility
        ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
        ON CONFLICT (timestamp, symbol)
        DO UPDATE SET
            id = EXCLUDED.id,
            price = EXCLUDED.price,
            change_1min = EXCLUDED.change_1min,
            change_5min = EXCLUDED.change_5min,
            sma = EXCLUDED.sma,
            ema = EXCLUDED.ema,
            volatility = EXCLUDED.volatility"
    )
}

fn insert_ranking_sql(table: &str) -> String {
    format!(
        "INSERT INTO {table} (cycle, rank, id, symbol, change, metric, ranked_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7)"
    )
}

fn to_datetime(timestamp_ms: i64) -> Result<DateTime<Utc>, SinkError> {
    Utc.timestamp_millis_opt(timestamp_ms)
        .single()
        .ok_or_else(|| SinkError::Permanent(format!("timestamp {timestamp_ms} out of range")))
}

/// Connection, transaction-rollback, resource and operator-intervention classes are worth
/// retrying; everything else (constraint, syntax, permission) is not.
fn classify(op: &'static str, stage: &'static str, err: postgres::Error) -> SinkError {
    metrics::counter!("tickscope.infra.postgres.errors_total", "op" => op, "stage" => stage)
        .increment(1);
    let transient = match err.code() {
        Some(state) => is_transient_sqlstate(state.code()),
        None => true,
    };
    tracing::warn!(error = %err, op, stage, transient, "postgres call failed");
    let msg = format!("{op} {stage} failed: {err}");
    if transient {
        SinkError::Transient(msg)
    } else {
        SinkError::Permanent(msg)
    }
}

fn is_transient_sqlstate(code: &str) -> bool {
    ["08", "40", "53", "57"]
        .iter()
        .any(|class| code.starts_with(class))
}

pub fn validate_table_name(table: &str) -> Result<(), String> {
    if table.is_empty() {
        return Err("table name is empty".to_string());
    }
    let parts: Vec<&str> = table.split('.').collect();
    if parts.len() > 2 {
        return Err(format!("invalid table name: {table}"));
    }
    for part in parts {
        let mut chars = part.chars();
        let first = match chars.next() {
            Some(ch) => ch,
            None => return Err(format!("invalid table name: {table}")),
        };
        if !(first.is_ascii_alphabetic() || first == '_') {
            return Err(format!("invalid table name: {table}"));
        }
        if !chars.all(|ch| ch.is_ascii_alphanumeric() || ch == '_') {
            return Err(format!("invalid table name: {table}"));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tables() -> SinkTables {
        SinkTables {
            metrics: "crypto_metrics".to_string(),
            gainers: "top_gainers".to_string(),
            losers: "top_losers".to_string(),
        }
    }

    #[test]
    fn validate_table_name_accepts_schema() {
        assert!(validate_table_name("crypto_metrics").is_ok());
        assert!(validate_table_name("analytics.crypto_metrics").is_ok());
        assert!(validate_table_name("").is_err());
        assert!(validate_table_name("metrics;drop").is_err());
        assert!(validate_table_name("a.b.c").is_err());
        assert!(validate_table_name("1metrics").is_err());
    }

    #[test]
    fn tables_must_be_distinct_and_valid() {
        assert!(tables().validate().is_ok());

        let mut same = tables();
        same.losers = same.gainers.clone();
        assert!(same.validate().unwrap_err().contains("must differ"));

        let mut bad = tables();
        bad.metrics = "drop table".to_string();
        assert!(bad.validate().unwrap_err().contains("metrics_table"));
    }

    #[test]
    fn new_rejects_invalid_db_url() {
        let err = PostgresMetricsSink::new("not a url", tables(), 1).unwrap_err();
        assert!(err.contains("invalid postgres db url"));
    }

    #[test]
    fn new_rejects_invalid_table_before_connect() {
        let mut bad = tables();
        bad.gainers = "gainers--".to_string();
        let err = PostgresMetricsSink::new("postgres://localhost/db", bad, 1).unwrap_err();
        assert!(err.contains("invalid gainers_table"));
    }

    #[test]
    fn ddl_keys_metrics_on_timestamp_and_symbol() {
        let sql = create_tables_sql(&tables());
        assert!(sql.contains("CREATE TABLE IF NOT EXISTS crypto_metrics"));
        assert!(sql.contains("PRIMARY KEY (timestamp, symbol)"));
        assert!(sql.contains("CREATE TABLE IF NOT EXISTS top_gainers"));
        assert!(sql.contains("CREATE TABLE IF NOT EXISTS top_losers"));
        assert!(upsert_metrics_sql("crypto_metrics").contains("ON CONFLICT (timestamp, symbol)"));
    }

    #[test]
    fn sqlstate_classes() {
        assert!(is_transient_sqlstate("08006"));
        assert!(is_transient_sqlstate("40001"));
        assert!(is_transient_sqlstate("53300"));
        assert!(is_transient_sqlstate("57P01"));
        assert!(!is_transient_sqlstate("23505"));
        assert!(!is_transient_sqlstate("42P01"));
    }
}
