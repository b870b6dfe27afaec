use serde::Deserialize;
use serde_json::{json, Value};
use std::fs::File;
use std::path::{Path, PathBuf};
use tickscope_domain::repositories::tick_source::{SourceError, TickSource};

#[derive(Debug, Deserialize)]
pub struct CsvTickRecord {
    pub id: String,
    pub symbol: String,
    pub price: String,
    pub timestamp: String,
}

impl CsvTickRecord {
    /// Re-encodes the row as the JSON payload the normalizer expects. Numeric cells become
    /// JSON numbers; anything else is passed through as a string for the normalizer to judge.
    pub fn to_payload(&self) -> String {
        let price = self
            .price
            .trim()
            .parse::<f64>()
            .ok()
            .and_then(|p| serde_json::Number::from_f64(p).map(Value::Number))
            .unwrap_or_else(|| Value::String(self.price.clone()));
        let timestamp = match self.timestamp.trim().parse::<i64>() {
            Ok(ts) => Value::from(ts),
            Err(_) => Value::String(self.timestamp.trim().to_string()),
        };
        json!({
            "id": self.id,
            "symbol": self.symbol,
            "price": price,
            "timestamp": timestamp,
        })
        .to_string()
    }
}

/// `id,symbol,price,timestamp` export read front to back. Rows that do not parse are logged
/// and skipped.
#[derive(Debug)]
pub struct CsvFileSource {
    path: PathBuf,
    reader: csv::Reader<File>,
    headers: csv::StringRecord,
    exhausted: bool,
    skipped_rows: u64,
}

impl CsvFileSource {
    pub fn open(path: &Path) -> Result<Self, String> {
        let file = File::open(path)
            .map_err(|err| format!("failed to open tick CSV {}: {}", path.display(), err))?;
        let mut reader = csv::ReaderBuilder::new().trim(csv::Trim::All).from_reader(file);
        let headers = reader
            .headers()
            .map_err(|err| format!("failed to read CSV header {}: {}", path.display(), err))?
            .clone();
        for column in ["id", "symbol", "price", "timestamp"] {
            if !headers.iter().any(|h| h == column) {
                return Err(format!(
                    "tick CSV {} is missing column '{column}'",
                    path.display()
                ));
            }
        }
        Ok(Self {
            path: path.to_path_buf(),
            reader,
            headers,
            exhausted: false,
            skipped_rows: 0,
        })
    }

    pub fn skipped_rows(&self) -> u64 {
        self.skipped_rows
    }

    fn skip(&mut self, err: impl std::fmt::Display) {
        self.skipped_rows += 1;
        metrics::counter!("tickscope.infra.source.skipped_lines_total").increment(1);
        tracing::warn!(path = %self.path.display(), error = %err, "skipping CSV row");
    }
}

impl TickSource for CsvFileSource {
    fn poll(&mut self, max: usize) -> Result<Vec<String>, SourceError> {
        let mut out = Vec::new();
        let mut record = csv::StringRecord::new();
        while !self.exhausted && out.len() < max {
            match self.reader.read_record(&mut record) {
                Ok(true) => match record.deserialize::<CsvTickRecord>(Some(&self.headers)) {
                    Ok(row) => out.push(row.to_payload()),
                    Err(err) => self.skip(err),
                },
                Ok(false) => {
                    self.exhausted = true;
                    tracing::debug!(path = %self.path.display(), "tick CSV exhausted");
                }
                Err(err) if err.is_io_error() => {
                    return Err(SourceError::Fatal(format!(
                        "failed to read {}: {}",
                        self.path.display(),
                        err
                    )))
                }
                Err(err) => self.skip(err),
            }
        }
        metrics::counter!("tickscope.infra.source.payloads_total", "kind" => "csv")
            .increment(out.len() as u64);
        Ok(out)
    }

    fn is_exhausted(&self) -> bool {
        self.exhausted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{SystemTime, UNIX_EPOCH};
    use tickscope_domain::services::normalizer::normalize_str;

    fn write_temp(name: &str, contents: &str) -> PathBuf {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or(0);
        let path =
            std::env::temp_dir().join(format!("tickscope_{name}_{}_{now}.csv", std::process::id()));
        std::fs::write(&path, contents).unwrap();
        path
    }

    #[test]
    fn rows_become_normalizable_payloads() {
        let path = write_temp(
            "rows",
            "id,symbol,price,timestamp\n\
             bitcoin,btc,42000.5,1704067200\n\
             ethereum,eth,2300,2024-01-01T00:00:00Z\n",
        );
        let mut source = CsvFileSource::open(&path).unwrap();
        let payloads = source.poll(10).unwrap();
        assert_eq!(payloads.len(), 2);
        assert!(source.is_exhausted());

        let btc = normalize_str(&payloads[0]).unwrap();
        assert_eq!(btc.symbol, "BTC");
        assert_eq!(btc.timestamp, 1_704_067_200_000);
        assert_eq!(btc.price, 42000.5);
        let eth = normalize_str(&payloads[1]).unwrap();
        assert_eq!(eth.timestamp, 1_704_067_200_000);
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn bad_cells_reach_the_normalizer_and_short_rows_are_skipped() {
        let path = write_temp(
            "bad",
            "id,symbol,price,timestamp\n\
             bitcoin,BTC,abc,1704067200\n\
             short,row\n\
             ethereum,ETH,1.0,1704067200\n",
        );
        let mut source = CsvFileSource::open(&path).unwrap();
        let payloads = source.poll(10).unwrap();
        assert_eq!(payloads.len(), 2);
        assert_eq!(source.skipped_rows(), 1);
        assert!(normalize_str(&payloads[0]).is_err());
        assert!(normalize_str(&payloads[1]).is_ok());
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn missing_column_is_rejected_at_open() {
        let path = write_temp("cols", "id,symbol,price\nbitcoin,BTC,1\n");
        let err = CsvFileSource::open(&path).unwrap_err();
        assert!(err.contains("missing column 'timestamp'"));
        std::fs::remove_file(&path).ok();
    }
}
