use std::fs::File;
use std::io::{BufRead, BufReader, ErrorKind};
use std::path::{Path, PathBuf};
use tickscope_domain::repositories::tick_source::{SourceError, TickSource};

/// Newline-delimited JSON tick file.
///
/// In follow mode the reader keeps its offset at end of file and picks up lines appended
/// later; a trailing line without its newline is held back until the rest arrives.
/// Without follow the source is exhausted at the first end of file.
#[derive(Debug)]
pub struct JsonlFileSource {
    path: PathBuf,
    reader: BufReader<File>,
    follow: bool,
    partial: String,
    exhausted: bool,
    lines_read: u64,
}

impl JsonlFileSource {
    pub fn open(path: &Path, follow: bool) -> Result<Self, String> {
        let file = File::open(path)
            .map_err(|err| format!("failed to open tick file {}: {}", path.display(), err))?;
        Ok(Self {
            path: path.to_path_buf(),
            reader: BufReader::new(file),
            follow,
            partial: String::new(),
            exhausted: false,
            lines_read: 0,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn lines_read(&self) -> u64 {
        self.lines_read
    }

    fn push_line(&mut self, out: &mut Vec<String>, line: String) {
        self.lines_read += 1;
        let trimmed = line.trim();
        if !trimmed.is_empty() {
            out.push(trimmed.to_string());
        }
    }
}

impl TickSource for JsonlFileSource {
    fn poll(&mut self, max: usize) -> Result<Vec<String>, SourceError> {
        let mut out = Vec::new();
        if self.exhausted {
            return Ok(out);
        }
        while out.len() < max {
            let mut buf = String::new();
            let read = match self.reader.read_line(&mut buf) {
                Ok(read) => read,
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) if err.kind() == ErrorKind::InvalidData => {
                    // Not UTF-8. read_line already consumed the bytes.
                    tracing::warn!(path = %self.path.display(), error = %err, "skipping undecodable line");
                    metrics::counter!("tickscope.infra.source.skipped_lines_total").increment(1);
                    continue;
                }
                Err(err) => {
                    return Err(SourceError::Fatal(format!(
                        "failed to read {}: {}",
                        self.path.display(),
                        err
                    )))
                }
            };

            if read == 0 {
                if !self.follow {
                    let rest = std::mem::take(&mut self.partial);
                    if !rest.is_empty() {
                        self.push_line(&mut out, rest);
                    }
                    self.exhausted = true;
                    tracing::debug!(path = %self.path.display(), lines = self.lines_read, "tick file exhausted");
                }
                break;
            }

            if buf.ends_with('\n') {
                let mut line = std::mem::take(&mut self.partial);
                line.push_str(&buf);
                self.push_line(&mut out, line);
            } else {
                self.partial.push_str(&buf);
                if self.follow {
                    break;
                }
            }
        }
        metrics::counter!("tickscope.infra.source.payloads_total", "kind" => "jsonl")
            .increment(out.len() as u64);
        Ok(out)
    }

    fn is_exhausted(&self) -> bool {
        self.exhausted
    }
}
