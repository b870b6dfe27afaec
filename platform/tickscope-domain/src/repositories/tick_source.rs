use std::collections::VecDeque;

#[derive(Debug, Clone, PartialEq)]
pub enum SourceError {
    Transient(String),
    Fatal(String),
}

impl std::fmt::Display for SourceError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SourceError::Transient(msg) => write!(f, "transient: {msg}"),
            SourceError::Fatal(msg) => write!(f, "fatal: {msg}"),
        }
    }
}

/// Ordered supply of raw tick payloads (one JSON object per message).
pub trait TickSource {
    /// Returns up to `max` payloads; an empty batch means nothing is available right now.
    fn poll(&mut self, max: usize) -> Result<Vec<String>, SourceError>;

    /// True once the source will never yield again (end of a finite file).
    fn is_exhausted(&self) -> bool {
        false
    }
}

/// In-memory source over a fixed list of payloads.
#[derive(Debug, Clone, Default)]
pub struct VecTickSource {
    payloads: VecDeque<String>,
}

impl VecTickSource {
    pub fn new(payloads: Vec<String>) -> Self {
        Self {
            payloads: payloads.into(),
        }
    }

    pub fn len(&self) -> usize {
        self.payloads.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payloads.is_empty()
    }
}

impl TickSource for VecTickSource {
    fn poll(&mut self, max: usize) -> Result<Vec<String>, SourceError> {
        let take = max.min(self.payloads.len());
        Ok(self.payloads.drain(..take).collect())
    }

    fn is_exhausted(&self) -> bool {
        self.payloads.is_empty()
    }
}
