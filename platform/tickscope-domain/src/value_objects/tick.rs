use serde::{Deserialize, Serialize};

/// One price observation for one symbol. `timestamp` is epoch milliseconds (UTC).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tick {
    pub timestamp: i64,
    pub id: String,
    pub symbol: String,
    pub price: f64,
}
