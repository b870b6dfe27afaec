pub mod memory;
pub mod postgres_metrics;
