pub mod sink;
pub mod tick_source;
