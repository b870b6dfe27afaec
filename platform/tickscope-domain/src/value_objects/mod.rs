pub mod cycle;
pub mod duration;
pub mod indicator_snapshot;
pub mod ranking;
pub mod tick;
