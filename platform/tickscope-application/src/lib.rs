pub mod board;
pub mod config;
pub mod engine;
pub mod pipeline;
pub mod replay;
pub mod scheduler;
pub mod sink_writer;
