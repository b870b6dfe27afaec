pub mod indicators;
pub mod normalizer;
pub mod ranking;
pub mod window;
