pub mod persistence;
pub mod sources;
