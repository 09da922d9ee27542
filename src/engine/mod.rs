pub mod coordinator;
pub mod divergence;
pub mod indicators;
