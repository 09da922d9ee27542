pub mod bar;
pub mod config;
pub mod indicator;
pub mod signal;
pub mod symbol;
