pub mod config;
pub mod signals;
