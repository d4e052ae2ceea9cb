//! # lib_forward
//!
//! Engine of the `forward` JSON fan-out broker, plus the logging setup shared
//! by its binaries. Modules are gated by folder-level features:
//!
//! - `core` (default): the broker engine.
//! - `loggers`: `tracing-subscriber` installation with console and rolling
//!   file output.

#[cfg(feature = "core")]
pub mod core;
#[cfg(feature = "core")]
pub mod utils;

#[cfg(feature = "loggers")]
pub mod loggers;

#[cfg(feature = "core")]
pub use crate::core::{Broker, BrokerHandle, BrokerSettings, Delimiter, RunningBroker, spawn};
