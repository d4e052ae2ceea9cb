/// Global `tracing` subscriber installation and verbosity mapping.
pub mod subscriber;

pub use subscriber::{LogOptions, LoggerError, MAX_VERBOSITY, setup_logging, verbosity_directives};
