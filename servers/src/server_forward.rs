//! # Forward Server
//!
//! Accepts JSON objects from senders on one port and relays every complete
//! object, unmodified, to all clients connected on a second port.
//!
//! ## Startup Phases:
//!
//! 1. **Configuration**: `.env`, defaults, JSON config file, environment and
//!    CLI arguments, in increasing priority.
//! 2. **Logging**: `tracing` console output plus an optional rolling JSON file.
//! 3. **Binding**: both listeners are bound before anything else runs; a
//!    failure here is fatal and exits nonzero.
//! 4. **Signals**: Ctrl+C / SIGTERM request a clean stop.
//! 5. **Serving**: the single-threaded broker loop runs on the main thread.

use anyhow::{Context, Result};
use tracing::{info, warn};

mod forward_logic;
use forward_logic::{config, signals};

use lib_forward::core::Broker;
use lib_forward::loggers::{LogOptions, setup_logging};

fn main() -> Result<()> {
    // --- Phase 1: configuration ---
    dotenvy::dotenv().ok();
    let loaded = config::load_config();
    let config = loaded.config;

    // --- Phase 2: logging ---
    // The guard flushes the file appender on exit.
    let _log_guard = setup_logging(&LogOptions {
        verbosity: config.verbose.unwrap_or(0),
        log_dir: config.log_dir.clone(),
        ..LogOptions::default()
    })
    .context("failed to initialise logging")?;
    loaded.file.log();

    // --- Phase 3: binding ---
    let settings = config.broker_settings()?;
    let mut broker = Broker::bind(settings).context("failed to start broker")?;

    // --- Phase 4: signals ---
    let _signals = signals::spawn_signal_listener(broker.handle())?;

    // --- Phase 5: serving ---
    broker.run();

    match serde_json::to_string(&broker.handle().stats()) {
        Ok(stats) => info!(%stats, "Final broker counters."),
        Err(e) => warn!(error = %e, "failed to serialize broker counters"),
    }
    info!("Shutdown complete.");
    Ok(())
}
