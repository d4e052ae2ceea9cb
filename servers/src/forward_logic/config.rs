use anyhow::{Result, bail};
use clap::Parser;
use serde::{Deserialize, Serialize};
use std::fs;
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use lib_forward::core::framer::{DEFAULT_MAX_MESSAGE_SIZE, DEFAULT_MESSAGE_SIZE};
use lib_forward::core::ring_buffer::CLIENT_BUFFER_SIZE;
use lib_forward::core::settings::{BrokerSettings, DEFAULT_CLIENT_PORT, DEFAULT_SENDER_PORT, Delimiter};
use lib_forward::loggers::MAX_VERBOSITY;

/// Config file read from the working directory when no path is given.
pub const DEFAULT_CONFIG_FILE: &str = "server_forward.conf";

#[derive(Parser, Deserialize, Serialize, Debug, Clone, Default, PartialEq)]
#[clap(name = "server_forward", about = "Forwards JSON objects from senders to every connected client", version)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[clap(short = 's', long, env = "FORWARD_SENDER_PORT", value_parser = clap::value_parser!(u16).range(1..), help = "Port senders connect to [default: 5000].")]
    pub sender_port: Option<u16>,

    #[clap(short = 'c', long, env = "FORWARD_CLIENT_PORT", value_parser = clap::value_parser!(u16).range(1..), help = "Port clients connect to [default: 5001].")]
    pub client_port: Option<u16>,

    #[clap(long, env = "FORWARD_BIND_ADDRESS", help = "Address both listeners bind to [default: 0.0.0.0].")]
    pub bind_address: Option<IpAddr>,

    #[clap(long, env = "FORWARD_CLIENT_BUFFER_SIZE", help = "Output buffer per client in bytes; one byte is reserved [default: 16384].")]
    pub client_buffer_size: Option<usize>,

    #[clap(long, env = "FORWARD_SENDER_BUFFER_INCREMENT", help = "Step in bytes by which a sender's input buffer grows [default: 512].")]
    pub sender_buffer_increment: Option<usize>,

    #[clap(long, env = "FORWARD_MAX_MESSAGE_SIZE", help = "Largest pending message in bytes before a sender is dropped [default: 16777216].")]
    pub max_message_size: Option<usize>,

    #[clap(long, env = "FORWARD_DELIMITER", help = "What follows each message sent to clients: newline or none [default: newline].")]
    pub delimiter: Option<Delimiter>,

    #[clap(short = 'v', long, env = "FORWARD_VERBOSE", num_args = 0..=1, default_missing_value = "1", value_parser = parse_verbosity, help = "Verbosity 0-5: 2 allocation, 3 input, 4 parser, 5 everything.")]
    pub verbose: Option<u8>,

    #[clap(long, env = "FORWARD_LOG_DIR", help = "Directory for daily rolling JSON log files.")]
    pub log_dir: Option<PathBuf>,

    #[clap(long, env = "FORWARD_CONFIG_PATH", help = "Path to the JSON configuration file.")]
    pub config_path: Option<PathBuf>,
}

/// Accepts any non-negative number and clamps it to the highest level.
fn parse_verbosity(s: &str) -> Result<u8, String> {
    s.trim()
        .parse::<u32>()
        .map(|v| v.min(u32::from(MAX_VERBOSITY)) as u8)
        .map_err(|_| format!("verbosity must be a number from 0 to {MAX_VERBOSITY}, got '{s}'"))
}

/// What happened to the config file while loading.
#[derive(Debug, Clone, PartialEq)]
pub enum FileStatus {
    /// Read and merged.
    Loaded(PathBuf),
    /// Not present; defaults and environment/CLI only.
    Missing(PathBuf),
    /// Present but unusable; ignored.
    Invalid(PathBuf, String),
}

impl FileStatus {
    /// Reports the outcome once logging is up.
    pub fn log(&self) {
        match self {
            FileStatus::Loaded(path) => info!("Loaded config file {}.", path.display()),
            FileStatus::Missing(path) => info!(
                "Config file not found at {}. Using defaults and environment/CLI variables.",
                path.display()
            ),
            FileStatus::Invalid(path, reason) => warn!(
                "Ignoring config file {}: {}. Falling back to other sources.",
                path.display(),
                reason
            ),
        }
    }
}

/// A merged configuration and where the file layer came from.
#[derive(Debug, Clone)]
pub struct LoadedConfig {
    pub config: Config,
    pub file: FileStatus,
}

impl Config {
    fn defaults() -> Config {
        Config {
            sender_port: Some(DEFAULT_SENDER_PORT),
            client_port: Some(DEFAULT_CLIENT_PORT),
            client_buffer_size: Some(CLIENT_BUFFER_SIZE),
            sender_buffer_increment: Some(DEFAULT_MESSAGE_SIZE),
            max_message_size: Some(DEFAULT_MAX_MESSAGE_SIZE),
            delimiter: Some(Delimiter::Newline),
            verbose: Some(0),
            ..Default::default()
        }
    }

    // Merge two Config structs, where 'other' overrides 'self' for Some values
    fn merge(self, other: Config) -> Config {
        Config {
            sender_port: other.sender_port.or(self.sender_port),
            client_port: other.client_port.or(self.client_port),
            bind_address: other.bind_address.or(self.bind_address),
            client_buffer_size: other.client_buffer_size.or(self.client_buffer_size),
            sender_buffer_increment: other.sender_buffer_increment.or(self.sender_buffer_increment),
            max_message_size: other.max_message_size.or(self.max_message_size),
            delimiter: other.delimiter.or(self.delimiter),
            verbose: other.verbose.or(self.verbose),
            log_dir: other.log_dir.or(self.log_dir),
            config_path: other.config_path.or(self.config_path),
        }
    }

    /// # Broker Settings
    ///
    /// Turns the merged configuration into engine settings. Unset values fall
    /// back to the engine defaults.
    pub fn broker_settings(&self) -> Result<BrokerSettings> {
        let base = BrokerSettings::default();
        let ip = self.bind_address.unwrap_or_else(|| base.sender_addr.ip());
        let sender_port = self.sender_port.unwrap_or(DEFAULT_SENDER_PORT);
        let client_port = self.client_port.unwrap_or(DEFAULT_CLIENT_PORT);
        if sender_port == 0 || client_port == 0 {
            bail!("ports must be in the range 1-65535");
        }

        Ok(BrokerSettings {
            sender_addr: SocketAddr::new(ip, sender_port),
            client_addr: SocketAddr::new(ip, client_port),
            client_buffer_size: self.client_buffer_size.unwrap_or(base.client_buffer_size),
            sender_buffer_increment: self.sender_buffer_increment.unwrap_or(base.sender_buffer_increment),
            max_message_size: self.max_message_size.unwrap_or(base.max_message_size),
            delimiter: self.delimiter.unwrap_or(base.delimiter),
            ..base
        })
    }
}

fn read_config_file(path: &Path) -> (FileStatus, Option<Config>) {
    let path_buf = path.to_path_buf();
    if !path.exists() {
        return (FileStatus::Missing(path_buf), None);
    }
    let raw = match fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(e) => return (FileStatus::Invalid(path_buf, e.to_string()), None),
    };
    match serde_json::from_str::<Config>(&raw) {
        Ok(file_config) => (FileStatus::Loaded(path_buf), Some(file_config)),
        Err(e) => (FileStatus::Invalid(path_buf, e.to_string()), None),
    }
}

/// # Load Config From
///
/// Layers the configuration: built-in defaults, then the JSON file (if
/// present and valid), then `cli`, which already carries environment values.
pub fn load_config_from(cli: Config) -> LoadedConfig {
    // 1. Load defaults
    let mut current_config = Config::defaults();

    // 2. Load from config file (server_forward.conf) if present.
    //    The CLI/env layer may point at a different file.
    let config_file_path = cli
        .config_path
        .clone()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE));

    let (file, file_config) = read_config_file(&config_file_path);
    if let Some(file_config) = file_config {
        current_config = current_config.merge(file_config);
    }

    // 3. Override with environment variables and CLI arguments
    LoadedConfig {
        config: current_config.merge(cli),
        file,
    }
}

/// Parses the process arguments (and environment) and layers them over the
/// defaults and the config file.
pub fn load_config() -> LoadedConfig {
    load_config_from(Config::parse())
}
