//! # Broker Settings
//!
//! The validated knobs the engine runs with. The binary builds one of these
//! from its layered configuration; tests and embedders construct it directly.

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, unused_qualifications)]

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::framer::{DEFAULT_MAX_MESSAGE_SIZE, DEFAULT_MESSAGE_SIZE};
use crate::core::pool::PEER_POOL_INCREMENT;
use crate::core::ring_buffer::CLIENT_BUFFER_SIZE;

/// Default port senders connect to.
pub const DEFAULT_SENDER_PORT: u16 = 5000;
/// Default port clients connect to.
pub const DEFAULT_CLIENT_PORT: u16 = 5001;
/// Accept backlog of both listeners.
pub const LISTEN_BACKLOG: i32 = 10;

/// # Message Delimiter
///
/// What goes on the wire after every message delivered to a client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Delimiter {
    /// A single `\n` after each object (newline-delimited JSON).
    #[default]
    Newline,
    /// Objects are concatenated back to back.
    None,
}

impl Delimiter {
    /// The bytes appended after each message.
    pub fn as_bytes(self) -> &'static [u8] {
        match self {
            Delimiter::Newline => b"\n",
            Delimiter::None => b"",
        }
    }
}

impl fmt::Display for Delimiter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Delimiter::Newline => f.write_str("newline"),
            Delimiter::None => f.write_str("none"),
        }
    }
}

impl FromStr for Delimiter {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "newline" | "nl" | "lf" => Ok(Delimiter::Newline),
            "none" | "raw" => Ok(Delimiter::None),
            other => Err(format!("unknown delimiter '{other}', expected 'newline' or 'none'")),
        }
    }
}

/// Rejected settings.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SettingsError {
    /// A ring buffer needs one reserved slot plus at least one usable byte.
    #[error("client buffer size must be at least 2 bytes, got {0}")]
    ClientBufferTooSmall(usize),

    /// A growth step of zero would never make room.
    #[error("{0} must be greater than zero")]
    ZeroIncrement(&'static str),

    /// The message cap must allow at least one accumulator block.
    #[error("max message size {max} is smaller than the sender buffer increment {increment}")]
    MaxMessageTooSmall {
        /// Configured cap.
        max: usize,
        /// Configured growth step.
        increment: usize,
    },

    /// Both listeners on the same fixed port.
    #[error("sender and client listeners cannot share port {0}")]
    SamePort(u16),

    /// Non-positive listen backlog.
    #[error("listen backlog must be positive, got {0}")]
    InvalidBacklog(i32),
}

/// # Broker Settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct BrokerSettings {
    /// Where senders connect.
    pub sender_addr: SocketAddr,
    /// Where clients connect.
    pub client_addr: SocketAddr,
    /// Accept backlog for both listeners.
    pub backlog: i32,
    /// Capacity of each client's ring buffer (usable bytes are one less).
    pub client_buffer_size: usize,
    /// Step by which a sender accumulator grows.
    pub sender_buffer_increment: usize,
    /// Largest pending message a sender may build up before it is dropped.
    pub max_message_size: usize,
    /// Step by which the peer pool grows.
    pub pool_increment: usize,
    /// Bytes written after every delivered message.
    pub delimiter: Delimiter,
    /// Pause after a failed poll, in milliseconds.
    pub poll_retry_delay_ms: u64,
    /// Readiness events fetched per poll.
    pub events_capacity: usize,
}

impl Default for BrokerSettings {
    fn default() -> Self {
        let any = IpAddr::V4(Ipv4Addr::UNSPECIFIED);
        Self {
            sender_addr: SocketAddr::new(any, DEFAULT_SENDER_PORT),
            client_addr: SocketAddr::new(any, DEFAULT_CLIENT_PORT),
            backlog: LISTEN_BACKLOG,
            client_buffer_size: CLIENT_BUFFER_SIZE,
            sender_buffer_increment: DEFAULT_MESSAGE_SIZE,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            pool_increment: PEER_POOL_INCREMENT,
            delimiter: Delimiter::Newline,
            poll_retry_delay_ms: 1000,
            events_capacity: 1024,
        }
    }
}

impl BrokerSettings {
    /// Defaults, but both listeners on ephemeral loopback ports.
    pub fn loopback() -> Self {
        let lo = IpAddr::V4(Ipv4Addr::LOCALHOST);
        Self {
            sender_addr: SocketAddr::new(lo, 0),
            client_addr: SocketAddr::new(lo, 0),
            ..Self::default()
        }
    }

    /// Pause applied after a failed poll.
    pub fn poll_retry_delay(&self) -> Duration {
        Duration::from_millis(self.poll_retry_delay_ms)
    }

    /// # Validate
    ///
    /// Checks every invariant the engine relies on. Called by `Broker::bind`.
    pub fn validate(&self) -> Result<(), SettingsError> {
        if self.client_buffer_size < 2 {
            return Err(SettingsError::ClientBufferTooSmall(self.client_buffer_size));
        }
        if self.sender_buffer_increment == 0 {
            return Err(SettingsError::ZeroIncrement("sender buffer increment"));
        }
        if self.pool_increment == 0 {
            return Err(SettingsError::ZeroIncrement("peer pool increment"));
        }
        if self.events_capacity == 0 {
            return Err(SettingsError::ZeroIncrement("events capacity"));
        }
        if self.max_message_size < self.sender_buffer_increment {
            return Err(SettingsError::MaxMessageTooSmall {
                max: self.max_message_size,
                increment: self.sender_buffer_increment,
            });
        }
        if self.backlog <= 0 {
            return Err(SettingsError::InvalidBacklog(self.backlog));
        }
        let port = self.sender_addr.port();
        if port != 0 && port == self.client_addr.port() && self.sender_addr.ip() == self.client_addr.ip() {
            return Err(SettingsError::SamePort(port));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_historical_constants() {
        let s = BrokerSettings::default();
        assert_eq!(s.sender_addr.port(), 5000);
        assert_eq!(s.client_addr.port(), 5001);
        assert!(s.sender_addr.ip().is_unspecified());
        assert_eq!(s.backlog, 10);
        assert_eq!(s.client_buffer_size, 16384);
        assert_eq!(s.sender_buffer_increment, 512);
        assert_eq!(s.pool_increment, 1024);
        assert_eq!(s.delimiter, Delimiter::Newline);
        assert_eq!(s.validate(), Ok(()));
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut s = BrokerSettings::default();
        s.client_buffer_size = 1;
        assert_eq!(s.validate(), Err(SettingsError::ClientBufferTooSmall(1)));

        let mut s = BrokerSettings::default();
        s.sender_buffer_increment = 0;
        assert!(matches!(s.validate(), Err(SettingsError::ZeroIncrement(_))));

        let mut s = BrokerSettings::default();
        s.max_message_size = 100;
        assert!(matches!(s.validate(), Err(SettingsError::MaxMessageTooSmall { .. })));

        let mut s = BrokerSettings::default();
        s.client_addr = s.sender_addr;
        assert_eq!(s.validate(), Err(SettingsError::SamePort(5000)));
    }

    #[test]
    fn test_loopback_allows_two_ephemeral_ports() {
        assert_eq!(BrokerSettings::loopback().validate(), Ok(()));
    }

    #[test]
    fn test_delimiter_parsing() {
        assert_eq!("newline".parse::<Delimiter>(), Ok(Delimiter::Newline));
        assert_eq!("NONE".parse::<Delimiter>(), Ok(Delimiter::None));
        assert!("tab".parse::<Delimiter>().is_err());
        assert_eq!(Delimiter::Newline.as_bytes(), b"\n");
        assert!(Delimiter::None.as_bytes().is_empty());
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let s: BrokerSettings =
            serde_json::from_str(r#"{"clientBufferSize": 17, "delimiter": "none"}"#).unwrap();
        assert_eq!(s.client_buffer_size, 17);
        assert_eq!(s.delimiter, Delimiter::None);
        assert_eq!(s.sender_addr.port(), 5000);
    }
}
