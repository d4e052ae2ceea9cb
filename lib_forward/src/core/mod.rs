//! # Core Engine Module
//!
//! The runtime of the `forward` broker: JSON objects come in on sender
//! connections and go out, unmodified, to every connected client.
//!
//! ## Core Components:
//!
//! - **`pool`**: every live connection plus its readiness record, with
//!   two-phase (mark, then reap) removal.
//! - **`framer`**: per-sender incremental parser cutting the byte stream into
//!   top-level JSON objects.
//! - **`ring_buffer`**: per-client bounded output buffer with all-or-nothing
//!   admission.
//! - **`dispatcher`**: fans each framed message out to the clients' ring
//!   buffers and evicts the ones that cannot keep up.
//! - **`event_loop`**: the single-threaded readiness loop tying it together.
//!
//! Data flows socket -> `framer` -> `dispatcher` -> `ring_buffer` -> socket.

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, unused_qualifications)]

/// Fan-out of framed messages into client buffers.
pub mod dispatcher;
/// The readiness loop and its thread-safe handle.
pub mod event_loop;
/// Incremental JSON object framing.
pub mod framer;
/// Connection pool with deferred removal.
pub mod pool;
/// Bounded per-client output buffer.
pub mod ring_buffer;
/// Validated engine settings.
pub mod settings;
/// Shared counters.
pub mod stats;

// --- Public API Re-exports ---
pub use dispatcher::{Broadcast, broadcast};
pub use event_loop::{Broker, BrokerError, BrokerHandle, Flow, RunningBroker, spawn};
pub use framer::{Fill, Framer, FramerError};
pub use pool::{PeerId, PeerPool, PoolError, Role};
pub use ring_buffer::{Overflow, RingBuffer};
pub use settings::{BrokerSettings, Delimiter, SettingsError};
pub use stats::{BrokerStats, StatsSnapshot};
