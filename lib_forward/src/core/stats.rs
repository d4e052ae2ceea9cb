//! # Broker Statistics
//!
//! Lock-free counters shared between the engine thread and whoever holds a
//! `BrokerHandle`. The engine is the only writer; readers take a
//! [`StatsSnapshot`] at any time.
//!
//! All updates use `Ordering::Relaxed`: each counter is only ever read for its
//! own value, never to order other memory operations.

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, unused_qualifications)]

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use serde::Serialize;

use crate::core::pool::Role;

/// Live counters of one broker instance.
#[derive(Debug, Default)]
pub struct BrokerStats {
    senders: AtomicUsize,
    clients: AtomicUsize,
    accepted: AtomicU64,
    messages: AtomicU64,
    bytes_in: AtomicU64,
    evictions: AtomicU64,
}

/// Point-in-time copy of [`BrokerStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    /// Senders currently connected.
    pub senders: usize,
    /// Clients currently connected.
    pub clients: usize,
    /// Connections accepted since start.
    pub accepted: u64,
    /// Messages framed and broadcast since start.
    pub messages: u64,
    /// Raw bytes read from senders since start.
    pub bytes_in: u64,
    /// Clients disconnected because their buffer overflowed.
    pub evictions: u64,
}

impl BrokerStats {
    /// Reads every counter.
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            senders: self.senders.load(Ordering::Relaxed),
            clients: self.clients.load(Ordering::Relaxed),
            accepted: self.accepted.load(Ordering::Relaxed),
            messages: self.messages.load(Ordering::Relaxed),
            bytes_in: self.bytes_in.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
        }
    }

    fn live(&self, role: Role) -> Option<&AtomicUsize> {
        match role {
            Role::Sender => Some(&self.senders),
            Role::Client => Some(&self.clients),
            Role::Listener => None,
        }
    }

    pub(crate) fn peer_joined(&self, role: Role) {
        self.accepted.fetch_add(1, Ordering::Relaxed);
        if let Some(counter) = self.live(role) {
            counter.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub(crate) fn peer_left(&self, role: Role) {
        if let Some(counter) = self.live(role) {
            counter.fetch_sub(1, Ordering::Relaxed);
        }
    }

    pub(crate) fn record_message(&self) {
        self.messages.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_bytes_in(&self, n: usize) {
        self.bytes_in.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub(crate) fn record_eviction(&self) {
        self.evictions.fetch_add(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_live_counts_follow_role() {
        let stats = BrokerStats::default();
        stats.peer_joined(Role::Client);
        stats.peer_joined(Role::Client);
        stats.peer_joined(Role::Sender);
        stats.peer_left(Role::Client);
        stats.record_eviction();

        let snap = stats.snapshot();
        assert_eq!(snap.clients, 1);
        assert_eq!(snap.senders, 1);
        assert_eq!(snap.accepted, 3);
        assert_eq!(snap.evictions, 1);
    }

    #[test]
    fn test_snapshot_serializes_as_flat_json() {
        let stats = BrokerStats::default();
        stats.peer_joined(Role::Sender);
        stats.record_message();
        stats.record_bytes_in(7);

        let json = serde_json::to_value(stats.snapshot()).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "senders": 1,
                "clients": 0,
                "accepted": 1,
                "messages": 1,
                "bytes_in": 7,
                "evictions": 0,
            })
        );
    }
}
