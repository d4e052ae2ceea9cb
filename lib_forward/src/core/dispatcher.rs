//! # Broadcast Dispatcher
//!
//! Fans one framed message out to every live client of the pool.
//!
//! ## Core Rules:
//!
//! - **Admission, not delivery**: the message (plus delimiter) is appended to each
//!   client's ring buffer. Sockets are written later, when the event loop sees
//!   them writable.
//! - **Evict the slow**: a client whose buffer cannot take the whole message is
//!   marked for hangup on the spot. It never receives a partial message and is
//!   never retried.
//! - **Clients only**: listeners and senders are skipped. Iteration follows pool
//!   index order; dead peers are skipped.

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, unused_qualifications)]

use tracing::{trace, warn};

use crate::core::pool::{FIRST_PEER, Peer, PeerId, PeerPool};
use crate::core::settings::Delimiter;

/// Outcome of one broadcast.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Broadcast {
    /// Clients that accepted the message into their buffer.
    pub delivered: usize,
    /// Clients disconnected because the message did not fit.
    pub evicted: usize,
}

/// # Broadcast
///
/// Appends `message` followed by `delimiter` to every live client's ring buffer
/// as one unit. Clients that overflow are marked for hangup.
pub fn broadcast(pool: &mut PeerPool, message: &[u8], delimiter: Delimiter) -> Broadcast {
    let mut report = Broadcast::default();
    let parts = [message, delimiter.as_bytes()];

    for index in FIRST_PEER..pool.len() {
        let id = PeerId::new(index);
        let Some(ring) = pool.peer_mut(id).and_then(Peer::ring_mut) else {
            continue;
        };
        match ring.append_all(&parts) {
            Ok(()) => report.delivered += 1,
            Err(overflow) => {
                if let Some(peer) = pool.peer(id) {
                    warn!(
                        peer = %id,
                        addr = %peer.addr(),
                        needed = overflow.needed,
                        free = overflow.free,
                        "client buffer overflow, disconnecting"
                    );
                }
                pool.mark_for_hangup(id);
                pool.stats().record_eviction();
                report.evicted += 1;
            }
        }
    }

    pool.stats().record_message();
    trace!(len = message.len(), delivered = report.delivered, evicted = report.evicted, "message broadcast");
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::pool::{CLIENT_LISTENER, PeerLimits, Role, SENDER_LISTENER};
    use crate::core::stats::BrokerStats;
    use crate::utils::net::bind_listener;
    use mio::Poll;
    use std::net::{Ipv4Addr, SocketAddr, TcpStream};
    use std::sync::Arc;

    fn pool_with_buffer(client_buffer_size: usize) -> (Poll, PeerPool) {
        let poll = Poll::new().unwrap();
        let lo = SocketAddr::from((Ipv4Addr::LOCALHOST, 0));
        let pool = PeerPool::new(
            poll.registry().try_clone().unwrap(),
            bind_listener(lo, 10).unwrap(),
            bind_listener(lo, 10).unwrap(),
            PeerLimits {
                pool_increment: 8,
                client_buffer_size,
                sender_buffer_increment: 16,
                max_message_size: 1024,
            },
            Arc::new(BrokerStats::default()),
        )
        .unwrap();
        (poll, pool)
    }

    fn join(pool: &mut PeerPool, listener: PeerId) -> (TcpStream, PeerId) {
        let stream = TcpStream::connect(pool.local_addr(listener).unwrap()).unwrap();
        for _ in 0..500 {
            match pool.accept(listener) {
                Ok(id) => return (stream, id),
                Err(e) if e.is_would_block() => std::thread::sleep(std::time::Duration::from_millis(5)),
                Err(e) => panic!("accept failed: {e}"),
            }
        }
        panic!("connection never became acceptable");
    }

    fn buffered(pool: &PeerPool, id: PeerId) -> usize {
        pool.peer(id).and_then(Peer::ring).map_or(0, |r| r.len())
    }

    #[test]
    fn test_every_client_gets_message_and_delimiter() {
        let (_poll, mut pool) = pool_with_buffer(64);
        let (_a, a) = join(&mut pool, CLIENT_LISTENER);
        let (_s, s) = join(&mut pool, SENDER_LISTENER);
        let (_b, b) = join(&mut pool, CLIENT_LISTENER);

        let report = broadcast(&mut pool, br#"{"a":1}"#, Delimiter::Newline);
        assert_eq!(report, Broadcast { delivered: 2, evicted: 0 });
        assert_eq!(buffered(&pool, a), 8);
        assert_eq!(buffered(&pool, b), 8);
        assert_eq!(pool.peer(s).unwrap().role(), Role::Sender);
        assert_eq!(pool.stats().snapshot().messages, 1);
    }

    #[test]
    fn test_overflowing_client_is_evicted_whole() {
        // 16 usable bytes per client.
        let (_poll, mut pool) = pool_with_buffer(17);
        let (_a, a) = join(&mut pool, CLIENT_LISTENER);

        // 15 + 1 fits exactly.
        let report = broadcast(&mut pool, br#"{"k":"0123456"}"#, Delimiter::Newline);
        assert_eq!(report.delivered, 1);

        // Nothing drained: the next message cannot fit.
        let report = broadcast(&mut pool, b"{}", Delimiter::Newline);
        assert_eq!(report, Broadcast { delivered: 0, evicted: 1 });
        assert!(pool.peer(a).unwrap().is_dead());
        assert_eq!(pool.stats().snapshot().evictions, 1);

        // Dead clients are skipped from now on.
        let report = broadcast(&mut pool, b"{}", Delimiter::Newline);
        assert_eq!(report, Broadcast::default());
    }

    #[test]
    fn test_message_larger_than_usable_capacity_evicts() {
        let (_poll, mut pool) = pool_with_buffer(17);
        let (_a, a) = join(&mut pool, CLIENT_LISTENER);
        let report = broadcast(&mut pool, br#"{"k":"01234567"}"#, Delimiter::Newline);
        assert_eq!(report.evicted, 1);
        assert_eq!(buffered(&pool, a), 0);
    }

    #[test]
    fn test_raw_delimiter_appends_nothing() {
        let (_poll, mut pool) = pool_with_buffer(64);
        let (_a, a) = join(&mut pool, CLIENT_LISTENER);
        broadcast(&mut pool, b"{}", Delimiter::None);
        assert_eq!(buffered(&pool, a), 2);
    }
}
