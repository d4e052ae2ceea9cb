//! # Peer Pool
//!
//! Owns every live connection of the broker together with one readiness
//! registration record per connection. The two collections are index-aligned:
//! `peers[i]` and `registrations[i]` always describe the same connection, and
//! `i` doubles as the `mio::Token` the connection is registered under.
//!
//! ## Core Layout:
//!
//! - **Index 0** is the sender listener and **index 1** the client listener. Both
//!   are permanent and are never marked dead or reaped.
//! - **Accepted peers** live from index 2 upwards, in no particular order.
//!
//! ## Two-Phase Removal:
//!
//! A failing peer is first *marked*: its socket is shut down, deregistered and
//! closed, and the slot stays where it is. Only [`PeerPool::reap`], which runs
//! after all readiness of an iteration has been processed, removes dead slots
//! via swap-with-last. A peer moved into a freed slot is re-registered under its
//! new index, so later readiness is never attributed to the wrong connection.
//!
//! The pool grows in fixed increments rather than doubling, and a failed growth
//! leaves existing peers untouched.

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, unused_qualifications)]

use std::collections::TryReserveError;
use std::fmt;
use std::io;
use std::net::{Shutdown, SocketAddr};
use std::sync::Arc;

use mio::event::{Event, Source};
use mio::net::{TcpListener, TcpStream};
use mio::{Interest, Registry, Token};
use thiserror::Error;
use tracing::{debug, error, warn};

use crate::core::framer::{Framer, FramerError};
use crate::core::ring_buffer::RingBuffer;
use crate::core::settings::BrokerSettings;
use crate::core::stats::BrokerStats;

/// Slots added every time the pool runs full.
pub const PEER_POOL_INCREMENT: usize = 1024;

/// Pool index of the sender listener.
pub const SENDER_LISTENER: PeerId = PeerId(0);
/// Pool index of the client listener.
pub const CLIENT_LISTENER: PeerId = PeerId(1);
/// First index that can hold an accepted peer.
pub const FIRST_PEER: usize = 2;

/// What a connection is for. Fixed for the peer's whole life.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    /// One of the two listening sockets.
    Listener,
    /// Produces JSON objects.
    Sender,
    /// Consumes the broadcast stream.
    Client,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Listener => f.write_str("listener"),
            Role::Sender => f.write_str("sender"),
            Role::Client => f.write_str("client"),
        }
    }
}

/// Index handle into the pool. Only valid until the next [`PeerPool::reap`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerId(usize);

impl PeerId {
    /// Wraps a raw pool index.
    pub const fn new(index: usize) -> Self {
        PeerId(index)
    }

    /// The raw pool index.
    pub const fn index(self) -> usize {
        self.0
    }

    /// The readiness token this index is registered under.
    pub const fn token(self) -> Token {
        Token(self.0)
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Failures of pool operations.
#[derive(Debug, Error)]
pub enum PoolError {
    /// The pool was full and could not be grown.
    #[error("failed to grow peer pool: {0}")]
    Grow(#[from] TryReserveError),

    /// The OS accept call failed. `WouldBlock` means nothing is pending.
    #[error("accept failed: {0}")]
    Accept(#[source] io::Error),

    /// The index does not refer to a listener.
    #[error("peer {0} is not a listener")]
    NotAListener(PeerId),

    /// The initial sender accumulator could not be allocated.
    #[error("failed to allocate sender buffer: {0}")]
    SenderBuffer(#[source] FramerError),

    /// The client ring buffer could not be allocated.
    #[error("failed to allocate client buffer: {0}")]
    ClientBuffer(#[source] TryReserveError),

    /// Readiness registration with the poller failed.
    #[error("failed to register socket: {0}")]
    Register(#[source] io::Error),
}

impl PoolError {
    /// `true` when an accept found no pending connection.
    pub fn is_would_block(&self) -> bool {
        matches!(self, PoolError::Accept(e) if e.kind() == io::ErrorKind::WouldBlock)
    }
}

/// Readiness reported by the poller and not yet consumed.
///
/// The poller is edge-triggered; these flags stay set until the matching
/// operation runs into `WouldBlock`, which gives level-triggered behaviour.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Readiness {
    /// Input (or end of stream) is waiting.
    pub readable: bool,
    /// The socket can take more output.
    pub writable: bool,
    /// Error or full hangup.
    pub hangup: bool,
}

impl Readiness {
    fn absorb(&mut self, event: &Event) {
        if event.is_readable() || event.is_read_closed() {
            self.readable = true;
        }
        if event.is_writable() {
            self.writable = true;
        }
        if event.is_error() || (event.is_read_closed() && event.is_write_closed()) {
            self.hangup = true;
        }
    }
}

/// Per-peer readiness record, index-aligned with the peers.
#[derive(Debug)]
pub struct Registration {
    token: Token,
    registered: Interest,
    /// Interest that currently gates processing. Recomputed every iteration.
    pub interest: Interest,
    /// Latched readiness.
    pub ready: Readiness,
}

impl Registration {
    fn new(token: Token, registered: Interest) -> Self {
        Self {
            token,
            registered,
            interest: registered,
            ready: Readiness::default(),
        }
    }

    /// Token the socket is registered under.
    pub fn token(&self) -> Token {
        self.token
    }

    /// `true` when latched readiness can be acted on without polling.
    pub fn is_actionable(&self) -> bool {
        self.ready.hangup
            || (self.ready.readable && self.interest.is_readable())
            || (self.ready.writable && self.interest.is_writable())
    }
}

enum Socket {
    Listener(TcpListener),
    Stream(TcpStream),
}

impl Socket {
    fn source(&mut self) -> &mut dyn Source {
        match self {
            Socket::Listener(l) => l,
            Socket::Stream(s) => s,
        }
    }
}

impl fmt::Debug for Socket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Socket::Listener(_) => f.write_str("Listener"),
            Socket::Stream(_) => f.write_str("Stream"),
        }
    }
}

/// Role-specific state of a peer.
#[derive(Debug)]
pub enum Payload {
    /// A listener, and the role of the peers it accepts.
    Listener {
        /// Role given to accepted connections.
        accepts: Role,
    },
    /// Input accumulator of a sender.
    Sender(Framer),
    /// Output buffer of a client.
    Client(RingBuffer),
}

/// # Peer
///
/// One connection. `socket` is `None` once the peer has been marked dead; the
/// socket is closed exactly once, when it is taken out.
#[derive(Debug)]
pub struct Peer {
    socket: Option<Socket>,
    addr: SocketAddr,
    payload: Payload,
}

impl Peer {
    /// Role of this peer.
    pub fn role(&self) -> Role {
        match self.payload {
            Payload::Listener { .. } => Role::Listener,
            Payload::Sender(_) => Role::Sender,
            Payload::Client(_) => Role::Client,
        }
    }

    /// Remote address, or the local address for listeners.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// `true` once marked for hangup.
    pub fn is_dead(&self) -> bool {
        self.socket.is_none()
    }

    /// The client's ring buffer, for live clients only.
    pub fn ring(&self) -> Option<&RingBuffer> {
        match (&self.socket, &self.payload) {
            (Some(_), Payload::Client(ring)) => Some(ring),
            _ => None,
        }
    }

    /// Mutable access to a live client's ring buffer.
    pub fn ring_mut(&mut self) -> Option<&mut RingBuffer> {
        match (&self.socket, &mut self.payload) {
            (Some(_), Payload::Client(ring)) => Some(ring),
            _ => None,
        }
    }

    /// The sender's framer, for live senders only.
    pub fn framer_mut(&mut self) -> Option<&mut Framer> {
        match (&self.socket, &mut self.payload) {
            (Some(_), Payload::Sender(framer)) => Some(framer),
            _ => None,
        }
    }

    /// Stream and payload of a live, accepted peer.
    pub fn io_mut(&mut self) -> Option<(&mut TcpStream, &mut Payload)> {
        match &mut self.socket {
            Some(Socket::Stream(stream)) => Some((stream, &mut self.payload)),
            _ => None,
        }
    }
}

/// Per-peer allocation limits taken from the settings.
#[derive(Debug, Clone, Copy)]
pub struct PeerLimits {
    /// Pool growth step.
    pub pool_increment: usize,
    /// Client ring buffer capacity.
    pub client_buffer_size: usize,
    /// Sender accumulator growth step.
    pub sender_buffer_increment: usize,
    /// Sender accumulator cap.
    pub max_message_size: usize,
}

impl From<&BrokerSettings> for PeerLimits {
    fn from(s: &BrokerSettings) -> Self {
        Self {
            pool_increment: s.pool_increment,
            client_buffer_size: s.client_buffer_size,
            sender_buffer_increment: s.sender_buffer_increment,
            max_message_size: s.max_message_size,
        }
    }
}

/// # Peer Pool
pub struct PeerPool {
    peers: Vec<Peer>,
    registrations: Vec<Registration>,
    registry: Registry,
    limits: PeerLimits,
    stats: Arc<BrokerStats>,
}

impl fmt::Debug for PeerPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeerPool")
            .field("len", &self.peers.len())
            .field("capacity", &self.peers.capacity())
            .finish()
    }
}

fn grow_if_full<T>(v: &mut Vec<T>, increment: usize) -> Result<bool, TryReserveError> {
    if v.len() < v.capacity() {
        return Ok(false);
    }
    v.try_reserve_exact(increment)?;
    Ok(true)
}

impl PeerPool {
    /// # New Pool
    ///
    /// Installs the two listeners at indexes 0 and 1 and registers them for
    /// readability.
    pub fn new(
        registry: Registry,
        sender_listener: TcpListener,
        client_listener: TcpListener,
        limits: PeerLimits,
        stats: Arc<BrokerStats>,
    ) -> Result<Self, PoolError> {
        let mut peers = Vec::new();
        peers.try_reserve_exact(limits.pool_increment.max(FIRST_PEER))?;
        let mut registrations = Vec::new();
        registrations.try_reserve_exact(limits.pool_increment.max(FIRST_PEER))?;

        for (mut listener, accepts) in [(sender_listener, Role::Sender), (client_listener, Role::Client)] {
            let token = Token(peers.len());
            registry
                .register(&mut listener, token, Interest::READABLE)
                .map_err(PoolError::Register)?;
            let addr = listener.local_addr().map_err(PoolError::Register)?;
            debug!(peer = token.0, %addr, %accepts, "listener registered");
            peers.push(Peer {
                socket: Some(Socket::Listener(listener)),
                addr,
                payload: Payload::Listener { accepts },
            });
            registrations.push(Registration::new(token, Interest::READABLE));
        }

        Ok(Self {
            peers,
            registrations,
            registry,
            limits,
            stats,
        })
    }

    /// Number of slots in use, dead peers included.
    pub fn len(&self) -> usize {
        self.peers.len()
    }

    /// `true` when only the listeners are present.
    pub fn is_empty(&self) -> bool {
        self.peers.len() <= FIRST_PEER
    }

    /// Allocated slots.
    pub fn capacity(&self) -> usize {
        self.peers.capacity()
    }

    /// Shared counters.
    pub fn stats(&self) -> &BrokerStats {
        &self.stats
    }

    /// The peer at `id`.
    pub fn peer(&self, id: PeerId) -> Option<&Peer> {
        self.peers.get(id.0)
    }

    /// Mutable access to the peer at `id`.
    pub fn peer_mut(&mut self, id: PeerId) -> Option<&mut Peer> {
        self.peers.get_mut(id.0)
    }

    /// The registration record at `id`.
    pub fn registration(&self, id: PeerId) -> Option<&Registration> {
        self.registrations.get(id.0)
    }

    /// Mutable access to the registration record at `id`.
    pub fn registration_mut(&mut self, id: PeerId) -> Option<&mut Registration> {
        self.registrations.get_mut(id.0)
    }

    /// Bound address of a listener.
    pub fn local_addr(&self, listener: PeerId) -> Option<SocketAddr> {
        self.peer(listener)
            .filter(|p| p.role() == Role::Listener)
            .map(Peer::addr)
    }

    /// Latches a poller event into the record its token points at.
    ///
    /// Listeners only ever latch readability; they are never hung up.
    pub fn latch(&mut self, event: &Event) {
        let index = event.token().0;
        if let Some(reg) = self.registrations.get_mut(index) {
            reg.ready.absorb(event);
            if index < FIRST_PEER {
                reg.ready = Readiness { readable: reg.ready.readable, ..Readiness::default() };
            }
        }
    }

    /// # Refresh Interest
    ///
    /// Every live client wants to read; it wants to write only while its ring
    /// buffer holds data.
    pub fn refresh_interest(&mut self) {
        for (peer, reg) in self.peers.iter().zip(self.registrations.iter_mut()) {
            if let Some(ring) = peer.ring() {
                reg.interest = if ring.is_empty() {
                    Interest::READABLE
                } else {
                    Interest::READABLE | Interest::WRITABLE
                };
            }
        }
    }

    /// `true` when some live peer has latched readiness worth acting on, so the
    /// next poll must not block.
    pub fn has_pending_work(&self) -> bool {
        self.peers
            .iter()
            .zip(&self.registrations)
            .any(|(peer, reg)| !peer.is_dead() && reg.is_actionable())
    }

    /// # Accept
    ///
    /// Accepts one pending connection on `listener` and installs it with the
    /// role that listener hands out.
    ///
    /// # Errors
    /// - [`PoolError::Grow`]: the pool was full and could not grow. Nothing was
    ///   accepted.
    /// - [`PoolError::Accept`]: the OS accept failed (`WouldBlock` when nothing
    ///   is pending). No slot was used.
    /// - [`PoolError::SenderBuffer`], [`PoolError::ClientBuffer`],
    ///   [`PoolError::Register`]: the connection was accepted but could not be
    ///   set up; it has already been shut down and closed.
    pub fn accept(&mut self, listener: PeerId) -> Result<PeerId, PoolError> {
        let accepts = match self.peers.get(listener.0).map(|p| &p.payload) {
            Some(Payload::Listener { accepts }) => *accepts,
            _ => return Err(PoolError::NotAListener(listener)),
        };

        let grown = grow_if_full(&mut self.peers, self.limits.pool_increment)?;
        let grown = grow_if_full(&mut self.registrations, self.limits.pool_increment)? || grown;
        if grown {
            debug!(capacity = self.peers.capacity(), "peer pool grown");
        }

        let (mut stream, addr) = match &self.peers[listener.0].socket {
            Some(Socket::Listener(l)) => l.accept().map_err(PoolError::Accept)?,
            _ => return Err(PoolError::NotAListener(listener)),
        };

        let payload = match accepts {
            Role::Sender => Framer::try_new(self.limits.sender_buffer_increment, self.limits.max_message_size)
                .map(Payload::Sender)
                .map_err(PoolError::SenderBuffer),
            Role::Client => RingBuffer::try_with_capacity(self.limits.client_buffer_size)
                .map(Payload::Client)
                .map_err(PoolError::ClientBuffer),
            Role::Listener => Err(PoolError::NotAListener(listener)),
        };
        let payload = match payload {
            Ok(payload) => payload,
            Err(e) => {
                let _ = stream.shutdown(Shutdown::Both);
                return Err(e);
            }
        };
        debug!(%addr, role = %accepts, "peer buffer allocated");

        let id = PeerId(self.peers.len());
        let interest = match accepts {
            Role::Client => Interest::READABLE | Interest::WRITABLE,
            _ => Interest::READABLE,
        };
        if let Err(e) = self.registry.register(&mut stream, id.token(), interest) {
            let _ = stream.shutdown(Shutdown::Both);
            return Err(PoolError::Register(e));
        }
        if let Err(e) = stream.set_nodelay(true) {
            debug!(%addr, error = %e, "TCP_NODELAY not set");
        }

        self.peers.push(Peer {
            socket: Some(Socket::Stream(stream)),
            addr,
            payload,
        });
        self.registrations.push(Registration::new(id.token(), interest));
        self.stats.peer_joined(accepts);
        debug!(peer = %id, %addr, role = %accepts, "peer accepted");
        Ok(id)
    }

    /// # Mark for Hangup
    ///
    /// Shuts down, deregisters and closes the peer's socket and leaves the dead
    /// slot in place for [`reap`](Self::reap). Returns `false` for listeners,
    /// unknown indexes, and peers that are already dead.
    pub fn mark_for_hangup(&mut self, id: PeerId) -> bool {
        if id.0 < FIRST_PEER {
            warn!(peer = %id, "refusing to hang up a listener");
            return false;
        }
        let Some(peer) = self.peers.get_mut(id.0) else {
            return false;
        };
        let Some(mut socket) = peer.socket.take() else {
            return false;
        };
        if let Err(e) = self.registry.deregister(socket.source()) {
            debug!(peer = %id, error = %e, "deregister failed");
        }
        if let Socket::Stream(stream) = &socket {
            let _ = stream.shutdown(Shutdown::Both);
        }
        drop(socket);

        self.registrations[id.0].ready = Readiness::default();
        self.stats.peer_left(peer.role());
        debug!(peer = %id, addr = %peer.addr, role = %peer.role(), "peer marked for hangup");
        true
    }

    /// # Reap
    ///
    /// Removes every dead peer by swapping the last slot into its place,
    /// walking from the end so each moved peer has already been looked at.
    /// Returns how many peers were removed.
    pub fn reap(&mut self) -> usize {
        let mut removed = 0;
        let mut i = self.peers.len();
        while i > FIRST_PEER {
            i -= 1;
            if !self.peers[i].is_dead() {
                continue;
            }
            let gone = self.peers.swap_remove(i);
            self.registrations.swap_remove(i);
            removed += 1;
            debug!(peer = i, addr = %gone.addr, role = %gone.role(), "peer reaped");
            if i < self.peers.len() {
                self.retoken(PeerId(i));
            }
        }
        removed
    }

    fn retoken(&mut self, id: PeerId) {
        let reg = &mut self.registrations[id.0];
        reg.token = id.token();
        let registered = reg.registered;
        let Some(socket) = self.peers[id.0].socket.as_mut() else {
            return;
        };
        if let Err(e) = self.registry.reregister(socket.source(), id.token(), registered) {
            error!(peer = %id, error = %e, "re-registration after reap failed");
            self.mark_for_hangup(id);
        }
    }
}
