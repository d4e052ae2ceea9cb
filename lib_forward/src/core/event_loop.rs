//! # Event Loop
//!
//! The single-threaded scheduler that drives the whole broker. It owns the
//! poller, the peer pool and the settings; nothing in here is shared except the
//! statistics counters and the shutdown flag behind a [`BrokerHandle`].
//!
//! ## One Iteration:
//!
//! 1. Recompute client interest (write only while a ring buffer holds data).
//! 2. Poll. Block indefinitely when idle, return at once when latched readiness
//!    is still waiting to be worked off.
//! 3. Accept at most one sender and one client.
//! 4. Mark every peer that reported an error or hangup.
//! 5. Drain each writable client once.
//! 6. Read each readable peer once: senders feed the framer and every complete
//!    message is broadcast; clients have their input read and thrown away.
//! 7. Reap dead peers.
//!
//! `mio` is edge-triggered. Readiness is latched in the pool's registration
//! records and only cleared when an operation hits `WouldBlock`, which keeps the
//! level-triggered contract of the steps above.

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, unused_qualifications)]

use std::io::{self, ErrorKind, Read};
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use mio::{Events, Poll, Token, Waker};
use thiserror::Error;
use tracing::{debug, error, info, trace, warn};

use crate::core::dispatcher;
use crate::core::framer::{Fill, Framer};
use crate::core::pool::{
    CLIENT_LISTENER, FIRST_PEER, Payload, PeerId, PeerLimits, PeerPool, PoolError, Role, SENDER_LISTENER,
};
use crate::core::settings::{BrokerSettings, SettingsError};
use crate::core::stats::{BrokerStats, StatsSnapshot};
use crate::utils::net::bind_listener;

const WAKE_TOKEN: Token = Token(usize::MAX);

/// Size of the scratch buffer client input is read into and dropped.
const DISCARD_BUFFER_SIZE: usize = 512;

/// Fatal broker errors. Everything per-connection is handled inside the loop.
#[derive(Debug, Error)]
pub enum BrokerError {
    /// Settings failed validation.
    #[error("invalid settings: {0}")]
    Settings(#[from] SettingsError),

    /// The poller or its waker could not be created.
    #[error("failed to set up poller: {0}")]
    Poll(#[source] io::Error),

    /// A listener could not be bound.
    #[error("failed to bind {role} listener on {addr}: {source}")]
    Bind {
        /// Which listener.
        role: Role,
        /// Requested address.
        addr: SocketAddr,
        /// Underlying error.
        #[source]
        source: io::Error,
    },

    /// The peer pool could not be set up.
    #[error("failed to set up peer pool: {0}")]
    Pool(#[from] PoolError),

    /// The engine thread could not be started.
    #[error("failed to spawn broker thread: {0}")]
    Spawn(#[source] io::Error),

    /// The shutdown request could not wake the poller.
    #[error("failed to wake broker: {0}")]
    Wake(#[source] io::Error),

    /// The engine thread panicked.
    #[error("broker thread panicked")]
    Panicked,
}

/// Whether the loop keeps going after an iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    /// Run another iteration.
    Continue,
    /// Shutdown was requested.
    Stop,
}

/// # Broker Handle
///
/// Cheap, cloneable, thread-safe view of a running broker.
#[derive(Debug, Clone)]
pub struct BrokerHandle {
    waker: Arc<Waker>,
    shutdown: Arc<AtomicBool>,
    stats: Arc<BrokerStats>,
    sender_addr: SocketAddr,
    client_addr: SocketAddr,
}

impl BrokerHandle {
    /// Asks the loop to stop after the current iteration.
    pub fn shutdown(&self) -> io::Result<()> {
        self.shutdown.store(true, Ordering::Release);
        self.waker.wake()
    }

    /// Current counters.
    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Bound address of the sender listener.
    pub fn sender_addr(&self) -> SocketAddr {
        self.sender_addr
    }

    /// Bound address of the client listener.
    pub fn client_addr(&self) -> SocketAddr {
        self.client_addr
    }
}

/// # Broker
pub struct Broker {
    poll: Poll,
    events: Events,
    pool: PeerPool,
    settings: BrokerSettings,
    handle: BrokerHandle,
    discard: Box<[u8]>,
}

impl std::fmt::Debug for Broker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Broker")
            .field("pool", &self.pool)
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl Broker {
    /// # Bind
    ///
    /// Validates the settings, binds both listeners and prepares the poller.
    /// Nothing is accepted until [`run`](Self::run) is called.
    pub fn bind(settings: BrokerSettings) -> Result<Self, BrokerError> {
        settings.validate()?;

        let poll = Poll::new().map_err(BrokerError::Poll)?;
        let sender_listener = bind_listener(settings.sender_addr, settings.backlog).map_err(|source| {
            BrokerError::Bind { role: Role::Sender, addr: settings.sender_addr, source }
        })?;
        let client_listener = bind_listener(settings.client_addr, settings.backlog).map_err(|source| {
            BrokerError::Bind { role: Role::Client, addr: settings.client_addr, source }
        })?;

        let waker = Arc::new(Waker::new(poll.registry(), WAKE_TOKEN).map_err(BrokerError::Poll)?);
        let registry = poll.registry().try_clone().map_err(BrokerError::Poll)?;
        let stats = Arc::new(BrokerStats::default());
        let pool = PeerPool::new(
            registry,
            sender_listener,
            client_listener,
            PeerLimits::from(&settings),
            Arc::clone(&stats),
        )?;

        let handle = BrokerHandle {
            waker,
            shutdown: Arc::new(AtomicBool::new(false)),
            stats,
            sender_addr: pool.local_addr(SENDER_LISTENER).unwrap_or(settings.sender_addr),
            client_addr: pool.local_addr(CLIENT_LISTENER).unwrap_or(settings.client_addr),
        };

        Ok(Self {
            poll,
            events: Events::with_capacity(settings.events_capacity),
            pool,
            settings,
            handle,
            discard: vec![0u8; DISCARD_BUFFER_SIZE].into_boxed_slice(),
        })
    }

    /// A handle for stopping and observing this broker from other threads.
    pub fn handle(&self) -> BrokerHandle {
        self.handle.clone()
    }

    /// # Run
    ///
    /// Iterates until shutdown is requested through a [`BrokerHandle`]. All
    /// sockets are closed when the broker is dropped.
    pub fn run(&mut self) {
        info!(
            sender = %self.handle.sender_addr,
            client = %self.handle.client_addr,
            delimiter = %self.settings.delimiter,
            "broker listening"
        );
        while self.turn() == Flow::Continue {}
        let stats = self.handle.stats();
        info!(
            messages = stats.messages,
            accepted = stats.accepted,
            evictions = stats.evictions,
            "broker stopped"
        );
    }

    /// # Turn
    ///
    /// Runs exactly one iteration of the loop.
    pub fn turn(&mut self) -> Flow {
        // --- Phase 1: interest ---
        self.pool.refresh_interest();

        // --- Phase 2: poll ---
        let timeout = self.pool.has_pending_work().then_some(Duration::ZERO);
        if let Err(e) = self.poll.poll(&mut self.events, timeout) {
            if e.kind() != ErrorKind::Interrupted {
                error!(error = %e, "poll failed");
                thread::sleep(self.settings.poll_retry_delay());
            }
            return Flow::Continue;
        }
        for event in self.events.iter() {
            if event.token() != WAKE_TOKEN {
                self.pool.latch(event);
            }
        }
        if self.handle.shutdown.load(Ordering::Acquire) {
            return Flow::Stop;
        }

        // --- Phase 3: accept ---
        self.accept_pending(SENDER_LISTENER);
        self.accept_pending(CLIENT_LISTENER);

        // --- Phase 4: errors and hangups ---
        for index in FIRST_PEER..self.pool.len() {
            let id = PeerId::new(index);
            if self.pool.registration(id).is_some_and(|r| r.ready.hangup) {
                self.pool.mark_for_hangup(id);
            }
        }

        // --- Phase 5: writes ---
        for index in FIRST_PEER..self.pool.len() {
            self.flush_client(PeerId::new(index));
        }

        // --- Phase 6: reads ---
        for index in FIRST_PEER..self.pool.len() {
            let id = PeerId::new(index);
            if !self.pool.registration(id).is_some_and(|r| r.ready.readable) {
                continue;
            }
            match self.pool.peer(id).filter(|p| !p.is_dead()).map(|p| p.role()) {
                Some(Role::Sender) => self.receive(id),
                Some(Role::Client) => self.discard_input(id),
                _ => {}
            }
        }

        // --- Phase 7: reap ---
        let reaped = self.pool.reap();
        if reaped > 0 {
            debug!(reaped, live = self.pool.len() - FIRST_PEER, "dead peers reaped");
        }
        Flow::Continue
    }

    fn clear_readable(&mut self, id: PeerId) {
        if let Some(reg) = self.pool.registration_mut(id) {
            reg.ready.readable = false;
        }
    }

    fn accept_pending(&mut self, listener: PeerId) {
        if !self.pool.registration(listener).is_some_and(|r| r.ready.readable) {
            return;
        }
        match self.pool.accept(listener) {
            Ok(id) => {
                if let Some(peer) = self.pool.peer(id) {
                    info!(peer = %id, addr = %peer.addr(), role = %peer.role(), "connection accepted");
                }
            }
            Err(e) if e.is_would_block() => self.clear_readable(listener),
            Err(PoolError::Accept(e))
                if matches!(
                    e.kind(),
                    ErrorKind::Interrupted | ErrorKind::ConnectionAborted | ErrorKind::ConnectionReset
                ) =>
            {
                debug!(peer = %listener, error = %e, "transient accept failure");
            }
            Err(e @ PoolError::Accept(_)) => {
                error!(peer = %listener, error = %e, "accept failed");
                self.clear_readable(listener);
            }
            Err(e) => warn!(peer = %listener, error = %e, "connection dropped during setup"),
        }
    }

    fn flush_client(&mut self, id: PeerId) {
        let wants_write = self
            .pool
            .registration(id)
            .is_some_and(|r| r.ready.writable && r.interest.is_writable());
        if !wants_write {
            return;
        }
        let Some((stream, Payload::Client(ring))) = self.pool.peer_mut(id).and_then(|p| p.io_mut()) else {
            return;
        };
        let outcome = ring.drain_to(stream).map(|n| (n, ring.len()));
        match outcome {
            Ok((written, left)) => trace!(peer = %id, written, left, "client flushed"),
            Err(e) if e.kind() == ErrorKind::WouldBlock => {
                if let Some(reg) = self.pool.registration_mut(id) {
                    reg.ready.writable = false;
                }
            }
            Err(e) if e.kind() == ErrorKind::Interrupted => {}
            Err(e) => {
                debug!(peer = %id, error = %e, "client write failed");
                self.pool.mark_for_hangup(id);
            }
        }
    }

    fn receive(&mut self, id: PeerId) {
        let Some((stream, Payload::Sender(framer))) = self.pool.peer_mut(id).and_then(|p| p.io_mut()) else {
            return;
        };
        match framer.fill_from(stream) {
            Ok(Fill::Data(n)) => {
                trace!(peer = %id, len = n, "sender input");
                self.pool.stats().record_bytes_in(n);
            }
            Ok(Fill::WouldBlock) => {
                self.clear_readable(id);
                return;
            }
            Ok(Fill::Closed) => {
                debug!(peer = %id, "sender closed its stream");
                self.pool.mark_for_hangup(id);
                return;
            }
            Err(e) => {
                warn!(peer = %id, error = %e, "dropping sender");
                self.pool.mark_for_hangup(id);
                return;
            }
        }

        while let Some(message) = self
            .pool
            .peer_mut(id)
            .and_then(|p| p.framer_mut())
            .and_then(Framer::next_message)
        {
            dispatcher::broadcast(&mut self.pool, &message, self.settings.delimiter);
        }
    }

    fn discard_input(&mut self, id: PeerId) {
        let Some((stream, _)) = self.pool.peer_mut(id).and_then(|p| p.io_mut()) else {
            return;
        };
        match stream.read(&mut self.discard) {
            Ok(0) => {
                debug!(peer = %id, "client closed its stream");
                self.pool.mark_for_hangup(id);
            }
            Ok(n) => trace!(peer = %id, len = n, "client input discarded"),
            Err(e) if e.kind() == ErrorKind::WouldBlock => self.clear_readable(id),
            Err(e) if e.kind() == ErrorKind::Interrupted => {}
            Err(e) => {
                debug!(peer = %id, error = %e, "client read failed");
                self.pool.mark_for_hangup(id);
            }
        }
    }
}

/// A broker running on its own thread.
#[derive(Debug)]
pub struct RunningBroker {
    handle: BrokerHandle,
    thread: Option<JoinHandle<()>>,
}

impl RunningBroker {
    /// Handle of the running broker.
    pub fn handle(&self) -> &BrokerHandle {
        &self.handle
    }

    /// Requests shutdown and waits for the engine thread to finish.
    pub fn stop(mut self) -> Result<(), BrokerError> {
        self.handle.shutdown().map_err(BrokerError::Wake)?;
        match self.thread.take() {
            Some(thread) => thread.join().map_err(|_| BrokerError::Panicked),
            None => Ok(()),
        }
    }
}

impl Drop for RunningBroker {
    fn drop(&mut self) {
        if self.thread.is_some() {
            let _ = self.handle.shutdown();
        }
    }
}

/// # Spawn
///
/// Binds a broker on the calling thread, so bind errors surface here, then runs
/// it on a dedicated thread.
pub fn spawn(settings: BrokerSettings) -> Result<RunningBroker, BrokerError> {
    let mut broker = Broker::bind(settings)?;
    let handle = broker.handle();
    let thread = thread::Builder::new()
        .name("forward-broker".to_string())
        .spawn(move || broker.run())
        .map_err(BrokerError::Spawn)?;
    Ok(RunningBroker { handle, thread: Some(thread) })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::net::TcpStream;
    use std::time::Instant;

    fn turn_until(broker: &mut Broker, mut done: impl FnMut(&Broker) -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !done(broker) {
            assert!(Instant::now() < deadline, "condition not reached");
            // Keeps the test from blocking forever when nothing is ready.
            broker.handle().waker.wake().unwrap();
            broker.turn();
        }
    }

    #[test]
    fn test_bind_rejects_invalid_settings() {
        let mut settings = BrokerSettings::loopback();
        settings.client_buffer_size = 0;
        assert!(matches!(Broker::bind(settings), Err(BrokerError::Settings(_))));
    }

    #[test]
    fn test_bind_reports_busy_port() {
        let first = Broker::bind(BrokerSettings::loopback()).unwrap();
        let mut settings = BrokerSettings::loopback();
        settings.client_addr = first.handle().sender_addr();
        let err = Broker::bind(settings).unwrap_err();
        assert!(matches!(err, BrokerError::Bind { role: Role::Client, .. }));
    }

    #[test]
    fn test_turn_accepts_frames_and_queues() {
        let mut broker = Broker::bind(BrokerSettings::loopback()).unwrap();
        let handle = broker.handle();

        let client = TcpStream::connect(handle.client_addr()).unwrap();
        turn_until(&mut broker, |b| b.handle.stats().clients == 1);

        let mut sender = TcpStream::connect(handle.sender_addr()).unwrap();
        turn_until(&mut broker, |b| b.handle.stats().senders == 1);

        sender.write_all(br#"{"a":1}{"b":2}"#).unwrap();
        turn_until(&mut broker, |b| b.handle.stats().messages == 2);
        drop(client);
    }

    #[test]
    fn test_shutdown_stops_the_loop() {
        let mut broker = Broker::bind(BrokerSettings::loopback()).unwrap();
        broker.handle().shutdown().unwrap();
        assert_eq!(broker.turn(), Flow::Stop);
    }

    #[test]
    fn test_spawned_broker_stops_on_request() {
        let running = spawn(BrokerSettings::loopback()).unwrap();
        assert_ne!(running.handle().client_addr().port(), 0);
        running.stop().unwrap();
    }
}
