//! # End-to-End Harness
//!
//! Starts a broker on ephemeral loopback ports and talks to it with plain
//! blocking `std::net` sockets, the way real senders and clients would.

use anyhow::{Context, Result, bail};
use std::io::{BufRead, BufReader, ErrorKind, Read, Write};
use std::net::TcpStream;
use std::thread;
use std::time::{Duration, Instant};

use lib_forward::core::{BrokerSettings, RunningBroker, StatsSnapshot, spawn};

/// How long any single wait in a test may take.
pub const WAIT: Duration = Duration::from_secs(5);

/// A broker on its own thread, stopped when the harness is dropped.
pub struct Harness {
    broker: Option<RunningBroker>,
}

impl Harness {
    /// Starts a broker with `settings`, forcing loopback ephemeral ports.
    pub fn start(settings: BrokerSettings) -> Result<Self> {
        let loopback = BrokerSettings::loopback();
        let settings = BrokerSettings {
            sender_addr: loopback.sender_addr,
            client_addr: loopback.client_addr,
            ..settings
        };
        let broker = spawn(settings).context("broker failed to start")?;
        Ok(Self { broker: Some(broker) })
    }

    /// Starts a broker with default settings.
    pub fn start_default() -> Result<Self> {
        Self::start(BrokerSettings::default())
    }

    fn running(&self) -> &RunningBroker {
        self.broker.as_ref().expect("broker already stopped")
    }

    /// Current broker counters.
    pub fn stats(&self) -> StatsSnapshot {
        self.running().handle().stats()
    }

    /// Connects a client and waits until the broker has accepted it.
    pub fn client(&self) -> Result<Client> {
        let before = self.stats().accepted;
        let stream = TcpStream::connect(self.running().handle().client_addr())?;
        stream.set_read_timeout(Some(WAIT))?;
        self.wait_for(|s| s.accepted > before)?;
        Ok(Client { reader: BufReader::new(stream) })
    }

    /// Connects a sender and waits until the broker has accepted it.
    pub fn sender(&self) -> Result<TcpStream> {
        let before = self.stats().accepted;
        let stream = TcpStream::connect(self.running().handle().sender_addr())?;
        self.wait_for(|s| s.accepted > before)?;
        Ok(stream)
    }

    /// Polls the counters until `cond` holds or [`WAIT`] runs out.
    pub fn wait_for(&self, cond: impl Fn(&StatsSnapshot) -> bool) -> Result<StatsSnapshot> {
        let deadline = Instant::now() + WAIT;
        loop {
            let stats = self.stats();
            if cond(&stats) {
                return Ok(stats);
            }
            if Instant::now() >= deadline {
                bail!("condition not reached, last stats: {stats:?}");
            }
            thread::sleep(Duration::from_millis(5));
        }
    }

    /// Stops the broker and joins its thread.
    pub fn stop(mut self) -> Result<()> {
        if let Some(broker) = self.broker.take() {
            broker.stop()?;
        }
        Ok(())
    }
}

impl Drop for Harness {
    fn drop(&mut self) {
        if let Some(broker) = self.broker.take() {
            let _ = broker.stop();
        }
    }
}

/// A connected client with a buffered reader.
pub struct Client {
    reader: BufReader<TcpStream>,
}

impl Client {
    /// Reads one newline-terminated message, delimiter included.
    pub fn read_line(&mut self) -> Result<String> {
        let mut line = String::new();
        let n = self.reader.read_line(&mut line)?;
        if n == 0 {
            bail!("connection closed before a full line arrived");
        }
        Ok(line)
    }

    /// Reads exactly `n` bytes.
    pub fn read_exact(&mut self, n: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; n];
        self.reader.read_exact(&mut buf)?;
        Ok(buf)
    }

    /// Gives up the buffered reader; anything already buffered is lost.
    pub fn into_stream(self) -> TcpStream {
        self.reader.into_inner()
    }

    /// Writes raw bytes towards the broker (which ignores them).
    pub fn write_all(&mut self, bytes: &[u8]) -> Result<()> {
        self.reader.get_mut().write_all(bytes)?;
        Ok(())
    }

    /// `true` once the broker has closed the connection. Buffered data is
    /// read and discarded on the way.
    pub fn is_closed_by_peer(&mut self) -> Result<bool> {
        let mut sink = [0u8; 4096];
        loop {
            match self.reader.read(&mut sink) {
                Ok(0) => return Ok(true),
                Ok(_) => continue,
                Err(e) if e.kind() == ErrorKind::ConnectionReset => return Ok(true),
                Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => return Ok(false),
                Err(e) => return Err(e.into()),
            }
        }
    }
}
