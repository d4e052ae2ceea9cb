//! # Incremental JSON Object Framer
//!
//! Senders write a raw stream of back-to-back JSON objects with no length
//! prefix and no delimiter. The framer accumulates those bytes and cuts the
//! stream at the end of every balanced top-level object.
//!
//! ## Core Scanning Rules:
//!
//! - `{` raises the depth and `}` lowers it; a message is complete the moment a
//!   `}` takes the depth from 1 back to 0.
//! - Outside a string, `"` opens one. Inside, `\` escapes exactly the next byte
//!   and an unescaped `"` closes it. Braces inside strings are not counted.
//! - A stray `}` before any `{` drives the depth negative. That is not a
//!   completion; scanning simply continues.
//! - ASCII whitespace sitting at the start of the accumulator, before a new scan
//!   has consumed anything, is discarded.
//!
//! The scan position and its state survive between reads, so the bytes of a
//! partial message are only ever looked at once. Results do not depend on how
//! the stream was chunked.
//!
//! This is deliberately not a JSON validator: only brace balance and string
//! boundaries are tracked.

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, unused_qualifications)]

use std::collections::TryReserveError;
use std::io::{self, ErrorKind, Read};

use thiserror::Error;
use tracing::trace;

/// Default accumulator growth step, in bytes.
pub const DEFAULT_MESSAGE_SIZE: usize = 512;

/// Default upper bound for a single pending message, in bytes.
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

/// Errors raised while accumulating sender input.
#[derive(Debug, Error)]
pub enum FramerError {
    /// The allocator refused to grow the accumulator.
    #[error("failed to grow sender accumulator: {0}")]
    Grow(#[from] TryReserveError),

    /// A single message grew beyond the configured limit.
    #[error("pending message exceeds {limit} bytes")]
    Oversized {
        /// The configured limit.
        limit: usize,
    },

    /// The underlying read failed.
    #[error("read failed: {0}")]
    Io(#[from] io::Error),
}

/// Outcome of one read from the sender socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fill {
    /// `n` fresh bytes were appended to the accumulator.
    Data(usize),
    /// The peer closed its side of the stream.
    Closed,
    /// Nothing to read right now.
    WouldBlock,
}

#[derive(Debug, Clone, Copy, Default)]
struct ScanState {
    pos: usize,
    depth: i64,
    in_string: bool,
    escaped: bool,
}

/// # Framer
///
/// Growable accumulator plus resumable scan state for one sender.
///
/// `buf.len()` is the allocated size of the accumulator; `len` counts the bytes
/// actually received and not yet handed out as messages.
#[derive(Debug)]
pub struct Framer {
    buf: Vec<u8>,
    len: usize,
    increment: usize,
    max_len: usize,
    scan: ScanState,
}

impl Framer {
    /// Creates a framer with one `increment`-sized block already allocated.
    ///
    /// `increment` must be non-zero. Growth stops at `max_len` bytes.
    pub fn try_new(increment: usize, max_len: usize) -> Result<Self, FramerError> {
        let mut framer = Self {
            buf: Vec::new(),
            len: 0,
            increment: increment.max(1),
            max_len: max_len.max(increment.max(1)),
            scan: ScanState::default(),
        };
        framer.grow()?;
        Ok(framer)
    }

    /// Bytes buffered and not yet emitted.
    pub fn pending(&self) -> &[u8] {
        &self.buf[..self.len]
    }

    /// Allocated size of the accumulator.
    pub fn allocated(&self) -> usize {
        self.buf.len()
    }

    fn grow(&mut self) -> Result<(), FramerError> {
        let target = self.buf.len() + self.increment;
        if target > self.max_len {
            return Err(FramerError::Oversized { limit: self.max_len });
        }
        self.buf.try_reserve_exact(self.increment)?;
        self.buf.resize(target, 0);
        trace!(allocated = target, "accumulator grown");
        Ok(())
    }

    /// # Read From a Socket
    ///
    /// Performs a single read into the spare part of the accumulator, growing it
    /// first when it is full. `Interrupted` reads are retried.
    ///
    /// # Errors
    /// Growth failures and read errors other than `WouldBlock`. Any error means
    /// the sender must be disconnected.
    pub fn fill_from<R: Read>(&mut self, src: &mut R) -> Result<Fill, FramerError> {
        if self.len == self.buf.len() {
            self.grow()?;
        }
        loop {
            match src.read(&mut self.buf[self.len..]) {
                Ok(0) => return Ok(Fill::Closed),
                Ok(n) => {
                    self.len += n;
                    return Ok(Fill::Data(n));
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => return Ok(Fill::WouldBlock),
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(FramerError::Io(e)),
            }
        }
    }

    /// # Feed Bytes
    ///
    /// Appends `bytes` and returns an iterator over the messages that are now
    /// complete. Messages are extracted lazily as the iterator is advanced; any
    /// not pulled stay buffered and come out of the next call.
    pub fn feed(&mut self, bytes: &[u8]) -> Result<Messages<'_>, FramerError> {
        let mut rest = bytes;
        while !rest.is_empty() {
            if self.len == self.buf.len() {
                self.grow()?;
            }
            let n = rest.len().min(self.buf.len() - self.len);
            self.buf[self.len..self.len + n].copy_from_slice(&rest[..n]);
            self.len += n;
            rest = &rest[n..];
        }
        Ok(self.messages())
    }

    /// Iterator over the complete messages currently buffered.
    pub fn messages(&mut self) -> Messages<'_> {
        Messages { framer: self }
    }

    /// Extracts the next complete message, if one is buffered.
    ///
    /// The returned bytes are an exact copy of the object as received. The
    /// accumulator is compacted afterwards and scanning restarts from its front.
    pub fn next_message(&mut self) -> Option<Vec<u8>> {
        if self.scan.pos == 0 {
            self.trim_leading_whitespace();
        }

        let end = self.scan_for_boundary()?;
        let message = self.buf[..end].to_vec();
        self.compact(end);
        self.scan = ScanState::default();
        trace!(len = message.len(), remaining = self.len, "message framed");
        Some(message)
    }

    fn trim_leading_whitespace(&mut self) {
        let skip = self.buf[..self.len]
            .iter()
            .take_while(|b| b.is_ascii_whitespace())
            .count();
        if skip > 0 {
            self.compact(skip);
        }
    }

    /// Advances the resumable scan; returns the exclusive end of a message.
    fn scan_for_boundary(&mut self) -> Option<usize> {
        let s = &mut self.scan;
        while s.pos < self.len {
            let b = self.buf[s.pos];
            s.pos += 1;
            if s.in_string {
                if s.escaped {
                    s.escaped = false;
                } else if b == b'\\' {
                    s.escaped = true;
                } else if b == b'"' {
                    s.in_string = false;
                }
                continue;
            }
            match b {
                b'"' => s.in_string = true,
                b'{' => s.depth += 1,
                b'}' => {
                    s.depth -= 1;
                    if s.depth == 0 {
                        return Some(s.pos);
                    }
                }
                _ => {}
            }
        }
        trace!(scanned = s.pos, depth = s.depth, in_string = s.in_string, "no complete message yet");
        None
    }

    fn compact(&mut self, consumed: usize) {
        self.buf.copy_within(consumed..self.len, 0);
        self.len -= consumed;
    }
}

/// Lazily yields complete messages out of a [`Framer`].
#[derive(Debug)]
pub struct Messages<'a> {
    framer: &'a mut Framer,
}

impl Iterator for Messages<'_> {
    type Item = Vec<u8>;

    fn next(&mut self) -> Option<Self::Item> {
        self.framer.next_message()
    }
}
