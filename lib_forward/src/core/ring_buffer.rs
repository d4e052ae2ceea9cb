//! # Per-Client Output Ring Buffer
//!
//! Every client peer owns one fixed-capacity circular byte buffer. Broadcast
//! traffic is appended at `head`; the event loop drains from `tail` into the
//! client socket whenever the socket reports writable.
//!
//! ## Core Rules:
//!
//! - **One reserved slot**: `head == tail` means empty, so at most
//!   `capacity - 1` bytes can ever be buffered.
//! - **All-or-nothing admission**: an append that does not fit is rejected and
//!   writes nothing. The caller treats rejection as "this client is too slow" and
//!   disconnects it; there is no partial delivery and no retry.
//! - **Single contiguous drain**: `drain_to` offers at most one contiguous run to
//!   the writer. When the data wraps, the remainder goes out on a later call.

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, unused_qualifications)]

use std::collections::TryReserveError;
use std::io::{self, ErrorKind, Write};

use thiserror::Error;

/// Default capacity of a client ring buffer, in bytes.
pub const CLIENT_BUFFER_SIZE: usize = 16384;

/// Returned when an append would not fit into the free space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("ring buffer overflow: {needed} bytes needed, {free} bytes free")]
pub struct Overflow {
    /// Bytes the rejected append needed.
    pub needed: usize,
    /// Bytes that were free at the time.
    pub free: usize,
}

/// # Ring Buffer
///
/// Bounded FIFO of bytes with wraparound. `head` is the write cursor, `tail` the
/// read cursor; both are always `< capacity`.
#[derive(Debug)]
pub struct RingBuffer {
    buf: Box<[u8]>,
    head: usize,
    tail: usize,
}

impl RingBuffer {
    /// Allocates a zeroed buffer of `capacity` bytes.
    ///
    /// Fails instead of aborting when the allocator refuses the request, so the
    /// caller can drop the connection that asked for it.
    pub fn try_with_capacity(capacity: usize) -> Result<Self, TryReserveError> {
        let mut storage = Vec::new();
        storage.try_reserve_exact(capacity)?;
        storage.resize(capacity, 0);
        Ok(Self {
            buf: storage.into_boxed_slice(),
            head: 0,
            tail: 0,
        })
    }

    /// Physical size of the backing storage.
    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    /// Largest number of bytes that can be buffered at once.
    pub fn usable(&self) -> usize {
        self.capacity().saturating_sub(1)
    }

    /// Bytes currently buffered.
    pub fn len(&self) -> usize {
        let cap = self.capacity();
        if cap == 0 {
            return 0;
        }
        (self.head + cap - self.tail) % cap
    }

    /// `true` when nothing is waiting to be sent.
    pub fn is_empty(&self) -> bool {
        self.head == self.tail
    }

    /// Bytes that can still be appended.
    pub fn free(&self) -> usize {
        self.usable() - self.len()
    }

    /// # Append
    ///
    /// Copies `bytes` in at `head`, splitting the copy at the physical end of the
    /// storage when needed.
    ///
    /// # Errors
    /// [`Overflow`] when `bytes.len()` exceeds [`free`](Self::free). Nothing is
    /// written in that case.
    pub fn append(&mut self, bytes: &[u8]) -> Result<(), Overflow> {
        self.append_all(&[bytes])
    }

    /// Appends several slices as a single admission unit.
    ///
    /// Either every part is written, back to back, or none is. Used to admit a
    /// message together with its delimiter.
    pub fn append_all(&mut self, parts: &[&[u8]]) -> Result<(), Overflow> {
        let needed: usize = parts.iter().map(|p| p.len()).sum();
        let free = self.free();
        if needed > free {
            return Err(Overflow { needed, free });
        }
        for part in parts {
            self.copy_in(part);
        }
        Ok(())
    }

    fn copy_in(&mut self, bytes: &[u8]) {
        if bytes.is_empty() {
            return;
        }
        let cap = self.capacity();
        let first = bytes.len().min(cap - self.head);
        self.buf[self.head..self.head + first].copy_from_slice(&bytes[..first]);
        let rest = bytes.len() - first;
        if rest > 0 {
            self.buf[..rest].copy_from_slice(&bytes[first..]);
        }
        self.head = (self.head + bytes.len()) % cap;
    }

    /// The run of buffered bytes starting at `tail` that does not wrap.
    pub fn contiguous(&self) -> &[u8] {
        if self.head >= self.tail {
            &self.buf[self.tail..self.head]
        } else {
            &self.buf[self.tail..]
        }
    }

    /// Marks `n` bytes at `tail` as sent.
    fn consume(&mut self, n: usize) {
        debug_assert!(n <= self.contiguous().len());
        let cap = self.capacity();
        self.tail = (self.tail + n) % cap;
    }

    /// # Drain
    ///
    /// Offers the contiguous run at `tail` to `writer` in one `write` call and
    /// advances `tail` by whatever the writer accepted. Returns `Ok(0)` without
    /// touching the writer when the buffer is empty.
    ///
    /// # Errors
    /// - `WouldBlock` / `Interrupted` are passed through untouched; the caller
    ///   retries on a later readiness event.
    /// - A writer that accepts zero bytes yields `ErrorKind::WriteZero`.
    /// - Anything else is the writer's own error.
    pub fn drain_to<W: Write>(&mut self, writer: &mut W) -> io::Result<usize> {
        if self.is_empty() {
            return Ok(0);
        }
        let written = writer.write(self.contiguous())?;
        if written == 0 {
            return Err(io::Error::new(
                ErrorKind::WriteZero,
                "peer accepted zero bytes",
            ));
        }
        self.consume(written);
        Ok(written)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    /// A writer that accepts at most `limit` bytes per call.
    struct Trickle {
        limit: usize,
        out: Vec<u8>,
        calls: usize,
    }

    impl Trickle {
        fn new(limit: usize) -> Self {
            Self { limit, out: Vec::new(), calls: 0 }
        }
    }

    impl Write for Trickle {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.calls += 1;
            let n = buf.len().min(self.limit);
            self.out.extend_from_slice(&buf[..n]);
            Ok(n)
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    struct Failing(ErrorKind);

    impl Write for Failing {
        fn write(&mut self, _buf: &[u8]) -> io::Result<usize> {
            Err(io::Error::from(self.0))
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn drain_all(ring: &mut RingBuffer, sink: &mut Trickle) {
        while !ring.is_empty() {
            ring.drain_to(sink).unwrap();
        }
    }

    #[test]
    fn test_usable_capacity_reserves_one_slot() {
        let mut ring = RingBuffer::try_with_capacity(8).unwrap();
        assert_eq!(ring.usable(), 7);
        assert_eq!(ring.free(), 7);
        ring.append(b"1234567").unwrap();
        assert_eq!(ring.free(), 0);
        assert_eq!(ring.append(b"x"), Err(Overflow { needed: 1, free: 0 }));
    }

    #[test]
    fn test_rejected_append_writes_nothing() {
        let mut ring = RingBuffer::try_with_capacity(8).unwrap();
        ring.append(b"abc").unwrap();
        let err = ring.append(b"defgh").unwrap_err();
        assert_eq!(err, Overflow { needed: 5, free: 4 });
        assert_eq!(ring.len(), 3);

        let mut sink = Trickle::new(usize::MAX);
        drain_all(&mut ring, &mut sink);
        assert_eq!(sink.out, b"abc");
    }

    #[test]
    fn test_append_all_is_atomic() {
        let mut ring = RingBuffer::try_with_capacity(8).unwrap();
        assert!(ring.append_all(&[b"123456", b"\n"]).is_ok());
        assert!(ring.append_all(&[b"", b"\n"]).is_err());
        assert_eq!(ring.len(), 7);
    }

    #[test]
    fn test_drain_offers_only_contiguous_run() {
        let mut ring = RingBuffer::try_with_capacity(8).unwrap();
        let mut sink = Trickle::new(usize::MAX);

        // Move the cursors close to the physical end.
        ring.append(b"123456").unwrap();
        drain_all(&mut ring, &mut sink);
        sink.out.clear();
        sink.calls = 0;

        // Wraps: two bytes at the end, three at the front.
        ring.append(b"abcde").unwrap();
        assert_eq!(ring.contiguous(), b"ab");
        assert_eq!(ring.drain_to(&mut sink).unwrap(), 2);
        assert_eq!(ring.drain_to(&mut sink).unwrap(), 3);
        assert_eq!(sink.out, b"abcde");
        assert_eq!(sink.calls, 2);
        assert!(ring.is_empty());
    }

    #[test]
    fn test_partial_writes_advance_tail() {
        let mut ring = RingBuffer::try_with_capacity(16).unwrap();
        ring.append(b"{\"a\":1}\n").unwrap();
        let mut sink = Trickle::new(3);
        assert_eq!(ring.drain_to(&mut sink).unwrap(), 3);
        assert_eq!(ring.len(), 5);
        drain_all(&mut ring, &mut sink);
        assert_eq!(sink.out, b"{\"a\":1}\n");
    }

    #[test]
    fn test_drain_empty_does_not_touch_writer() {
        let mut ring = RingBuffer::try_with_capacity(4).unwrap();
        let mut failing = Failing(ErrorKind::BrokenPipe);
        assert_eq!(ring.drain_to(&mut failing).unwrap(), 0);
    }

    #[test]
    fn test_drain_errors() {
        let mut ring = RingBuffer::try_with_capacity(4).unwrap();
        ring.append(b"ab").unwrap();

        let err = ring.drain_to(&mut Failing(ErrorKind::WouldBlock)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::WouldBlock);
        assert_eq!(ring.len(), 2);

        let err = ring.drain_to(&mut Trickle::new(0)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::WriteZero);

        let err = ring.drain_to(&mut Failing(ErrorKind::ConnectionReset)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ConnectionReset);
        assert_eq!(ring.len(), 2);
    }

    proptest! {
        #[test]
        fn prop_fifo_under_partial_drains(
            chunks in proptest::collection::vec(proptest::collection::vec(any::<u8>(), 0..12), 1..40),
            limit in 1usize..7,
        ) {
            let mut ring = RingBuffer::try_with_capacity(17).unwrap();
            let mut sink = Trickle::new(limit);
            let mut expected = Vec::new();

            for chunk in &chunks {
                if ring.append(chunk).is_ok() {
                    expected.extend_from_slice(chunk);
                }
                // One drain per appended chunk keeps the buffer partially full.
                let _ = ring.drain_to(&mut sink).unwrap();
                prop_assert!(ring.len() <= ring.usable());
            }
            drain_all(&mut ring, &mut sink);
            prop_assert_eq!(sink.out, expected);
        }
    }
}
