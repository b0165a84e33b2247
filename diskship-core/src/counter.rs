//! Byte counters shared between the transfer and the progress reporter.
//!
//! A [`ByteCounter`] is written by exactly one stream stage and may be read from any
//! thread. The stages here are pass-through: they never alter the bytes they see.

use std::io::{self, Read, Write};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use crate::error::{Stage, cancelled, tag};

/// A monotonically non-decreasing running total of bytes.
#[derive(Debug, Default)]
pub struct ByteCounter {
    total: AtomicU64,
}

impl ByteCounter {
    /// Create a shared counter starting at zero.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Add `n` bytes to the total.
    pub fn add(&self, n: u64) {
        self.total.fetch_add(n, Ordering::Release);
    }

    /// The current total.
    pub fn get(&self) -> u64 {
        self.total.load(Ordering::Acquire)
    }
}

/// A shared flag used to request cooperative cancellation of an export.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation. Safe to call from a signal handler thread.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// The read side of the transfer: counts bytes as they leave the device.
///
/// Errors from the inner reader are attributed to [`Stage::Device`]. A cancelled
/// token makes the next read fail, so the archive never sees another byte.
pub struct CountingReader<R> {
    inner: R,
    counter: Arc<ByteCounter>,
    cancel: CancelToken,
}

impl<R: Read> CountingReader<R> {
    pub fn new(inner: R, counter: Arc<ByteCounter>, cancel: CancelToken) -> Self {
        Self {
            inner,
            counter,
            cancel,
        }
    }
}

impl<R: Read> Read for CountingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.cancel.is_cancelled() {
            return Err(cancelled());
        }
        let n = self.inner.read(buf).map_err(|e| tag(Stage::Device, e))?;
        self.counter.add(n as u64);
        Ok(n)
    }
}

/// The upload side of the transfer: counts bytes once the sink has accepted them.
///
/// Errors from the inner writer are attributed to [`Stage::Sink`].
pub struct CountingWriter<W> {
    inner: W,
    counter: Arc<ByteCounter>,
}

impl<W: Write> CountingWriter<W> {
    pub fn new(inner: W, counter: Arc<ByteCounter>) -> Self {
        Self { inner, counter }
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}

impl<W: Write> Write for CountingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf).map_err(|e| tag(Stage::Sink, e))?;
        self.counter.add(n as u64);
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush().map_err(|e| tag(Stage::Sink, e))
    }
}
