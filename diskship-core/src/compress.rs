//! Streaming gzip between the archive and the upload sink.
use std::io::{self, Write};

use flate2::Compression;
use flate2::write::GzEncoder;

use crate::request::CompressionLevel;

/// Compresses bytes incrementally as the archive produces them.
pub struct CompressionStage<W: Write> {
    encoder: GzEncoder<W>,
}

impl<W: Write> CompressionStage<W> {
    pub fn new(inner: W, level: CompressionLevel) -> Self {
        Self {
            encoder: GzEncoder::new(inner, Compression::new(level.get())),
        }
    }

    /// Flush the compressor state and the gzip trailer, then return the inner
    /// writer untouched. The inner writer is not closed.
    pub fn finish(self) -> io::Result<W> {
        self.encoder.finish()
    }
}

impl<W: Write> Write for CompressionStage<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.encoder.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.encoder.flush()
    }
}
