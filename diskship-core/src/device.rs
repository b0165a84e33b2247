//! Block device handles and the disk length capability.

use std::fmt;
use std::fs::File;
use std::io::{self, Cursor, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};
use crate::platform;

/// The ability to report the exact byte length of a disk without touching its content.
///
/// For real devices the implementation is chosen at build time by the
/// [`crate::platform`] module.
pub trait DiskSizeProbe {
    fn disk_size(&mut self) -> Result<u64>;
}

/// Measure a seekable handle by seeking to its end, then restore the original position.
pub fn seek_len<S: Seek>(handle: &mut S) -> Result<u64> {
    let measure = |handle: &mut S| -> io::Result<u64> {
        let pos = handle.stream_position()?;
        let end = handle.seek(SeekFrom::End(0))?;
        handle.seek(SeekFrom::Start(pos))?;
        Ok(end)
    };
    measure(handle).map_err(|e| Error::probe(format!("seek-based measurement failed: {e}")))
}

/// An open, read-only block device.
#[derive(Debug)]
pub struct BlockDevice {
    path: PathBuf,
    file: File,
}

impl BlockDevice {
    /// Open the device at `path` for reading.
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path)
            .map_err(|e| Error::probe(format!("cannot open '{}': {e}", path.display())))?;
        Ok(Self {
            path: path.to_path_buf(),
            file,
        })
    }

    /// The system path of the device (e.g., `/dev/sdb`).
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Read for BlockDevice {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.file.read(buf)
    }
}

impl DiskSizeProbe for BlockDevice {
    fn disk_size(&mut self) -> Result<u64> {
        platform::device_size(&self.file).map_err(|e| match e {
            Error::Probe { message } => {
                Error::probe(format!("{}: {message}", self.path.display()))
            }
            other => other,
        })
    }
}

/// In-memory disks are measured by seeking, on every platform.
impl<T: AsRef<[u8]>> DiskSizeProbe for Cursor<T> {
    fn disk_size(&mut self) -> Result<u64> {
        seek_len(self)
    }
}

impl fmt::Display for BlockDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.path.display())
    }
}
