//! Tar framing for the exported disk.
//!
//! The archive holds at most two entries, always in this order:
//! 1.  `manifest.json`, only when licenses were requested.
//! 2.  `disk.raw`, the verbatim device content.
//!
//! Tar readers trust the size in each header, so every payload written here is
//! exactly as long as its header declares.
use std::io::{self, Read, Write};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tar::{EntryType, Header};

use crate::error::{Stage, tag};

/// Archive member name of the license manifest.
pub const MANIFEST_NAME: &str = "manifest.json";
/// Archive member name of the disk image.
pub const DISK_NAME: &str = "disk.raw";
/// Owner read/write only.
pub const ENTRY_MODE: u32 = 0o600;

/// Metadata embedded next to the disk image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    pub licenses: Vec<String>,
}

impl Manifest {
    pub fn new(licenses: &[String]) -> Self {
        Self {
            licenses: licenses.to_vec(),
        }
    }

    /// The exact bytes stored in the archive.
    pub fn to_json(&self) -> io::Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(io::Error::other)
    }
}

/// Writes the manifest and disk entries into a GNU tar stream.
pub struct ArchiveBuilder<W: Write> {
    builder: tar::Builder<W>,
}

impl<W: Write> ArchiveBuilder<W> {
    pub fn new(inner: W) -> Self {
        Self {
            builder: tar::Builder::new(inner),
        }
    }

    /// Append `manifest.json` for `licenses` and return its payload length.
    pub fn append_manifest(&mut self, licenses: &[String]) -> io::Result<u64> {
        let json = Manifest::new(licenses).to_json()?;
        let len = json.len() as u64;
        let header = entry_header(MANIFEST_NAME, len)?;
        self.builder.append(&header, json.as_slice())?;
        Ok(len)
    }

    /// Append `disk.raw` declaring `size` bytes and copy exactly that many from `device`.
    ///
    /// A device that runs dry early fails the entry; bytes past `size` are never read.
    pub fn append_disk<R: Read>(&mut self, device: R, size: u64) -> io::Result<()> {
        let header = entry_header(DISK_NAME, size)?;
        self.builder.append(&header, ExactReader::new(device, size))
    }

    /// Write the end-of-archive blocks and hand back the inner writer.
    pub fn finish(self) -> io::Result<W> {
        self.builder.into_inner()
    }
}

fn entry_header(name: &str, size: u64) -> io::Result<Header> {
    let mtime = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);

    let mut header = Header::new_gnu();
    header.set_path(name)?;
    header.set_entry_type(EntryType::Regular);
    header.set_mode(ENTRY_MODE);
    header.set_size(size);
    header.set_mtime(mtime);
    header.set_cksum();
    Ok(header)
}

/// Yields exactly `remaining` bytes from `inner`, or fails.
struct ExactReader<R> {
    inner: R,
    declared: u64,
    remaining: u64,
}

impl<R: Read> ExactReader<R> {
    fn new(inner: R, declared: u64) -> Self {
        Self {
            inner,
            declared,
            remaining: declared,
        }
    }
}

impl<R: Read> Read for ExactReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.remaining == 0 || buf.is_empty() {
            return Ok(0);
        }

        let max = buf.len().min(usize::try_from(self.remaining).unwrap_or(usize::MAX));
        let n = self.inner.read(&mut buf[..max])?;
        if n == 0 {
            let copied = self.declared - self.remaining;
            return Err(tag(
                Stage::Device,
                io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    format!(
                        "device ended after {copied} of {} declared bytes",
                        self.declared
                    ),
                ),
            ));
        }

        self.remaining -= n as u64;
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn entries(archive: &[u8]) -> Vec<(String, u64, u32, Vec<u8>)> {
        let mut reader = tar::Archive::new(archive);
        reader
            .entries()
            .unwrap()
            .map(|entry| {
                let mut entry = entry.unwrap();
                let name = entry.path().unwrap().to_string_lossy().to_string();
                let size = entry.header().size().unwrap();
                let mode = entry.header().mode().unwrap();
                let mut body = Vec::new();
                entry.read_to_end(&mut body).unwrap();
                (name, size, mode, body)
            })
            .collect()
    }

    #[test]
    fn test_manifest_json_is_compact() {
        let json = Manifest::new(&["LIC-A".into(), "LIC-B".into()])
            .to_json()
            .unwrap();
        assert_eq!(json, br#"{"licenses":["LIC-A","LIC-B"]}"#);
    }

    #[test]
    fn test_manifest_precedes_disk() {
        let disk = vec![0xABu8; 3000];
        let mut archive = ArchiveBuilder::new(Vec::new());
        let manifest_len = archive
            .append_manifest(&["LIC-A".into()])
            .unwrap();
        archive.append_disk(Cursor::new(&disk), 3000).unwrap();
        let bytes = archive.finish().unwrap();

        let found = entries(&bytes);
        assert_eq!(found.len(), 2);
        assert_eq!(found[0].0, MANIFEST_NAME);
        assert_eq!(found[0].1, manifest_len);
        assert_eq!(found[0].3, br#"{"licenses":["LIC-A"]}"#);
        assert_eq!(found[1].0, DISK_NAME);
        assert_eq!(found[1].1, 3000);
        assert_eq!(found[1].3, disk);
    }

    #[test]
    fn test_entries_are_owner_read_write() {
        let mut archive = ArchiveBuilder::new(Vec::new());
        archive.append_manifest(&["X".into()]).unwrap();
        archive.append_disk(Cursor::new(vec![1u8; 10]), 10).unwrap();
        let bytes = archive.finish().unwrap();

        for (name, _, mode, _) in entries(&bytes) {
            assert_eq!(mode, 0o600, "{name} has mode {mode:o}");
        }
    }

    #[test]
    fn test_empty_disk_entry() {
        let mut archive = ArchiveBuilder::new(Vec::new());
        archive.append_disk(Cursor::new(Vec::new()), 0).unwrap();
        let bytes = archive.finish().unwrap();

        let found = entries(&bytes);
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].0, DISK_NAME);
        assert_eq!(found[0].1, 0);
        assert!(found[0].3.is_empty());
    }

    #[test]
    fn test_short_device_is_rejected() {
        let mut archive = ArchiveBuilder::new(Vec::new());
        let err = archive
            .append_disk(Cursor::new(vec![0u8; 100]), 512)
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
        assert!(err.to_string().contains("100 of 512"));
    }

    #[test]
    fn test_long_device_is_cut_at_declared_size() {
        let mut device = Cursor::new(vec![9u8; 2048]);
        let mut archive = ArchiveBuilder::new(Vec::new());
        archive.append_disk(&mut device, 1024).unwrap();
        let bytes = archive.finish().unwrap();

        assert_eq!(device.position(), 1024);
        let found = entries(&bytes);
        assert_eq!(found[0].3.len(), 1024);
    }

    #[test]
    fn test_archive_is_block_aligned() {
        let mut archive = ArchiveBuilder::new(Vec::new());
        archive.append_disk(Cursor::new(vec![5u8; 700]), 700).unwrap();
        let bytes = archive.finish().unwrap();
        assert_eq!(bytes.len() % 512, 0);
    }

    #[test]
    fn test_disk_header_beyond_octal_range() {
        // 8 GiB and up no longer fit the 11 octal digits of a ustar size field.
        let size = 9u64 << 30;
        let header = entry_header(DISK_NAME, size).unwrap();

        assert_eq!(header.size().unwrap(), size);
        assert_eq!(header.path().unwrap().to_str(), Some(DISK_NAME));
        assert_eq!(header.mode().unwrap(), ENTRY_MODE);
    }
}
