use crate::error::{Error, Result};
use nix::ioctl_read;
use std::fs::File;
use std::os::unix::fs::FileTypeExt;
use std::os::unix::io::AsRawFd;

ioctl_read!(blkgetsize64, 0x12, 114, u64);

/// Returns the exact length of a Linux block device in bytes.
///
/// The handle must refer to a block device; regular files and character devices
/// are rejected rather than measured.
pub fn device_size(file: &File) -> Result<u64> {
    let metadata = file
        .metadata()
        .map_err(|e| Error::probe(format!("cannot stat device: {e}")))?;
    if !metadata.file_type().is_block_device() {
        return Err(Error::probe("not a block device"));
    }

    let mut size_bytes: u64 = 0;
    // SAFETY: the fd is valid for the lifetime of `file` and BLKGETSIZE64 writes a
    // single u64 into `size_bytes`.
    let result = unsafe { blkgetsize64(file.as_raw_fd(), &mut size_bytes) };
    result.map_err(|errno| Error::probe(format!("BLKGETSIZE64 failed: {errno}")))?;

    Ok(size_bytes)
}
