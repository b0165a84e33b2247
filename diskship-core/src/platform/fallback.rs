use crate::device::seek_len;
use crate::error::Result;
use std::fs::File;

/// Returns the length of a device by seeking to its end.
///
/// The handle's position is restored afterwards, so no content is skipped.
pub fn device_size(file: &File) -> Result<u64> {
    let mut handle = file;
    seek_len(&mut handle)
}
