//! Platform-specific disk length determination.
//!
//! Exactly one implementation of [`device_size`] is compiled in, selected by
//! `#[cfg]` for the target OS:
//! - Linux asks the kernel for the device length with the `BLKGETSIZE64` ioctl.
//! - Every other target seeks to the end of the handle and reads back the offset.

#[cfg(target_os = "linux")]
mod linux;
#[cfg(target_os = "linux")]
pub use self::linux::device_size;

#[cfg(not(target_os = "linux"))]
mod fallback;
#[cfg(not(target_os = "linux"))]
pub use self::fallback::device_size;
