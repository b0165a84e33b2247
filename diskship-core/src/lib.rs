//! The core, UI-agnostic library for the `diskship` disk export utility.
//!
//! `diskship-core` streams a raw block device into a gzip-compressed tar archive
//! written straight into an object-storage sink. The full image is never staged on
//! local disk: bytes flow through a chain of stream stages.
//!
//! ```text
//! device → CountingReader → tar → gzip → CountingWriter → UploadSink
//! ```
//!
//! The library is structured into several modules:
//! - [`device`]: Block device handles and the [`DiskSizeProbe`] capability.
//! - [`platform`]: The build-time selected way to measure a device.
//! - [`counter`]: Atomic byte counters and the stages that feed them.
//! - [`archive`]: Tar framing of the manifest and disk entries.
//! - [`compress`]: Streaming gzip.
//! - [`sink`]: Destination handles and the [`ObjectStore`] capability.
//! - [`progress`]: The background throughput reporter.
//! - [`confirm`]: The yes/no gate in front of the destination.
//! - [`export`]: The [`Exporter`] tying everything together.
//!
//! Callers provide the pieces that depend on their environment (an opened device,
//! an object store, a prompt) and receive progress lines through a callback, so
//! any front-end can present them as it likes.

pub mod archive;
pub mod compress;
pub mod confirm;
pub mod counter;
pub mod device;
pub mod error;
pub mod export;
pub mod platform;
pub mod progress;
pub mod request;
pub mod sink;

pub use confirm::{Confirm, LinePrompt};
pub use counter::{ByteCounter, CancelToken};
pub use device::{BlockDevice, DiskSizeProbe};
pub use error::{Error, Result, Stage};
pub use export::{ExportOutcome, ExportPhase, ExportSummary, Exporter};
pub use request::{CompressionLevel, ExportRequest, ObjectPath};
pub use sink::{LocalObjectStore, ObjectStore, UploadSink};
