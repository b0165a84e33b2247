//! Error types for the export pipeline.

use std::fmt;
use std::io;

/// A layer of the export stream, used to name where a failure happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    /// Reading bytes from the block device.
    Device,
    /// The tar writer.
    Archive,
    /// The gzip compressor.
    Compressor,
    /// The destination object sink.
    Sink,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stage::Device => write!(f, "device"),
            Stage::Archive => write!(f, "archive"),
            Stage::Compressor => write!(f, "compressor"),
            Stage::Sink => write!(f, "sink"),
        }
    }
}

/// The main error type for diskship operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The length of the block device could not be determined.
    #[error("probe error: {message}")]
    Probe { message: String },

    /// A request parameter was rejected before any I/O took place.
    #[error("config error: {message}")]
    Config { message: String },

    /// A write, flush or close failed while streaming. The destination object is
    /// left in whatever state the sink produced.
    #[error("{stage} stage failed{}: {source}", closed_suffix(.closed))]
    Stream {
        stage: Stage,
        /// Stages that were already closed successfully before the failure.
        closed: Vec<Stage>,
        source: io::Error,
    },

    /// The confirmation prompt could not be shown or answered.
    #[error("confirmation prompt failed: {0}")]
    Prompt(#[source] io::Error),

    /// The export was cancelled before the object was committed.
    #[error("export cancelled")]
    Cancelled,
}

fn closed_suffix(closed: &[Stage]) -> String {
    if closed.is_empty() {
        return String::new();
    }
    let names: Vec<String> = closed.iter().map(Stage::to_string).collect();
    format!(" after closing {}", names.join(", "))
}

/// A specialized Result type for diskship operations.
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Create a probe error.
    pub fn probe(message: impl Into<String>) -> Self {
        Self::Probe {
            message: message.into(),
        }
    }

    /// Create a config error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Create a stream error raised while bytes were still flowing.
    pub fn stream(stage: Stage, source: io::Error) -> Self {
        Self::Stream {
            stage,
            closed: Vec::new(),
            source,
        }
    }

    /// The stage that failed, if this is a stream error.
    pub fn stage(&self) -> Option<Stage> {
        match self {
            Error::Stream { stage, .. } => Some(*stage),
            _ => None,
        }
    }
}

/// An I/O error attributed to a specific stage.
///
/// Errors travel up through `tar` and `flate2` as plain `io::Error`s; wrapping the
/// original error lets the pipeline recover which layer produced it.
#[derive(Debug)]
struct StageFault {
    stage: Stage,
    source: io::Error,
}

impl fmt::Display for StageFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.source.fmt(f)
    }
}

impl std::error::Error for StageFault {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.source)
    }
}

/// Tag an I/O error with the stage it came from, keeping its kind.
pub(crate) fn tag(stage: Stage, source: io::Error) -> io::Error {
    let kind = source.kind();
    io::Error::new(kind, StageFault { stage, source })
}

/// Payload of the I/O error returned by a read that saw the cancel flag.
#[derive(Debug)]
struct CancelledRead;

impl fmt::Display for CancelledRead {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "export cancelled")
    }
}

impl std::error::Error for CancelledRead {}

/// The error a cancelled read hands to the layers above it.
pub(crate) fn cancelled() -> io::Error {
    io::Error::other(CancelledRead)
}

/// Whether `err` is the error produced by [`cancelled`], and not some other failure
/// that happened to race with a cancel request.
pub(crate) fn is_cancellation(err: &io::Error) -> bool {
    err.get_ref()
        .is_some_and(|inner| inner.is::<CancelledRead>())
}

/// Convert an I/O error that surfaced at `fallback` into a stream error, using the
/// tagged stage when one of the inner layers tagged it.
pub(crate) fn attribute(fallback: Stage, err: io::Error) -> Error {
    let stage = err
        .get_ref()
        .and_then(|inner| inner.downcast_ref::<StageFault>())
        .map(|fault| fault.stage);

    match stage {
        Some(stage) => {
            let source = match err.into_inner().map(|inner| inner.downcast::<StageFault>()) {
                Some(Ok(fault)) => fault.source,
                Some(Err(other)) => io::Error::other(other),
                None => io::Error::other("unknown stream failure"),
            };
            Error::stream(stage, source)
        }
        None => Error::stream(fallback, err),
    }
}
