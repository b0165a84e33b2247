//! Export orchestrator: block device to compressed archive in object storage.
//!
//! One export walks through these phases, in order:
//! 1. Probe the device for its exact length.
//! 2. Optionally ask for confirmation. A declined export opens nothing.
//! 3. Stream device → tar → gzip → sink while a reporter thread prints throughput.
//! 4. Close the layers inside-out: archive, compressor, then commit the sink.
//!
//! Any failure moves the export to [`ExportPhase::Failed`]; nothing is retried.
//!
//! # Example
//!
//! ```no_run
//! use diskship_core::{BlockDevice, ExportRequest, Exporter, LocalObjectStore};
//!
//! let request = ExportRequest::new(
//!     "/dev/sdb",
//!     "gs://images/sdb.tar.gz",
//!     vec!["LIC-A".to_string()],
//!     6,
//!     false,
//! )?;
//! let device = BlockDevice::open(request.device())?;
//! let store = LocalObjectStore::new("/mnt/buckets");
//!
//! Exporter::new(request).run(device, &store, None, |line| println!("{line}"))?;
//! # Ok::<(), diskship_core::Error>(())
//! ```
use std::fmt;
use std::io::{self, BufReader, Read};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::archive::ArchiveBuilder;
use crate::compress::CompressionStage;
use crate::confirm::Confirm;
use crate::counter::{ByteCounter, CancelToken, CountingReader, CountingWriter};
use crate::device::DiskSizeProbe;
use crate::error::{Error, Result, Stage, attribute, is_cancellation};
use crate::progress::{DEFAULT_INTERVAL, ProgressReporter};
use crate::request::{ExportRequest, ObjectPath};
use crate::sink::{ObjectStore, UploadSink};

/// Device reads are issued in chunks of this size.
const READ_BUFFER_SIZE: usize = 1024 * 1024;

/// The full stack of writers between the archive and the destination.
type ExportStream<S> = ArchiveBuilder<CompressionStage<CountingWriter<S>>>;

/// Phase of an export.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportPhase {
    Idle,
    Probing,
    Confirming,
    Streaming,
    Finalizing,
    Completed,
    /// The user answered no; nothing was written.
    Declined,
    Failed,
}

impl fmt::Display for ExportPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExportPhase::Idle => write!(f, "Idle"),
            ExportPhase::Probing => write!(f, "Probing"),
            ExportPhase::Confirming => write!(f, "Confirming"),
            ExportPhase::Streaming => write!(f, "Streaming"),
            ExportPhase::Finalizing => write!(f, "Finalizing"),
            ExportPhase::Completed => write!(f, "Completed"),
            ExportPhase::Declined => write!(f, "Declined"),
            ExportPhase::Failed => write!(f, "Failed"),
        }
    }
}

/// What a finished export produced.
#[derive(Debug, Clone)]
pub struct ExportSummary {
    pub destination: ObjectPath,
    pub disk_size: u64,
    pub bytes_read: u64,
    /// Compressed bytes accepted by the sink, gzip trailer included.
    pub bytes_uploaded: u64,
    pub manifest_included: bool,
    pub elapsed: Duration,
}

/// How an export ended when it did not fail.
#[derive(Debug, Clone)]
pub enum ExportOutcome {
    Completed(ExportSummary),
    Declined,
}

/// Runs one export described by an [`ExportRequest`].
pub struct Exporter {
    request: ExportRequest,
    cancel: CancelToken,
    progress_interval: Option<Duration>,
    phase: ExportPhase,
    failed_during: Option<ExportPhase>,
    read: Arc<ByteCounter>,
    uploaded: Arc<ByteCounter>,
}

impl Exporter {
    pub fn new(request: ExportRequest) -> Self {
        Self {
            request,
            cancel: CancelToken::new(),
            progress_interval: Some(DEFAULT_INTERVAL),
            phase: ExportPhase::Idle,
            failed_during: None,
            read: ByteCounter::new(),
            uploaded: ByteCounter::new(),
        }
    }

    /// Use `cancel` to stop the export from another thread.
    pub fn with_cancel_token(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Report progress every `interval`, or never with `None`.
    pub fn with_progress_interval(mut self, interval: Option<Duration>) -> Self {
        self.progress_interval = interval;
        self
    }

    pub fn request(&self) -> &ExportRequest {
        &self.request
    }

    pub fn phase(&self) -> ExportPhase {
        self.phase
    }

    /// The phase that was running when the export failed.
    pub fn failed_during(&self) -> Option<ExportPhase> {
        self.failed_during
    }

    /// Bytes read from the device so far.
    pub fn bytes_read(&self) -> u64 {
        self.read.get()
    }

    /// Bytes accepted by the sink so far.
    pub fn bytes_uploaded(&self) -> u64 {
        self.uploaded.get()
    }

    /// Run the export to completion.
    ///
    /// `confirm` is only consulted when the request requires confirmation, and it
    /// always runs before `store` is asked for a sink. `on_progress` receives the
    /// reporter's lines from a background thread.
    ///
    /// Each run starts from zeroed counters, so an `Exporter` can be reused for
    /// another device.
    pub fn run<D, S, F>(
        &mut self,
        device: D,
        store: &S,
        confirm: Option<&mut dyn Confirm>,
        on_progress: F,
    ) -> Result<ExportOutcome>
    where
        D: Read + DiskSizeProbe,
        S: ObjectStore,
        F: FnMut(String) + Send + 'static,
    {
        self.reset();
        let started = Instant::now();
        let result = self.drive(device, store, confirm, on_progress, started);
        match &result {
            Ok(ExportOutcome::Completed(summary)) => {
                self.transition(ExportPhase::Completed);
                tracing::info!(
                    destination = %summary.destination,
                    bytes_read = summary.bytes_read,
                    bytes_uploaded = summary.bytes_uploaded,
                    elapsed_ms = summary.elapsed.as_millis() as u64,
                    "export completed"
                );
            }
            Ok(ExportOutcome::Declined) => self.transition(ExportPhase::Declined),
            Err(err) => {
                tracing::error!(phase = %self.phase, error = %err, "export failed");
                self.failed_during = Some(self.phase);
                self.transition(ExportPhase::Failed);
            }
        }
        result
    }

    fn drive<D, S, F>(
        &mut self,
        mut device: D,
        store: &S,
        confirm: Option<&mut dyn Confirm>,
        on_progress: F,
        started: Instant,
    ) -> Result<ExportOutcome>
    where
        D: Read + DiskSizeProbe,
        S: ObjectStore,
        F: FnMut(String) + Send + 'static,
    {
        self.transition(ExportPhase::Probing);
        let disk_size = device.disk_size()?;
        tracing::info!(device = %self.request.device().display(), disk_size, "probed device");

        let destination = self.request.destination().clone();
        if self.request.confirm() {
            self.transition(ExportPhase::Confirming);
            let gate = confirm.ok_or_else(|| {
                Error::config("confirmation is required but no prompt is available")
            })?;
            if !gate.confirm(&destination, disk_size)? {
                tracing::info!(destination = %destination, "export declined");
                return Ok(ExportOutcome::Declined);
            }
        }

        if self.cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let sink = store.create(&destination)?;
        self.transition(ExportPhase::Streaming);

        let reporter = self.progress_interval.map(|interval| {
            ProgressReporter::spawn(
                self.read.clone(),
                self.uploaded.clone(),
                disk_size,
                interval,
                on_progress,
            )
        });
        let result = self.stream(device, sink, disk_size);
        if let Some(reporter) = reporter {
            reporter.stop();
        }
        let manifest_included = result?;

        Ok(ExportOutcome::Completed(ExportSummary {
            destination,
            disk_size,
            bytes_read: self.read.get(),
            bytes_uploaded: self.uploaded.get(),
            manifest_included,
            elapsed: started.elapsed(),
        }))
    }

    /// Stream the entries and close every layer. Returns whether a manifest was written.
    fn stream<D: Read, K: UploadSink>(
        &mut self,
        device: D,
        sink: K,
        disk_size: u64,
    ) -> Result<bool> {
        let upload = CountingWriter::new(sink, self.uploaded.clone());
        let compressor = CompressionStage::new(upload, self.request.level());
        let mut archive = ArchiveBuilder::new(compressor);
        let reader = CountingReader::new(
            BufReader::with_capacity(READ_BUFFER_SIZE, device),
            self.read.clone(),
            self.cancel.clone(),
        );

        let licenses = self.request.licenses().to_vec();
        let written = (|| -> io::Result<()> {
            if !licenses.is_empty() {
                let len = archive.append_manifest(&licenses)?;
                tracing::debug!(
                    licenses = licenses.len(),
                    manifest_len = len,
                    "wrote manifest entry"
                );
            }
            archive.append_disk(reader, disk_size)
        })();

        if let Err(err) = written {
            abandon(archive);
            if is_cancellation(&err) {
                return Err(Error::Cancelled);
            }
            return Err(attribute(Stage::Archive, err));
        }

        self.transition(ExportPhase::Finalizing);
        finalize(archive)?;
        Ok(!licenses.is_empty())
    }

    fn reset(&mut self) {
        self.read = ByteCounter::new();
        self.uploaded = ByteCounter::new();
        self.failed_during = None;
        self.phase = ExportPhase::Idle;
    }

    fn transition(&mut self, next: ExportPhase) {
        tracing::debug!(from = %self.phase, to = %next, "export phase");
        self.phase = next;
    }
}

/// The ordered record of stages closed so far.
#[derive(Debug, Default)]
struct CloseLog {
    closed: Vec<Stage>,
}

impl CloseLog {
    /// Close one stage. On failure the error lists every stage closed before it, and
    /// the caller's `?` skips the remaining closes.
    fn close<T>(&mut self, stage: Stage, close: impl FnOnce() -> io::Result<T>) -> Result<T> {
        match close() {
            Ok(inner) => {
                tracing::debug!(%stage, "closed stage");
                self.closed.push(stage);
                Ok(inner)
            }
            Err(err) => Err(match attribute(stage, err) {
                Error::Stream { stage, source, .. } => Error::Stream {
                    stage,
                    closed: self.closed.clone(),
                    source,
                },
                other => other,
            }),
        }
    }
}

/// Close archive, compressor and sink, strictly in that order.
fn finalize<S: UploadSink>(archive: ExportStream<S>) -> Result<()> {
    let mut log = CloseLog::default();
    let compressor = log.close(Stage::Archive, || archive.finish())?;
    let upload = log.close(Stage::Compressor, || compressor.finish())?;
    let sink = upload.into_inner();
    log.close(Stage::Sink, || sink.commit())?;
    Ok(())
}

/// Unwind a failed stream in the same inside-out order, then abort the sink so that
/// nothing gets committed.
fn abandon<S: UploadSink>(archive: ExportStream<S>) {
    match archive
        .finish()
        .and_then(CompressionStage::finish)
        .map(CountingWriter::into_inner)
    {
        Ok(sink) => sink.abort(),
        Err(err) => tracing::debug!(error = %err, "dropping sink after failed unwind"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Cursor, Write};
    use std::sync::Mutex;

    /// A sink that records what happened to it.
    #[derive(Clone, Default)]
    struct Recorder {
        events: Arc<Mutex<Vec<&'static str>>>,
        fail_commit: bool,
    }

    struct RecordingSink {
        recorder: Recorder,
    }

    impl Write for RecordingSink {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl UploadSink for RecordingSink {
        fn commit(self) -> io::Result<()> {
            self.recorder.events.lock().unwrap().push("commit");
            if self.recorder.fail_commit {
                return Err(io::Error::other("precondition failed"));
            }
            Ok(())
        }

        fn abort(self) {
            self.recorder.events.lock().unwrap().push("abort");
        }
    }

    impl ObjectStore for Recorder {
        type Sink = RecordingSink;

        fn create(&self, _path: &ObjectPath) -> Result<RecordingSink> {
            self.events.lock().unwrap().push("create");
            Ok(RecordingSink {
                recorder: self.clone(),
            })
        }
    }

    fn request(confirm: bool) -> ExportRequest {
        ExportRequest::new("/dev/test", "gs://bucket/disk.tar.gz", vec![], 1, confirm).unwrap()
    }

    #[test]
    fn test_completed_export_commits_once() {
        let store = Recorder::default();
        let mut exporter = Exporter::new(request(false)).with_progress_interval(None);

        let outcome = exporter
            .run(Cursor::new(vec![0u8; 4096]), &store, None, |_| {})
            .unwrap();

        assert!(matches!(outcome, ExportOutcome::Completed(_)));
        assert_eq!(exporter.phase(), ExportPhase::Completed);
        assert_eq!(exporter.bytes_read(), 4096);
        assert_eq!(*store.events.lock().unwrap(), ["create", "commit"]);
    }

    #[test]
    fn test_commit_failure_reports_closed_stages() {
        let store = Recorder {
            fail_commit: true,
            ..Recorder::default()
        };
        let mut exporter = Exporter::new(request(false)).with_progress_interval(None);

        let err = exporter
            .run(Cursor::new(vec![1u8; 100]), &store, None, |_| {})
            .unwrap_err();

        match err {
            Error::Stream { stage, closed, .. } => {
                assert_eq!(stage, Stage::Sink);
                assert_eq!(closed, [Stage::Archive, Stage::Compressor]);
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(exporter.phase(), ExportPhase::Failed);
        assert_eq!(exporter.failed_during(), Some(ExportPhase::Finalizing));
    }

    #[test]
    fn test_confirmation_required_without_prompt_fails_before_sink() {
        let store = Recorder::default();
        let mut exporter = Exporter::new(request(true)).with_progress_interval(None);

        let err = exporter
            .run(Cursor::new(vec![0u8; 10]), &store, None, |_| {})
            .unwrap_err();

        assert!(matches!(err, Error::Config { .. }));
        assert!(store.events.lock().unwrap().is_empty());
    }

    #[test]
    fn test_cancel_before_streaming_opens_nothing() {
        let store = Recorder::default();
        let cancel = CancelToken::new();
        cancel.cancel();
        let mut exporter = Exporter::new(request(false))
            .with_cancel_token(cancel)
            .with_progress_interval(None);

        let err = exporter
            .run(Cursor::new(vec![0u8; 10]), &store, None, |_| {})
            .unwrap_err();

        assert!(matches!(err, Error::Cancelled));
        assert!(store.events.lock().unwrap().is_empty());
    }

    /// A device that cancels the export after its first read.
    struct CancellingDevice {
        inner: Cursor<Vec<u8>>,
        cancel: CancelToken,
    }

    impl Read for CancellingDevice {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            let n = self.inner.read(buf)?;
            self.cancel.cancel();
            Ok(n)
        }
    }

    impl DiskSizeProbe for CancellingDevice {
        fn disk_size(&mut self) -> Result<u64> {
            self.inner.disk_size()
        }
    }

    #[test]
    fn test_cancel_mid_stream_aborts_sink() {
        let store = Recorder::default();
        let cancel = CancelToken::new();
        let device = CancellingDevice {
            inner: Cursor::new(vec![3u8; 1024 * 1024]),
            cancel: cancel.clone(),
        };
        let mut exporter = Exporter::new(request(false))
            .with_cancel_token(cancel)
            .with_progress_interval(None);

        let err = exporter.run(device, &store, None, |_| {}).unwrap_err();

        assert!(matches!(err, Error::Cancelled));
        assert_eq!(*store.events.lock().unwrap(), ["create", "abort"]);
        assert!(exporter.bytes_read() < 1024 * 1024);
    }

    /// A device that fails while a cancel request arrives at the same moment.
    struct FailingDevice {
        cancel: CancelToken,
    }

    impl Read for FailingDevice {
        fn read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
            self.cancel.cancel();
            Err(io::Error::other("medium error"))
        }
    }

    impl DiskSizeProbe for FailingDevice {
        fn disk_size(&mut self) -> Result<u64> {
            Ok(4096)
        }
    }

    #[test]
    fn test_device_error_during_cancel_keeps_its_stage() {
        let store = Recorder::default();
        let cancel = CancelToken::new();
        let device = FailingDevice {
            cancel: cancel.clone(),
        };
        let mut exporter = Exporter::new(request(false))
            .with_cancel_token(cancel)
            .with_progress_interval(None);

        let err = exporter.run(device, &store, None, |_| {}).unwrap_err();

        assert_eq!(err.stage(), Some(Stage::Device));
        assert!(err.to_string().contains("medium error"));
        assert_eq!(*store.events.lock().unwrap(), ["create", "abort"]);
    }

    #[test]
    fn test_second_run_starts_from_zero() {
        let store = Recorder::default();
        let mut exporter = Exporter::new(request(false)).with_progress_interval(None);

        for _ in 0..2 {
            let outcome = exporter
                .run(Cursor::new(vec![8u8; 1000]), &store, None, |_| {})
                .unwrap();
            let ExportOutcome::Completed(summary) = outcome else {
                panic!("export did not complete");
            };
            assert_eq!(summary.disk_size, 1000);
            assert_eq!(summary.bytes_read, 1000);
            assert_eq!(exporter.bytes_read(), 1000);
        }
        assert_eq!(exporter.phase(), ExportPhase::Completed);
    }

    #[test]
    fn test_failure_is_cleared_by_next_run() {
        let store = Recorder::default();
        let mut exporter = Exporter::new(request(true)).with_progress_interval(None);

        exporter
            .run(Cursor::new(vec![0u8; 10]), &store, None, |_| {})
            .unwrap_err();
        assert_eq!(exporter.failed_during(), Some(ExportPhase::Confirming));

        let mut prompt = crate::LinePrompt::new(&b"y\n"[..], Vec::new());
        exporter
            .run(Cursor::new(vec![0u8; 10]), &store, Some(&mut prompt), |_| {})
            .unwrap();
        assert_eq!(exporter.failed_during(), None);
        assert_eq!(exporter.phase(), ExportPhase::Completed);
    }
}
