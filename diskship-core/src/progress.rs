//! Periodic throughput reporting for a running export.
//!
//! The reporter lives on its own thread and only ever loads the two shared
//! [`ByteCounter`]s, so it can neither block nor corrupt the transfer.
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{RecvTimeoutError, Sender, bounded};
use indicatif::HumanBytes;

use crate::counter::ByteCounter;

/// Default time between two progress lines.
pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(1);

/// A point-in-time reading of both counters.
#[derive(Debug, Clone, Copy)]
pub struct ProgressSample {
    pub at: Instant,
    pub read: u64,
    pub uploaded: u64,
}

impl ProgressSample {
    pub fn take(read: &ByteCounter, uploaded: &ByteCounter) -> Self {
        Self {
            at: Instant::now(),
            read: read.get(),
            uploaded: uploaded.get(),
        }
    }
}

/// Bytes per second between two totals, or zero when no time has passed.
pub fn rate(previous: u64, current: u64, elapsed: Duration) -> u64 {
    let secs = elapsed.as_secs_f64();
    if secs <= 0.0 {
        return 0;
    }
    (current.saturating_sub(previous) as f64 / secs) as u64
}

/// Render one progress line for the interval between `previous` and `current`.
pub fn format_line(previous: &ProgressSample, current: &ProgressSample, disk_size: u64) -> String {
    let elapsed = current.at.saturating_duration_since(previous.at);
    format!(
        "read {} of {} ({}/sec), total uploaded size: {} ({}/sec)",
        HumanBytes(current.read),
        HumanBytes(disk_size),
        HumanBytes(rate(previous.read, current.read, elapsed)),
        HumanBytes(current.uploaded),
        HumanBytes(rate(previous.uploaded, current.uploaded, elapsed)),
    )
}

/// Handle to the background reporter thread.
pub struct ProgressReporter {
    stop: Sender<()>,
    handle: JoinHandle<()>,
}

impl ProgressReporter {
    /// Start sampling `read` and `uploaded` every `interval`, passing each rendered
    /// line to `on_line`.
    pub fn spawn<F>(
        read: Arc<ByteCounter>,
        uploaded: Arc<ByteCounter>,
        disk_size: u64,
        interval: Duration,
        mut on_line: F,
    ) -> Self
    where
        F: FnMut(String) + Send + 'static,
    {
        let (stop, stopped) = bounded::<()>(1);
        let handle = thread::spawn(move || {
            let mut previous = ProgressSample::take(&read, &uploaded);
            loop {
                match stopped.recv_timeout(interval) {
                    Err(RecvTimeoutError::Timeout) => {}
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                }
                let current = ProgressSample::take(&read, &uploaded);
                on_line(format_line(&previous, &current, disk_size));
                previous = current;
            }
        });

        Self { stop, handle }
    }

    /// Stop the reporter. No final line is guaranteed.
    pub fn stop(self) {
        let _ = self.stop.try_send(());
        if self.handle.join().is_err() {
            tracing::warn!("progress reporter thread panicked");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn test_rate_with_zero_elapsed_is_zero() {
        assert_eq!(rate(0, 1_000_000, Duration::ZERO), 0);
    }

    #[test]
    fn test_rate_over_interval() {
        assert_eq!(rate(1000, 3000, Duration::from_secs(2)), 1000);
        assert_eq!(rate(0, 500, Duration::from_millis(500)), 1000);
    }

    #[test]
    fn test_first_sample_with_zero_elapsed_does_not_fault() {
        let read = ByteCounter::new();
        let uploaded = ByteCounter::new();
        read.add(2048);
        let sample = ProgressSample::take(&read, &uploaded);

        let line = format_line(&sample, &sample, 4096);
        let zero = HumanBytes(0).to_string();
        assert!(line.starts_with(&format!(
            "read {} of {} ({zero}/sec)",
            HumanBytes(2048),
            HumanBytes(4096)
        )));
        assert!(line.ends_with(&format!("total uploaded size: {zero} ({zero}/sec)")));
    }

    #[test]
    fn test_line_format() {
        let start = Instant::now();
        let previous = ProgressSample {
            at: start,
            read: 0,
            uploaded: 0,
        };
        let current = ProgressSample {
            at: start + Duration::from_secs(1),
            read: 1024 * 1024,
            uploaded: 512 * 1024,
        };
        let mib = HumanBytes(1024 * 1024);
        let half = HumanBytes(512 * 1024);
        assert_eq!(
            format_line(&previous, &current, 10 * 1024 * 1024),
            format!(
                "read {mib} of {} ({mib}/sec), total uploaded size: {half} ({half}/sec)",
                HumanBytes(10 * 1024 * 1024)
            )
        );
    }

    #[test]
    fn test_reporter_emits_lines_until_stopped() {
        let read = ByteCounter::new();
        let uploaded = ByteCounter::new();
        let lines = Arc::new(Mutex::new(Vec::new()));
        let sink = lines.clone();

        let reporter = ProgressReporter::spawn(
            read.clone(),
            uploaded.clone(),
            100,
            Duration::from_millis(10),
            move |line| sink.lock().unwrap().push(line),
        );
        read.add(100);
        uploaded.add(40);
        thread::sleep(Duration::from_millis(100));
        reporter.stop();

        let lines = lines.lock().unwrap();
        assert!(!lines.is_empty());
        let last = lines.last().unwrap();
        assert!(last.starts_with(&format!("read {} of {}", HumanBytes(100), HumanBytes(100))));
        assert!(last.contains(&format!("total uploaded size: {} (", HumanBytes(40))));
    }
}
