//! Progress notifications for scan operations
//!
//! The worker thread never calls observer code directly. It queues
//! `ScanNotification`s into a bounded channel; the application drains the
//! receiver on a thread of its choice, for example through `ProgressReporter`
//! which writes them as JSON lines to stderr.

use crossbeam_channel::{Receiver, Sender, TrySendError};
use serde::Serialize;
use std::io::Write;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Asynchronous notification emitted by the worker or the scanning engine
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "_t", rename_all = "snake_case")]
pub enum ScanNotification {
    DatabaseInitialized { success: bool },
    InitializationProgress { message: String, steps: u32 },
    MoreSchemaUpdateSteps { steps: u32 },
    InitializationError { message: String },
    CompleteScanStarted,
    TotalFilesToScan { count: u64 },
    StartScanningAlbumRoot { root: PathBuf },
    StartScanningAlbum { root: PathBuf, album: String },
    ScannedFiles { count: u64 },
    StartScanningForStaleAlbums,
    CollectionScanStarted,
    CompleteScanDone,
    CollectionScanFinished,
    CompleteScanCanceled,
    PartialScanDone { path: PathBuf },
    UniqueHashUpdated,
    ScanFailed { task: String, message: String },
}

impl ScanNotification {
    pub fn is_error(&self) -> bool {
        matches!(
            self,
            ScanNotification::InitializationError { .. } | ScanNotification::ScanFailed { .. }
        )
    }
}

/// Sending half handed to the worker and the engines
#[derive(Debug, Clone)]
pub struct NotificationSender {
    tx: Sender<ScanNotification>,
}

impl NotificationSender {
    pub fn new(tx: Sender<ScanNotification>) -> Self {
        Self { tx }
    }

    /// Create a bounded channel
    pub fn channel(capacity: usize) -> (Self, Receiver<ScanNotification>) {
        let (tx, rx) = crossbeam_channel::bounded(capacity.max(1));
        (Self { tx }, rx)
    }

    /// Queue a notification without blocking; dropped if nobody keeps up
    pub fn send(&self, notification: ScanNotification) {
        match self.tx.try_send(notification) {
            Ok(()) => {}
            Err(TrySendError::Full(n)) => log::trace!("Notification channel full, dropped {:?}", n),
            Err(TrySendError::Disconnected(_)) => {}
        }
    }
}

/// Envelope written by the reporter
#[derive(Debug, Serialize)]
struct Envelope<'a> {
    seq: u64,
    ts: u64,
    #[serde(flatten)]
    notification: &'a ScanNotification,
}

/// Writes notifications as JSON lines to stderr
///
/// Per-file progress is rate limited; every other notification is written
/// immediately.
pub struct ProgressReporter {
    /// Whether progress reporting is enabled
    enabled: bool,
    /// Minimum interval between `ScannedFiles` lines in milliseconds
    interval_ms: u64,
    last_report: std::cell::Cell<Option<Instant>>,
    /// Sequence number for messages
    seq: AtomicU64,
    start_time: Instant,
    scanned_files: std::cell::Cell<u64>,
}

impl ProgressReporter {
    pub fn new(enabled: bool, interval_ms: u64) -> Self {
        Self {
            enabled,
            interval_ms,
            last_report: std::cell::Cell::new(None),
            seq: AtomicU64::new(0),
            start_time: Instant::now(),
            scanned_files: std::cell::Cell::new(0),
        }
    }

    /// Check if enough time has passed since the last progress line
    pub fn should_report(&self) -> bool {
        if !self.enabled {
            return false;
        }
        match self.last_report.get() {
            None => true,
            Some(last) => last.elapsed().as_millis() as u64 >= self.interval_ms,
        }
    }

    /// Get the next sequence number (monotonically increasing)
    pub fn next_seq(&self) -> u64 {
        self.seq.fetch_add(1, Ordering::SeqCst)
    }

    /// Milliseconds since reporter creation
    pub fn current_timestamp(&self) -> u64 {
        self.start_time.elapsed().as_millis() as u64
    }

    /// Files counted by `ScannedFiles` notifications so far
    pub fn scanned_files(&self) -> u64 {
        self.scanned_files.get()
    }

    /// Render a notification, or `None` if it is filtered out
    pub fn render(&self, notification: &ScanNotification) -> Option<String> {
        if !self.enabled {
            return None;
        }
        if let ScanNotification::ScannedFiles { count } = notification {
            self.scanned_files.set(self.scanned_files.get() + count);
            if !self.should_report() {
                return None;
            }
            self.last_report.set(Some(Instant::now()));
        }
        let envelope = Envelope {
            seq: self.next_seq(),
            ts: self.current_timestamp(),
            notification,
        };
        serde_json::to_string(&envelope).ok()
    }

    pub fn report(&self, notification: &ScanNotification) {
        if let Some(json) = self.render(notification) {
            eprintln!("{}", json);
            std::io::stderr().flush().ok();
        }
    }

    /// Report every notification until all senders are gone
    pub fn drain(&self, rx: &Receiver<ScanNotification>) {
        for notification in rx.iter() {
            self.report(&notification);
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_notification_serialization() {
        let json = serde_json::to_string(&ScanNotification::StartScanningAlbum {
            root: PathBuf::from("/photos"),
            album: "/Trips".to_string(),
        })
        .unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed["_t"], "start_scanning_album");
        assert_eq!(parsed["root"], "/photos");
        assert_eq!(parsed["album"], "/Trips");

        let json = serde_json::to_string(&ScanNotification::CompleteScanDone).unwrap();
        assert_eq!(json, r#"{"_t":"complete_scan_done"}"#);
    }

    #[test]
    fn test_render_envelope() {
        let reporter = ProgressReporter::new(true, 200);
        let line = reporter
            .render(&ScanNotification::ScanFailed {
                task: "partial_scan".to_string(),
                message: "boom".to_string(),
            })
            .unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&line).unwrap();
        assert_eq!(parsed["_t"], "scan_failed");
        assert_eq!(parsed["seq"], 0);
        assert_eq!(parsed["task"], "partial_scan");
        assert!(parsed["ts"].is_u64());
    }

    #[test]
    fn test_scanned_files_rate_limited_but_counted() {
        let reporter = ProgressReporter::new(true, 60_000);
        assert!(reporter
            .render(&ScanNotification::ScannedFiles { count: 3 })
            .is_some());
        assert!(reporter
            .render(&ScanNotification::ScannedFiles { count: 4 })
            .is_none());
        assert_eq!(reporter.scanned_files(), 7);

        // other kinds are never throttled
        assert!(reporter
            .render(&ScanNotification::CompleteScanDone)
            .is_some());
    }

    #[test]
    fn test_disabled_reporter_renders_nothing() {
        let reporter = ProgressReporter::new(false, 0);
        assert!(!reporter.is_enabled());
        assert!(reporter
            .render(&ScanNotification::CompleteScanStarted)
            .is_none());
        assert_eq!(reporter.next_seq(), 0);
    }

    #[test]
    fn test_full_channel_drops_instead_of_blocking() {
        let (sender, rx) = NotificationSender::channel(1);
        sender.send(ScanNotification::CompleteScanStarted);
        sender.send(ScanNotification::CompleteScanDone);

        assert_eq!(rx.try_recv(), Ok(ScanNotification::CompleteScanStarted));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_send_after_receiver_dropped() {
        let (sender, rx) = NotificationSender::channel(4);
        drop(rx);
        sender.send(ScanNotification::CompleteScanDone);
    }

    #[test]
    fn test_is_error() {
        assert!(ScanNotification::InitializationError {
            message: String::new()
        }
        .is_error());
        assert!(!ScanNotification::UniqueHashUpdated.is_error());
    }
}
