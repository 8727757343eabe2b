//! Shared scan task state, guarded by the coordinator's mutex
//!
//! The queue holds flags rather than messages: requesting the same kind of
//! task twice before the worker picks it up results in a single run.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::time::Instant;

use crate::coordinator::InitOutcome;

/// One unit of work selected by the worker
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanTask {
    /// Database readiness and schema update
    Initialize,
    /// Full collection scan, optionally deferring the file pass of new files
    CompleteScan { defer_file_scanning: bool },
    /// Unique hash recomputation
    UpdateUniqueHash,
    /// File pass over the albums left by a deferred complete scan
    FinishDeferred(Vec<PathBuf>),
    /// Scan restricted to one path
    PartialScan(PathBuf),
}

impl ScanTask {
    /// Short name used in logs and notifications
    pub fn name(&self) -> &'static str {
        match self {
            ScanTask::Initialize => "initialize",
            ScanTask::CompleteScan { .. } => "complete_scan",
            ScanTask::UpdateUniqueHash => "update_unique_hash",
            ScanTask::FinishDeferred(_) => "finish_deferred",
            ScanTask::PartialScan(_) => "partial_scan",
        }
    }
}

/// Start/finish counters of one blocking task kind.
///
/// A caller receives the number of the run that will serve its request; the
/// request is settled once that run finished, or once the pending flag was
/// cleared before that run started (cancellation).
#[derive(Debug, Default, Clone, Copy)]
pub struct CompletionCounter {
    started: u64,
    finished: u64,
}

impl CompletionCounter {
    /// Run number that will serve a request made now
    pub fn ticket(&self) -> u64 {
        self.started + 1
    }

    pub fn start(&mut self) {
        self.started += 1;
    }

    pub fn finish(&mut self) {
        self.finished = self.started;
    }

    pub fn settled(&self, ticket: u64, still_pending: bool) -> bool {
        self.served(ticket) || (!still_pending && self.started < ticket)
    }

    /// Whether a run serving `ticket` completed
    pub fn served(&self, ticket: u64) -> bool {
        self.finished >= ticket
    }
}

#[derive(Debug)]
pub struct ScanTaskQueue {
    pub needs_init: bool,
    pub needs_full_scan: bool,
    pub defer_file_scanning: bool,
    pub needs_unique_hash_update: bool,
    scoped_paths: VecDeque<PathBuf>,
    pub deferred_albums: Vec<PathBuf>,
    pub finish_scan_allowed: bool,
    pub suspend_depth: u32,
    pub idle: bool,
    /// Scoped scans wait until this instant when set by a debounced request
    pub debounce_deadline: Option<Instant>,
    pub running: bool,
    pub init_runs: CompletionCounter,
    pub scan_runs: CompletionCounter,
    pub hash_runs: CompletionCounter,
    pub advice: InitOutcome,
}

impl Default for ScanTaskQueue {
    fn default() -> Self {
        Self {
            needs_init: false,
            needs_full_scan: false,
            defer_file_scanning: false,
            needs_unique_hash_update: false,
            scoped_paths: VecDeque::new(),
            deferred_albums: Vec::new(),
            finish_scan_allowed: true,
            suspend_depth: 0,
            idle: false,
            debounce_deadline: None,
            running: true,
            init_runs: CompletionCounter::default(),
            scan_runs: CompletionCounter::default(),
            hash_runs: CompletionCounter::default(),
            advice: InitOutcome::Success,
        }
    }
}

impl ScanTaskQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a scoped path unless it is already queued. Returns whether it was added.
    pub fn push_scoped(&mut self, path: &Path) -> bool {
        if self.scoped_paths.iter().any(|p| p == path) {
            return false;
        }
        self.scoped_paths.push_back(path.to_path_buf());
        true
    }

    pub fn scoped_paths(&self) -> impl Iterator<Item = &PathBuf> {
        self.scoped_paths.iter()
    }

    pub fn scoped_len(&self) -> usize {
        self.scoped_paths.len()
    }

    pub fn is_suspended(&self) -> bool {
        self.suspend_depth > 0
    }

    pub fn suspend(&mut self) {
        self.suspend_depth += 1;
    }

    /// Decrement the suspend depth. Returns true when scanning became allowed again.
    pub fn resume(&mut self) -> bool {
        if self.suspend_depth > 0 {
            self.suspend_depth -= 1;
        }
        self.suspend_depth == 0
    }

    pub fn request_init(&mut self) -> u64 {
        self.needs_init = true;
        self.init_runs.ticket()
    }

    pub fn request_full_scan(&mut self, defer_file_scanning: bool) -> u64 {
        self.needs_full_scan = true;
        self.defer_file_scanning = defer_file_scanning;
        self.scan_runs.ticket()
    }

    pub fn request_unique_hash_update(&mut self) -> u64 {
        self.needs_unique_hash_update = true;
        self.hash_runs.ticket()
    }

    /// Drop every pending request and suspend scanning
    pub fn cancel_all(&mut self) {
        self.needs_init = false;
        self.needs_full_scan = false;
        self.needs_unique_hash_update = false;
        self.scoped_paths.clear();
        self.debounce_deadline = None;
        self.suspend();
    }

    fn deferred_runnable(&self) -> bool {
        !self.deferred_albums.is_empty() && self.finish_scan_allowed && !self.is_suspended()
    }

    fn debounce_elapsed(&self, now: Instant) -> bool {
        self.debounce_deadline.map_or(true, |deadline| now >= deadline)
    }

    /// Pop the highest-priority runnable task, first match wins
    pub fn next_task(&mut self, now: Instant) -> Option<ScanTask> {
        if self.needs_init {
            self.needs_init = false;
            self.init_runs.start();
            return Some(ScanTask::Initialize);
        }
        if self.needs_full_scan {
            self.needs_full_scan = false;
            self.scan_runs.start();
            return Some(ScanTask::CompleteScan {
                defer_file_scanning: self.defer_file_scanning,
            });
        }
        if self.needs_unique_hash_update {
            self.needs_unique_hash_update = false;
            self.hash_runs.start();
            return Some(ScanTask::UpdateUniqueHash);
        }
        if self.deferred_runnable() {
            return Some(ScanTask::FinishDeferred(self.deferred_albums.clone()));
        }
        if !self.scoped_paths.is_empty() && !self.is_suspended() && self.debounce_elapsed(now) {
            self.debounce_deadline = None;
            return self.scoped_paths.pop_front().map(ScanTask::PartialScan);
        }
        None
    }

    /// Whether work is queued that the worker will run without further calls
    pub fn has_pending_work(&self) -> bool {
        self.needs_init
            || self.needs_full_scan
            || self.needs_unique_hash_update
            || self.deferred_runnable()
            || (!self.scoped_paths.is_empty() && !self.is_suspended())
    }
}
