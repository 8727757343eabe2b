//! The background thread that runs all scanning work, one task at a time

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::coordinator::{InitOutcome, Shared};
use crate::engine::{
    EngineFactory, FlagObserver, InitializationObserver, ScanEngine, ScanObserver,
    SchemaUpdateResult,
};
use crate::error::{ScanError, ScanErrorKind};
use crate::progress::ScanNotification;
use crate::task_queue::{ScanTask, ScanTaskQueue};

/// Forwards schema-updater progress as notifications
struct WorkerInitObserver<'a> {
    shared: &'a Shared,
    flag: FlagObserver,
}

impl ScanObserver for WorkerInitObserver<'_> {
    fn continue_query(&self) -> bool {
        self.flag.continue_query()
    }
}

impl InitializationObserver for WorkerInitObserver<'_> {
    fn more_schema_update_steps(&self, steps: u32) {
        self.shared
            .notifications
            .send(ScanNotification::MoreSchemaUpdateSteps { steps });
    }

    fn schema_update_progress(&self, message: &str, steps: u32) {
        self.shared
            .notifications
            .send(ScanNotification::InitializationProgress {
                message: message.to_string(),
                steps,
            });
    }

    fn error(&self, message: &str) {
        log::error!("Database initialization: {}", message);
        self.shared
            .notifications
            .send(ScanNotification::InitializationError {
                message: message.to_string(),
            });
    }
}

pub(crate) struct ScanWorker {
    shared: Arc<Shared>,
    factory: Arc<dyn EngineFactory>,
}

impl ScanWorker {
    pub(crate) fn spawn(
        shared: Arc<Shared>,
        factory: Arc<dyn EngineFactory>,
    ) -> Result<JoinHandle<()>, ScanError> {
        let worker = ScanWorker { shared, factory };
        std::thread::Builder::new()
            .name("scan-worker".into())
            .spawn(move || worker.run())
            .map_err(|e| ScanError::io_error(None, format!("Cannot start scan worker: {}", e)))
    }

    fn run(&self) {
        log::debug!("Scan worker started");
        while let Some(task) = self.next_task() {
            log::debug!("Running {}", task.name());
            let name = task.name();
            let outcome = catch_unwind(AssertUnwindSafe(|| self.execute(task)));
            if outcome.is_err() {
                // the task's bookkeeping may be incomplete; release everyone waiting on it
                log::error!("Scan task {} panicked", name);
                self.shared.notifications.send(ScanNotification::ScanFailed {
                    task: name.to_string(),
                    message: "task panicked".to_string(),
                });
                self.recover_after_panic();
            }
            log::debug!("Finished {}", name);
        }
        log::debug!("Scan worker stopped");
    }

    /// Block until a task is runnable; `None` once the coordinator shuts down
    fn next_task(&self) -> Option<ScanTask> {
        let mut queue = self.shared.queue.lock();
        loop {
            if !queue.running {
                queue.idle = true;
                self.shared.done_cv.notify_all();
                return None;
            }
            if let Some(task) = queue.next_task(Instant::now()) {
                // armed under the lock so a cancel issued from now on is seen by the task
                self.continue_flag(&task).store(true, Ordering::SeqCst);
                return Some(task);
            }

            queue.idle = true;
            self.shared.done_cv.notify_all();
            match self.idle_timeout(&queue) {
                Some(timeout) => {
                    self.shared.work_cv.wait_for(&mut queue, timeout);
                }
                None => self.shared.work_cv.wait(&mut queue),
            }
            // still idle: nothing ran while waiting
            self.shared.hints.collect_garbage(true);
            queue.idle = false;
        }
    }

    fn continue_flag(&self, task: &ScanTask) -> &Arc<AtomicBool> {
        match task {
            ScanTask::Initialize => &self.shared.continue_init,
            ScanTask::CompleteScan { .. } | ScanTask::FinishDeferred(_) => {
                &self.shared.continue_scan
            }
            ScanTask::UpdateUniqueHash => &self.shared.continue_hash_update,
            ScanTask::PartialScan(_) => &self.shared.continue_partial_scan,
        }
    }

    /// Wake up for a pending debounce deadline or for hint expiry
    fn idle_timeout(&self, queue: &ScanTaskQueue) -> Option<Duration> {
        let now = Instant::now();
        let debounce = queue
            .debounce_deadline
            .filter(|_| queue.scoped_len() > 0 && !queue.is_suspended())
            .map(|deadline| deadline.saturating_duration_since(now));
        let expiry = self.shared.hints.expires_in(now);
        match (debounce, expiry) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    fn execute(&self, task: ScanTask) {
        match task {
            ScanTask::Initialize => self.run_initialization(),
            ScanTask::CompleteScan {
                defer_file_scanning,
            } => self.run_complete_scan(defer_file_scanning),
            ScanTask::UpdateUniqueHash => self.run_unique_hash_update(),
            ScanTask::FinishDeferred(albums) => self.run_finish_scan(&albums),
            ScanTask::PartialScan(path) => self.run_partial_scan(&path),
        }
    }

    fn recover_after_panic(&self) {
        let mut queue = self.shared.queue.lock();
        queue.init_runs.finish();
        queue.scan_runs.finish();
        queue.hash_runs.finish();
        queue.deferred_albums.clear();
        self.shared.done_cv.notify_all();
    }

    fn report_failure(&self, task: &str, err: &ScanError) {
        if err.kind == ScanErrorKind::Cancelled {
            log::info!("Scan task {} was cancelled", task);
            return;
        }
        log::error!("Scan task {} failed: {}", task, err);
        self.shared.notifications.send(ScanNotification::ScanFailed {
            task: task.to_string(),
            message: err.to_string(),
        });
    }

    /// Fresh engine wired to the shared hints and the given continue flag
    fn prepare_engine(
        &self,
        flag: &Arc<AtomicBool>,
        with_progress: bool,
    ) -> Result<Box<dyn ScanEngine>, ScanError> {
        let mut engine = self.factory.create_engine()?;
        engine.set_hint_container(Arc::clone(&self.shared.hints));
        engine.set_observer(Arc::new(FlagObserver::new(flag)));
        if with_progress {
            engine.set_notifications(self.shared.notifications.clone());
            engine.set_need_file_count(true);
        }
        Ok(engine)
    }

    fn run_initialization(&self) {
        let observer = WorkerInitObserver {
            shared: &self.shared,
            flag: FlagObserver::new(&self.shared.continue_init),
        };
        let result = self
            .factory
            .create_schema_updater()
            .and_then(|mut updater| updater.update_schema(&observer));

        let outcome = match result {
            Ok(SchemaUpdateResult::Success) => InitOutcome::Success,
            Ok(SchemaUpdateResult::RecoverableError) => InitOutcome::ContinueDegraded,
            Ok(SchemaUpdateResult::FatalError) => InitOutcome::AbortImmediately,
            Err(err) if err.is_cancelled() => {
                log::info!("Database initialization was cancelled");
                InitOutcome::ContinueDegraded
            }
            Err(err) => {
                observer.error(&err.message);
                InitOutcome::ContinueDegraded
            }
        };
        log::info!("Database initialization finished: {:?}", outcome);

        // queued before the blocked caller is released
        self.shared
            .notifications
            .send(ScanNotification::DatabaseInitialized {
                success: outcome == InitOutcome::Success,
            });
        {
            let mut queue = self.shared.queue.lock();
            queue.advice = outcome;
            queue.init_runs.finish();
        }
        self.shared.done_cv.notify_all();
    }

    fn run_complete_scan(&self, defer_file_scanning: bool) {
        let result = self
            .prepare_engine(&self.shared.continue_scan, true)
            .and_then(|mut engine| {
                engine.set_deferred_file_scanning(defer_file_scanning);
                engine.complete_scan()?;
                Ok(engine.deferred_album_paths())
            });

        let deferred = match result {
            Ok(deferred) => deferred,
            Err(err) => {
                self.report_failure("complete_scan", &err);
                Vec::new()
            }
        };

        self.shared
            .notifications
            .send(ScanNotification::CompleteScanDone);
        {
            let mut queue = self.shared.queue.lock();
            if defer_file_scanning {
                log::debug!("{} albums deferred to the finish pass", deferred.len());
                queue.deferred_albums = deferred;
                queue.finish_scan_allowed = false;
            }
            queue.scan_runs.finish();
        }
        self.shared.done_cv.notify_all();
    }

    fn run_unique_hash_update(&self) {
        let observer = WorkerInitObserver {
            shared: &self.shared,
            flag: FlagObserver::new(&self.shared.continue_hash_update),
        };
        let result = self
            .factory
            .create_schema_updater()
            .and_then(|mut updater| updater.update_unique_hash(&observer));
        if let Err(err) = &result {
            self.report_failure("update_unique_hash", err);
        }

        self.shared
            .notifications
            .send(ScanNotification::UniqueHashUpdated);
        self.shared.queue.lock().hash_runs.finish();
        self.shared.done_cv.notify_all();
    }

    fn run_finish_scan(&self, albums: &[PathBuf]) {
        self.shared
            .notifications
            .send(ScanNotification::CollectionScanStarted);

        let result = self
            .prepare_engine(&self.shared.continue_scan, true)
            .and_then(|mut engine| engine.finish_complete_scan(albums));
        if let Err(err) = &result {
            self.report_failure("finish_deferred", err);
        }

        self.shared
            .notifications
            .send(ScanNotification::CompleteScanDone);
        self.shared
            .notifications
            .send(ScanNotification::CollectionScanFinished);
        self.shared.queue.lock().deferred_albums.clear();
        self.shared.done_cv.notify_all();
    }

    fn run_partial_scan(&self, path: &Path) {
        let result = self
            .prepare_engine(&self.shared.continue_partial_scan, false)
            .and_then(|mut engine| engine.partial_scan(path));
        if let Err(err) = &result {
            self.report_failure("partial_scan", &err.clone().with_path(path));
        }

        self.shared
            .notifications
            .send(ScanNotification::PartialScanDone {
                path: path.to_path_buf(),
            });
        self.shared.done_cv.notify_all();
    }
}
