//! Entry point used by the application thread
//!
//! `ScanCoordinator` turns imperative requests into mutations of the shared
//! `ScanTaskQueue` and wakes the single background worker. Initialization,
//! complete scans and unique-hash updates block the caller until the worker
//! served the request (or the request was cancelled before it started).
//!
//! One coordinator is meant to exist per process; the embedding application
//! is responsible for that.

use crossbeam_channel::Receiver;
use parking_lot::{Condvar, Mutex};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Instant;

use crate::config::CoordinatorConfig;
use crate::engine::EngineFactory;
use crate::error::ScanError;
use crate::hints::{
    hints_for_album_tree, AdjustmentStatus, ChangeKind, Hint, HintCache, ItemChangeHint,
    ItemMoveHint, MetadataAdjustmentHint,
};
use crate::models::{AlbumInfo, AlbumRootId, ItemId, ItemInfo};
use crate::progress::{NotificationSender, ScanNotification};
use crate::task_queue::ScanTaskQueue;
use crate::worker::ScanWorker;

/// Advice returned by `initialize_database`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitOutcome {
    Success,
    /// The catalog is usable with reduced functionality
    ContinueDegraded,
    /// The catalog cannot be used; the application should quit
    AbortImmediately,
}

/// State shared between the coordinator and the worker thread
pub(crate) struct Shared {
    pub(crate) queue: Mutex<ScanTaskQueue>,
    /// Wakes the worker
    pub(crate) work_cv: Condvar,
    /// Signalled by the worker after each task and whenever it goes idle
    pub(crate) done_cv: Condvar,
    pub(crate) hints: Arc<HintCache>,
    pub(crate) continue_init: Arc<AtomicBool>,
    pub(crate) continue_scan: Arc<AtomicBool>,
    pub(crate) continue_hash_update: Arc<AtomicBool>,
    pub(crate) continue_partial_scan: Arc<AtomicBool>,
    pub(crate) notifications: NotificationSender,
}

type FileWatchHook = Box<dyn FnOnce() + Send>;

#[derive(Default)]
struct FileWatch {
    hook: Option<FileWatchHook>,
    installed: bool,
}

pub struct ScanCoordinator {
    shared: Arc<Shared>,
    factory: Arc<dyn EngineFactory>,
    config: CoordinatorConfig,
    receiver: Receiver<ScanNotification>,
    worker: Option<JoinHandle<()>>,
    file_watch: Mutex<FileWatch>,
}

impl ScanCoordinator {
    /// Create the coordinator and start its worker thread
    pub fn new(
        factory: Arc<dyn EngineFactory>,
        config: CoordinatorConfig,
    ) -> Result<Self, ScanError> {
        let (notifications, receiver) = NotificationSender::channel(config.notification_capacity);
        let shared = Arc::new(Shared {
            queue: Mutex::new(ScanTaskQueue::new()),
            work_cv: Condvar::new(),
            done_cv: Condvar::new(),
            hints: Arc::new(HintCache::new(config.hint_quiescence())),
            continue_init: Arc::new(AtomicBool::new(true)),
            continue_scan: Arc::new(AtomicBool::new(true)),
            continue_hash_update: Arc::new(AtomicBool::new(true)),
            continue_partial_scan: Arc::new(AtomicBool::new(true)),
            notifications,
        });
        let worker = ScanWorker::spawn(Arc::clone(&shared), Arc::clone(&factory))?;

        Ok(Self {
            shared,
            factory,
            config,
            receiver,
            worker: Some(worker),
            file_watch: Mutex::new(FileWatch::default()),
        })
    }

    pub fn with_defaults(factory: Arc<dyn EngineFactory>) -> Result<Self, ScanError> {
        Self::new(factory, CoordinatorConfig::default())
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    /// The hint cache shared with every scan
    pub fn hints(&self) -> Arc<HintCache> {
        Arc::clone(&self.shared.hints)
    }

    /// Receiving end of the notification channel.
    /// Clones share one queue; each notification is delivered once.
    pub fn notifications(&self) -> Receiver<ScanNotification> {
        self.receiver.clone()
    }

    /// Runs once, after the first successful `initialize_database`.
    /// Ignored once a file watch was installed.
    pub fn set_file_watch_hook(&self, hook: impl FnOnce() + Send + 'static) {
        let mut watch = self.file_watch.lock();
        if watch.installed {
            log::warn!("File watch is already installed, hook ignored");
            return;
        }
        watch.hook = Some(Box::new(hook));
    }

    fn wake_worker(&self) {
        self.shared.work_cv.notify_one();
    }

    /// Block on `done_cv` until `settled` holds or the worker stopped
    fn wait_until(&self, mut settled: impl FnMut(&ScanTaskQueue) -> bool) {
        let mut queue = self.shared.queue.lock();
        while queue.running && !settled(&queue) {
            self.shared.done_cv.wait(&mut queue);
        }
    }

    /// Prepare the catalog. Blocks until the worker finished the pass.
    pub fn initialize_database(&self) -> InitOutcome {
        let ticket = {
            let mut queue = self.shared.queue.lock();
            let ticket = queue.request_init();
            self.wake_worker();
            ticket
        };
        log::info!("Initializing database");

        let mut served = false;
        let mut outcome = InitOutcome::ContinueDegraded;
        self.wait_until(|queue| {
            if queue.init_runs.settled(ticket, queue.needs_init) {
                served = queue.init_runs.served(ticket);
                outcome = queue.advice;
                true
            } else {
                false
            }
        });

        if !served {
            log::info!("Database initialization was cancelled");
            return InitOutcome::ContinueDegraded;
        }
        if outcome == InitOutcome::Success {
            let hook = {
                let mut watch = self.file_watch.lock();
                let hook = watch.hook.take();
                watch.installed |= hook.is_some();
                hook
            };
            if let Some(hook) = hook {
                log::debug!("Installing file watch");
                hook();
            }
        }
        outcome
    }

    /// Scan the whole collection. Blocks until done or cancelled.
    ///
    /// With `defer_file_scanning` the file pass of new files is postponed
    /// until `allow_deferred_scan` is called.
    pub fn scan_everything(&self, defer_file_scanning: bool) {
        let ticket = {
            let mut queue = self.shared.queue.lock();
            let ticket = queue.request_full_scan(defer_file_scanning);
            self.wake_worker();
            ticket
        };
        log::info!("Complete collection scan requested");
        self.wait_until(|queue| queue.scan_runs.settled(ticket, queue.needs_full_scan));
    }

    /// Recompute the unique hash of every item. Blocks until done.
    pub fn update_unique_hash(&self) {
        let ticket = {
            let mut queue = self.shared.queue.lock();
            let ticket = queue.request_unique_hash_update();
            self.wake_worker();
            ticket
        };
        self.wait_until(|queue| {
            queue
                .hash_runs
                .settled(ticket, queue.needs_unique_hash_update)
        });
    }

    /// Let the worker run the file pass over albums left by a deferred scan
    pub fn allow_deferred_scan(&self) {
        self.shared.queue.lock().finish_scan_allowed = true;
        self.wake_worker();
    }

    /// Queue a scan of `path` and return immediately
    pub fn schedule_scan(&self, path: impl AsRef<Path>) {
        let path = path.as_ref();
        let mut queue = self.shared.queue.lock();
        if queue.push_scoped(path) {
            log::debug!("Scheduled scan of {}", path.display());
        }
        queue.debounce_deadline = None;
        self.wake_worker();
    }

    /// Like `schedule_scan`, but requests arriving within the debounce
    /// interval of the first one are served by a single wake-up
    pub fn schedule_scan_debounced(&self, path: impl AsRef<Path>) {
        let path = path.as_ref();
        let mut queue = self.shared.queue.lock();
        queue.push_scoped(path);
        if queue.debounce_deadline.is_none() {
            queue.debounce_deadline = Some(Instant::now() + self.config.debounce_interval());
            // recompute the idle timeout
            self.wake_worker();
        }
    }

    /// Hold back scoped and deferred scans until the matching `resume`
    pub fn suspend(&self) {
        self.shared.queue.lock().suspend();
    }

    pub fn resume(&self) {
        let mut queue = self.shared.queue.lock();
        if queue.resume() {
            self.wake_worker();
        }
    }

    /// Drop all pending work, suspend, and wait until the running task ended.
    ///
    /// Running passes are asked to stop early. Must be balanced by `resume`.
    pub fn cancel_and_suspend(&self) {
        let mut queue = self.shared.queue.lock();
        queue.cancel_all();
        self.shared.continue_init.store(false, Ordering::SeqCst);
        self.shared.continue_scan.store(false, Ordering::SeqCst);
        self.shared
            .continue_hash_update
            .store(false, Ordering::SeqCst);
        self.shared.continue_partial_scan.store(false, Ordering::SeqCst);
        // cancelled requests release their callers
        self.shared.done_cv.notify_all();

        let poll = self.config.cancel_poll_interval();
        while queue.running && !queue.idle {
            self.shared.done_cv.wait_for(&mut queue, poll);
        }
        log::debug!("Scanning cancelled and suspended");
    }

    pub fn abort_initialization(&self) {
        let mut queue = self.shared.queue.lock();
        queue.needs_init = false;
        self.shared.continue_init.store(false, Ordering::SeqCst);
        self.shared.done_cv.notify_all();
    }

    pub fn cancel_complete_scan(&self) {
        let mut queue = self.shared.queue.lock();
        queue.needs_full_scan = false;
        self.shared.continue_scan.store(false, Ordering::SeqCst);
        self.shared.done_cv.notify_all();
        drop(queue);
        self.shared
            .notifications
            .send(ScanNotification::CompleteScanCanceled);
    }

    /// Block until the worker is idle with nothing runnable queued
    pub fn wait_until_idle(&self) {
        let poll = self.config.cancel_poll_interval();
        let mut queue = self.shared.queue.lock();
        while queue.running && !(queue.idle && !queue.has_pending_work()) {
            self.shared.done_cv.wait_for(&mut queue, poll);
        }
    }

    pub fn is_idle(&self) -> bool {
        self.shared.queue.lock().idle
    }

    pub fn suspend_depth(&self) -> u32 {
        self.shared.queue.lock().suspend_depth
    }

    pub fn pending_scoped_paths(&self) -> Vec<PathBuf> {
        self.shared.queue.lock().scoped_paths().cloned().collect()
    }

    /// Scan one file on the calling thread while background scanning is suspended
    pub fn scan_one_file(&self, path: impl AsRef<Path>) -> Result<ItemId, ScanError> {
        self.suspend();
        let result = self.scanned_item(path);
        self.resume();
        result
    }

    /// Scan one file on the calling thread, concurrently with the worker
    pub fn scanned_item(&self, path: impl AsRef<Path>) -> Result<ItemId, ScanError> {
        let mut engine = self.factory.create_engine()?;
        engine.set_hint_container(self.hints());
        engine.scan_file(path.as_ref())
    }

    /// Announce an in-place metadata write; the returned guard ends it
    pub fn metadata_write(&self, item: &ItemInfo) -> MetadataWriteGuard<'_> {
        MetadataWriteGuard::new(self, item.clone())
    }

    /// Run `write` between the start and end hints of a metadata write
    pub fn with_metadata_write<T, E>(
        &self,
        item: &ItemInfo,
        write: impl FnOnce(&mut MetadataWriteGuard<'_>) -> Result<T, E>,
    ) -> Result<T, E> {
        let mut guard = self.metadata_write(item);
        write(&mut guard)
    }

    /// Record a hint, collecting stale hints first
    pub fn record_hint(&self, hint: impl Into<Hint>) {
        let idle = self.shared.queue.lock().idle;
        self.shared.hints.record_with_gc(hint, idle);
        // the idle worker waits for the new expiry
        self.wake_worker();
    }

    /// Announce that `album` and its `sub_albums` are being moved or copied
    /// below `dst_parent_path` in `dst_root`, optionally under a new name
    pub fn hint_album_move_or_copy(
        &self,
        album: &AlbumInfo,
        sub_albums: &[AlbumInfo],
        dst_root: AlbumRootId,
        dst_parent_path: &str,
        new_name: Option<&str>,
    ) {
        let name = new_name.unwrap_or_else(|| album.title());
        let hints = hints_for_album_tree(album, sub_albums, dst_root, dst_parent_path, name);
        let idle = self.shared.queue.lock().idle;
        self.shared.hints.collect_garbage(idle);
        self.shared.hints.record_all(hints);
        self.wake_worker();
    }

    /// Announce that items are being moved or copied into `dst_album` as `names`
    pub fn hint_item_moves(&self, ids: &[ItemId], dst_album: &AlbumInfo, names: &[String]) {
        self.record_hint(ItemMoveHint::new(ids, dst_album, names));
    }

    pub fn hint_item_modified(&self, ids: &[ItemId]) {
        self.record_hint(ItemChangeHint::new(ids.iter().copied(), ChangeKind::Modified));
    }

    pub fn hint_item_rescan(&self, ids: &[ItemId]) {
        self.record_hint(ItemChangeHint::new(
            ids.iter().copied(),
            ChangeKind::NeedsRescan,
        ));
    }

    /// Stop the worker after its current task
    fn shutdown(&mut self) {
        {
            let mut queue = self.shared.queue.lock();
            queue.running = false;
            self.shared.continue_init.store(false, Ordering::SeqCst);
            self.shared.continue_scan.store(false, Ordering::SeqCst);
            self.shared
                .continue_hash_update
                .store(false, Ordering::SeqCst);
            self.shared.continue_partial_scan.store(false, Ordering::SeqCst);
            self.shared.work_cv.notify_all();
            self.shared.done_cv.notify_all();
        }
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                log::error!("Scan worker terminated abnormally");
            }
        }
    }
}

impl Drop for ScanCoordinator {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Brackets an in-place metadata write of one item.
///
/// Creation records `AboutToEdit`. Dropping records `EditFinished` if
/// `mark_changed` was called and `EditAborted` otherwise, including on
/// unwinding, then rescans the item.
pub struct MetadataWriteGuard<'a> {
    coordinator: &'a ScanCoordinator,
    item: ItemInfo,
    changed: bool,
}

impl<'a> MetadataWriteGuard<'a> {
    fn new(coordinator: &'a ScanCoordinator, item: ItemInfo) -> Self {
        coordinator.record_hint(MetadataAdjustmentHint::from_disk(
            item.id,
            AdjustmentStatus::AboutToEdit,
            &item.path,
        ));
        Self {
            coordinator,
            item,
            changed: false,
        }
    }

    pub fn item(&self) -> &ItemInfo {
        &self.item
    }

    /// The file was written
    pub fn mark_changed(&mut self) {
        self.changed = true;
    }
}

impl Drop for MetadataWriteGuard<'_> {
    fn drop(&mut self) {
        let status = if self.changed {
            AdjustmentStatus::EditFinished
        } else {
            AdjustmentStatus::EditAborted
        };
        self.coordinator
            .record_hint(MetadataAdjustmentHint::from_disk(
                self.item.id,
                status,
                &self.item.path,
            ));
        if let Err(err) = self.coordinator.scanned_item(&self.item.path) {
            log::warn!(
                "Rescan after metadata write of {} failed: {}",
                self.item.path.display(),
                err
            );
        }
    }
}
