//! Interfaces of the collaborators the coordinator delegates to
//!
//! The worker owns its engine instances; single-file scans on the calling
//! thread build their own, so implementations need to be `Send` but not `Sync`.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::error::ScanError;
use crate::hints::HintCache;
use crate::models::ItemId;
use crate::progress::NotificationSender;

/// Polled by long-running passes; returning false asks them to stop early
pub trait ScanObserver: Send + Sync {
    fn continue_query(&self) -> bool;
}

/// Observer backed by a shared flag the coordinator can clear
#[derive(Debug, Clone)]
pub struct FlagObserver {
    flag: Arc<AtomicBool>,
}

impl FlagObserver {
    /// The worker arms the flag when it picks the task; clearing it asks the pass to stop
    pub fn new(flag: &Arc<AtomicBool>) -> Self {
        Self {
            flag: Arc::clone(flag),
        }
    }
}

impl ScanObserver for FlagObserver {
    fn continue_query(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

/// Terminal status of a schema update
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchemaUpdateResult {
    Success,
    RecoverableError,
    FatalError,
}

/// Receives progress of the schema updater
pub trait InitializationObserver: ScanObserver {
    /// The update needs this many additional steps
    fn more_schema_update_steps(&self, steps: u32);
    /// `steps` steps were completed, described by `message`
    fn schema_update_progress(&self, message: &str, steps: u32);
    fn error(&self, message: &str);
}

/// Prepares the catalog for use and runs maintenance passes over it
pub trait SchemaUpdater: Send {
    fn update_schema(
        &mut self,
        observer: &dyn InitializationObserver,
    ) -> Result<SchemaUpdateResult, ScanError>;

    fn update_unique_hash(&mut self, observer: &dyn InitializationObserver)
        -> Result<(), ScanError>;
}

/// Walks the collection and reconciles it with the catalog
pub trait ScanEngine: Send {
    /// Hints consulted (and partly consumed) by every following call
    fn set_hint_container(&mut self, hints: Arc<HintCache>);

    fn set_observer(&mut self, observer: Arc<dyn ScanObserver>);

    /// Progress notifications; engines without a sink stay silent
    fn set_notifications(&mut self, sink: NotificationSender);

    /// Postpone the file pass of newly found files in `complete_scan`
    fn set_deferred_file_scanning(&mut self, defer: bool);

    /// Count files up front so progress can be shown as a fraction
    fn set_need_file_count(&mut self, need: bool);

    /// Scan a single file and return its item id
    fn scan_file(&mut self, path: &Path) -> Result<ItemId, ScanError>;

    fn complete_scan(&mut self) -> Result<(), ScanError>;

    fn partial_scan(&mut self, path: &Path) -> Result<(), ScanError>;

    fn finish_complete_scan(&mut self, album_paths: &[PathBuf]) -> Result<(), ScanError>;

    /// Albums whose file pass was postponed by the last deferred `complete_scan`
    fn deferred_album_paths(&self) -> Vec<PathBuf>;
}

/// Creates fresh collaborator instances for each task
pub trait EngineFactory: Send + Sync + 'static {
    fn create_engine(&self) -> Result<Box<dyn ScanEngine>, ScanError>;

    fn create_schema_updater(&self) -> Result<Box<dyn SchemaUpdater>, ScanError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flag_observer_follows_flag() {
        let flag = Arc::new(AtomicBool::new(true));
        let observer = FlagObserver::new(&flag);
        assert!(observer.continue_query());

        flag.store(false, Ordering::SeqCst);
        assert!(!observer.continue_query());
    }
}
