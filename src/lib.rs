//! Photo collection indexer with a serialized background scan coordinator
//!
//! A single worker thread runs catalog initialization, complete and partial
//! collection scans, unique hash updates and deferred file passes. Callers
//! request work through `ScanCoordinator`, record move/copy/edit hints in the
//! shared `HintCache`, and receive progress as `ScanNotification`s.

pub mod config;
pub mod coordinator;
pub mod db;
pub mod engine;
pub mod error;
pub mod hints;
pub mod models;
pub mod progress;
pub mod scanner;
pub mod schema;
pub mod task_queue;
mod worker;

pub use config::{CoordinatorConfig, ScanConfig};
pub use coordinator::{InitOutcome, MetadataWriteGuard, ScanCoordinator};
pub use db::CatalogDatabase;
pub use engine::{
    EngineFactory, InitializationObserver, ScanEngine, ScanObserver, SchemaUpdateResult,
    SchemaUpdater,
};
pub use error::{ScanError, ScanErrorKind};
pub use hints::{
    AdjustmentStatus, AlbumMoveHint, ChangeKind, Hint, HintCache, ItemChangeHint, ItemMoveHint,
    MetadataAdjustmentHint,
};
pub use models::{AlbumId, AlbumInfo, AlbumRootId, ItemId, ItemInfo, ItemStatus, MediaType};
pub use progress::{NotificationSender, ProgressReporter, ScanNotification};
pub use scanner::{CollectionScanner, CollectionScannerFactory};
pub use schema::CatalogSchemaUpdater;
