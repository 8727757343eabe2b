//! Catalog preparation: schema creation, migration and album root registration

use crate::config::ScanConfig;
use crate::db::{CatalogDatabase, SCHEMA_VERSION};
use crate::engine::{InitializationObserver, SchemaUpdateResult, SchemaUpdater};
use crate::error::ScanError;
use crate::scanner::compute_file_hash;

/// Number of hashes written per transaction
const HASH_BATCH_SIZE: usize = 200;

pub struct CatalogSchemaUpdater {
    config: ScanConfig,
}

impl CatalogSchemaUpdater {
    pub fn new(config: ScanConfig) -> Self {
        Self { config }
    }

    fn check_continue(observer: &dyn InitializationObserver) -> Result<(), ScanError> {
        if observer.continue_query() {
            Ok(())
        } else {
            Err(ScanError::cancelled())
        }
    }
}

impl SchemaUpdater for CatalogSchemaUpdater {
    fn update_schema(
        &mut self,
        observer: &dyn InitializationObserver,
    ) -> Result<SchemaUpdateResult, ScanError> {
        observer.more_schema_update_steps(3);

        let db = match CatalogDatabase::open(&self.config.catalog_path()) {
            Ok(db) => db,
            Err(e) => {
                observer.error(&format!(
                    "Cannot open catalog {}: {}",
                    self.config.catalog_path().display(),
                    e
                ));
                return Ok(SchemaUpdateResult::RecoverableError);
            }
        };
        observer.schema_update_progress("Opened catalog", 1);
        Self::check_continue(observer)?;

        let version = db.schema_version()?;
        match version {
            Some(v) if v > SCHEMA_VERSION => {
                observer.error(&format!(
                    "Catalog schema version {} is newer than the supported version {}",
                    v, SCHEMA_VERSION
                ));
                return Ok(SchemaUpdateResult::FatalError);
            }
            Some(v) if v < SCHEMA_VERSION => {
                log::info!("Updating catalog schema from version {}", v);
                db.create_schema()?;
                db.migrate_v1_to_v2()?;
                db.set_schema_version(SCHEMA_VERSION)?;
                observer.schema_update_progress("Updated catalog schema", 1);
            }
            Some(_) => {
                observer.schema_update_progress("Catalog schema is current", 1);
            }
            None => {
                log::info!("Creating catalog schema version {}", SCHEMA_VERSION);
                db.create_schema()?;
                db.set_schema_version(SCHEMA_VERSION)?;
                observer.schema_update_progress("Created catalog schema", 1);
            }
        }
        Self::check_continue(observer)?;

        for root in &self.config.roots {
            if !root.exists() {
                log::warn!("Album root {} is not available", root.display());
            }
            db.add_album_root(root)?;
        }
        observer.schema_update_progress("Registered album roots", 1);

        Ok(SchemaUpdateResult::Success)
    }

    fn update_unique_hash(
        &mut self,
        observer: &dyn InitializationObserver,
    ) -> Result<(), ScanError> {
        let mut db = CatalogDatabase::open(&self.config.catalog_path())?;
        let candidates = db.hash_candidates()?;
        let batches = candidates.len().div_ceil(HASH_BATCH_SIZE);
        observer.more_schema_update_steps(batches as u32);
        log::info!("Updating unique hash of {} items", candidates.len());

        for batch in candidates.chunks(HASH_BATCH_SIZE) {
            Self::check_continue(observer)?;
            let hashes: Vec<_> = batch
                .iter()
                .filter_map(|candidate| {
                    compute_file_hash(&candidate.path, self.config.large_file_threshold)
                        .map(|(hash, is_partial)| (candidate.id, hash, is_partial))
                })
                .collect();
            db.update_hashes(&hashes)?;
            observer.schema_update_progress("Updated unique hashes", 1);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::ScanObserver;
    use crate::models::AlbumRootInfo;
    use parking_lot::Mutex;
    use std::path::PathBuf;

    #[derive(Default)]
    struct RecordingObserver {
        errors: Mutex<Vec<String>>,
        steps: Mutex<u32>,
        cancelled: bool,
    }

    impl ScanObserver for RecordingObserver {
        fn continue_query(&self) -> bool {
            !self.cancelled
        }
    }

    impl InitializationObserver for RecordingObserver {
        fn more_schema_update_steps(&self, _steps: u32) {}

        fn schema_update_progress(&self, _message: &str, steps: u32) {
            *self.steps.lock() += steps;
        }

        fn error(&self, message: &str) {
            self.errors.lock().push(message.to_string());
        }
    }

    fn config_in(dir: &std::path::Path) -> ScanConfig {
        let root = dir.join("photos");
        std::fs::create_dir_all(&root).unwrap();
        ScanConfig::builder()
            .add_root(root)
            .db_path(dir.join("catalog.db"))
            .build()
    }

    #[test]
    fn test_creates_schema_and_registers_roots() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_in(dir.path());
        let observer = RecordingObserver::default();

        let result = CatalogSchemaUpdater::new(config.clone())
            .update_schema(&observer)
            .unwrap();
        assert_eq!(result, SchemaUpdateResult::Success);
        assert_eq!(*observer.steps.lock(), 3);

        let db = CatalogDatabase::open(&config.catalog_path()).unwrap();
        assert_eq!(db.schema_version().unwrap(), Some(SCHEMA_VERSION));
        let roots: Vec<PathBuf> = db
            .album_roots()
            .unwrap()
            .into_iter()
            .map(|AlbumRootInfo { path, .. }| path)
            .collect();
        assert_eq!(roots, config.roots);
    }

    #[test]
    fn test_migrates_version_one() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_in(dir.path());
        {
            let conn = rusqlite::Connection::open(config.catalog_path()).unwrap();
            conn.execute_batch(
                "
                CREATE TABLE settings (key TEXT PRIMARY KEY, value TEXT NOT NULL);
                INSERT INTO settings VALUES ('schema_version', '1');
                CREATE TABLE items (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    album_id INTEGER NOT NULL,
                    name TEXT NOT NULL,
                    size INTEGER NOT NULL,
                    mtime INTEGER NOT NULL,
                    extension TEXT NOT NULL,
                    media_type TEXT NOT NULL,
                    unique_hash TEXT,
                    status TEXT DEFAULT 'new',
                    UNIQUE(album_id, name)
                );
                ",
            )
            .unwrap();
        }

        let observer = RecordingObserver::default();
        let result = CatalogSchemaUpdater::new(config.clone())
            .update_schema(&observer)
            .unwrap();
        assert_eq!(result, SchemaUpdateResult::Success);

        let db = CatalogDatabase::open(&config.catalog_path()).unwrap();
        assert_eq!(db.schema_version().unwrap(), Some(2));
        assert!(db.has_column("items", "is_partial_hash").unwrap());
    }

    #[test]
    fn test_newer_schema_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_in(dir.path());
        {
            let conn = rusqlite::Connection::open(config.catalog_path()).unwrap();
            conn.execute_batch(
                "CREATE TABLE settings (key TEXT PRIMARY KEY, value TEXT NOT NULL);
                 INSERT INTO settings VALUES ('schema_version', '99');",
            )
            .unwrap();
        }

        let observer = RecordingObserver::default();
        let result = CatalogSchemaUpdater::new(config)
            .update_schema(&observer)
            .unwrap();
        assert_eq!(result, SchemaUpdateResult::FatalError);
        assert_eq!(observer.errors.lock().len(), 1);
    }

    #[test]
    fn test_unopenable_catalog_is_recoverable() {
        let dir = tempfile::tempdir().unwrap();
        let config = ScanConfig::builder()
            .db_path(dir.path().join("missing").join("catalog.db"))
            .build();

        let observer = RecordingObserver::default();
        let result = CatalogSchemaUpdater::new(config)
            .update_schema(&observer)
            .unwrap();
        assert_eq!(result, SchemaUpdateResult::RecoverableError);
    }

    #[test]
    fn test_cancelled_update_stops_early() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_in(dir.path());
        let observer = RecordingObserver {
            cancelled: true,
            ..Default::default()
        };

        let err = CatalogSchemaUpdater::new(config)
            .update_schema(&observer)
            .unwrap_err();
        assert!(err.is_cancelled());
    }

    #[test]
    fn test_update_unique_hash() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_in(dir.path());
        let observer = RecordingObserver::default();
        let mut updater = CatalogSchemaUpdater::new(config.clone());
        updater.update_schema(&observer).unwrap();

        std::fs::write(config.roots[0].join("a.jpg"), b"hello").unwrap();
        let item_id = {
            let db = CatalogDatabase::open(&config.catalog_path()).unwrap();
            let root = db.add_album_root(&config.roots[0]).unwrap();
            let album = db.add_album(root, "/", 0).unwrap();
            db.insert_item(&crate::db::ItemRecord::new(album.id, "a.jpg", 5, 0))
                .unwrap()
        };

        updater.update_unique_hash(&observer).unwrap();

        let db = CatalogDatabase::open(&config.catalog_path()).unwrap();
        let item = db.item_by_id(item_id).unwrap().unwrap();
        // md5("hello")
        assert_eq!(
            item.unique_hash.as_deref(),
            Some("5d41402abc4b2a76b9719d911017c592")
        );
        assert!(!item.is_partial_hash);
    }
}
