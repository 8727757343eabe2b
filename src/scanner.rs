//! Scanner module - reconciles the album roots on disk with the catalog
//!
//! Every directory below an album root is an album, every media file in it
//! an item. Hints from the application let the scanner keep album and item
//! ids across moves and copies, and treat metadata edits as updates.

use std::collections::{HashMap, HashSet};
use std::fs::Metadata;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use walkdir::{DirEntry, WalkDir};

use crate::config::ScanConfig;
use crate::db::{CatalogDatabase, ItemRecord, SCHEMA_VERSION};
use crate::engine::{EngineFactory, ScanEngine, ScanObserver, SchemaUpdater};
use crate::error::{ScanError, ScanErrorKind};
use crate::hints::{ChangeKind, HintCache};
use crate::models::{
    album_directory, relative_album_path, unix_mtime, AlbumId, AlbumInfo, AlbumRootInfo, ItemId,
    ItemStatus,
};
use crate::progress::{NotificationSender, ScanNotification};
use crate::schema::CatalogSchemaUpdater;

/// A media file found in an album directory
struct FoundFile {
    path: PathBuf,
    name: String,
    metadata: Metadata,
}

/// `ScanEngine` over a `CatalogDatabase`
pub struct CollectionScanner {
    config: ScanConfig,
    db: CatalogDatabase,
    hints: Arc<HintCache>,
    observer: Option<Arc<dyn ScanObserver>>,
    notifications: Option<NotificationSender>,
    defer_file_scanning: bool,
    need_file_count: bool,
    deferred_albums: Vec<PathBuf>,
}

impl CollectionScanner {
    /// Open the catalog of `config`; it must have been prepared by
    /// `CatalogSchemaUpdater`
    pub fn open(config: ScanConfig) -> Result<Self, ScanError> {
        let db = CatalogDatabase::open(&config.catalog_path())?;
        let version = db.schema_version()?;
        if version != Some(SCHEMA_VERSION) {
            return Err(ScanError::schema_error(format!(
                "Catalog {} has schema version {:?}, expected {}",
                config.catalog_path().display(),
                version,
                SCHEMA_VERSION
            )));
        }
        Ok(Self {
            config,
            db,
            hints: Arc::new(HintCache::default()),
            observer: None,
            notifications: None,
            defer_file_scanning: false,
            need_file_count: false,
            deferred_albums: Vec::new(),
        })
    }

    pub fn database(&self) -> &CatalogDatabase {
        &self.db
    }

    fn notify(&self, notification: ScanNotification) {
        if let Some(sink) = &self.notifications {
            sink.send(notification);
        }
    }

    fn check_continue(&self) -> Result<(), ScanError> {
        match &self.observer {
            Some(observer) if !observer.continue_query() => Err(ScanError::cancelled()),
            _ => Ok(()),
        }
    }

    fn is_ignored(&self, entry: &DirEntry) -> bool {
        // album roots are never filtered, even when hidden
        entry.depth() > 0
            && entry.file_type().is_dir()
            && entry
                .file_name()
                .to_str()
                .is_some_and(|name| self.config.should_ignore_dir(name))
    }

    fn log_walk_error(err: walkdir::Error) {
        let err = ScanError::from(err);
        match err.kind {
            ScanErrorKind::PermissionDenied => log::warn!("{}", err),
            _ => log::error!("{}", err),
        }
    }

    /// `top` and every album directory below it, parents before children
    fn album_dirs(&self, top: &Path) -> Vec<PathBuf> {
        let walker = WalkDir::new(top)
            .follow_links(false)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|entry| !self.is_ignored(entry));

        let mut dirs = Vec::new();
        for entry in walker {
            match entry {
                Ok(entry) if entry.file_type().is_dir() => dirs.push(entry.into_path()),
                Ok(_) => {}
                Err(e) => Self::log_walk_error(e),
            }
        }
        dirs
    }

    /// Media files directly inside `dir`
    fn album_files(&self, dir: &Path) -> Vec<FoundFile> {
        let walker = WalkDir::new(dir)
            .min_depth(1)
            .max_depth(1)
            .follow_links(false)
            .sort_by_file_name();

        let mut files = Vec::new();
        for entry in walker {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    Self::log_walk_error(e);
                    continue;
                }
            };
            if !entry.file_type().is_file() {
                continue;
            }
            let extension = entry
                .path()
                .extension()
                .and_then(|e| e.to_str())
                .map(|e| e.to_lowercase())
                .unwrap_or_default();
            if !self.config.should_include_extension(&extension) {
                continue;
            }
            let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                log::warn!("Skipping non-UTF-8 file name {}", entry.path().display());
                continue;
            };
            match entry.metadata() {
                Ok(metadata) => files.push(FoundFile {
                    path: entry.into_path(),
                    name,
                    metadata,
                }),
                Err(e) => Self::log_walk_error(e),
            }
        }
        files
    }

    fn count_files(&self, top: &Path) -> u64 {
        self.album_dirs(top)
            .iter()
            .map(|dir| self.album_files(dir).len() as u64)
            .sum()
    }

    /// The album root containing `path`, the innermost one if roots nest
    fn root_for(&self, path: &Path) -> Result<AlbumRootInfo, ScanError> {
        self.db
            .album_roots()?
            .into_iter()
            .filter(|root| path.starts_with(&root.path))
            .max_by_key(|root| root.path.as_os_str().len())
            .ok_or_else(|| ScanError::invalid_path(path.to_path_buf()))
    }

    fn album_dir_exists(&self, album: &AlbumInfo) -> Result<bool, ScanError> {
        Ok(match self.db.album_root(album.root_id)? {
            Some(root) => album_directory(&root.path, &album.relative_path).is_dir(),
            None => false,
        })
    }

    /// Find the album of `dir`, creating it if needed. Returns whether it is new.
    ///
    /// A directory announced by an album move hint takes over the source
    /// album row when the source directory is gone.
    fn resolve_album(
        &self,
        root: &AlbumRootInfo,
        dir: &Path,
    ) -> Result<(AlbumInfo, bool), ScanError> {
        let relative = relative_album_path(&root.path, dir)
            .ok_or_else(|| ScanError::invalid_path(dir.to_path_buf()))?;
        if let Some(album) = self.db.find_album(root.id, &relative)? {
            return Ok((album, false));
        }

        if let Some(hint) = self.hints.album_source_for(root.id, &relative) {
            if let Some(source) = self.db.album_by_id(hint.src_album_id)? {
                if !self.album_dir_exists(&source)? {
                    log::info!(
                        "Album {} moved to {}",
                        source.relative_path,
                        relative
                    );
                    let album = self.db.relocate_album(source.id, root.id, &relative)?;
                    return Ok((album, false));
                }
            }
        }

        let modified = std::fs::metadata(dir).map(|m| unix_mtime(&m)).unwrap_or(0);
        let album = self.db.add_album(root.id, &relative, modified)?;
        log::debug!("New album {} in {}", relative, root.path.display());
        Ok((album, true))
    }

    /// Album this one was copied from, if a hint says so
    fn copy_source_of(&self, album: &AlbumInfo) -> Option<AlbumId> {
        self.hints
            .album_source_for(album.root_id, &album.relative_path)
            .map(|hint| hint.src_album_id)
            .filter(|id| *id != album.id)
    }

    fn scan_album(
        &mut self,
        root: &AlbumRootInfo,
        dir: &Path,
        seen: &mut HashSet<AlbumId>,
        allow_defer: bool,
    ) -> Result<(), ScanError> {
        self.check_continue()?;
        let (album, is_new) = self.resolve_album(root, dir)?;
        seen.insert(album.id);
        self.notify(ScanNotification::StartScanningAlbum {
            root: root.path.clone(),
            album: album.relative_path.clone(),
        });

        if is_new && allow_defer && self.defer_file_scanning {
            self.deferred_albums.push(dir.to_path_buf());
            return Ok(());
        }
        self.scan_album_files(&album, dir)
    }

    fn scan_album_files(&mut self, album: &AlbumInfo, dir: &Path) -> Result<(), ScanError> {
        let mut existing: HashMap<String, ItemRecord> = self.db.load_album_items(album.id)?;
        let copy_source = self.copy_source_of(album);

        let mut scanned = 0u64;
        for file in self.album_files(dir) {
            self.check_continue()?;
            match existing.remove(&file.name) {
                Some(record) => {
                    self.update_item(record, &file.path, &file.metadata)?;
                }
                None => {
                    self.add_item(album, &file, copy_source)?;
                }
            }
            scanned += 1;
        }

        // items announced as moved are picked up at their destination
        let stale: Vec<ItemId> = existing
            .values()
            .map(|record| record.id)
            .filter(|id| self.hints.lookup_item_move(*id).is_none())
            .collect();
        if !stale.is_empty() {
            log::debug!("{} items vanished from {}", stale.len(), dir.display());
            self.db.move_to_deleted(&stale)?;
        }

        if scanned > 0 {
            self.notify(ScanNotification::ScannedFiles { count: scanned });
        }
        Ok(())
    }

    fn hash_into(&self, record: ItemRecord, path: &Path, force: bool) -> ItemRecord {
        if !(self.config.compute_hash || force) {
            return record;
        }
        match compute_file_hash(path, self.config.large_file_threshold) {
            Some((hash, is_partial)) => record.with_hash(hash, is_partial),
            None => {
                log::warn!("Cannot hash {}", path.display());
                record
            }
        }
    }

    fn update_item(
        &self,
        record: ItemRecord,
        path: &Path,
        metadata: &Metadata,
    ) -> Result<ItemId, ScanError> {
        let id = record.id;
        if self.hints.is_being_edited(id) {
            log::debug!("Postponing {} while its metadata is written", path.display());
            return Ok(id);
        }

        let size = metadata.len();
        let mtime = unix_mtime(metadata);
        let edited = self.hints.take_metadata_adjusted(id);
        let change = self.hints.take_item_change(id);
        let changed_on_disk = record.size != size || record.mtime != mtime;
        if edited.is_none() && change.is_none() && !changed_on_disk {
            return Ok(id);
        }

        // the file is exactly as the application's own metadata write left it
        let own_edit = change.is_none()
            && edited
                .as_ref()
                .is_some_and(|hint| hint.matches_disk(mtime, size));
        if own_edit {
            log::debug!("Applying metadata edit of {}", path.display());
            let record = ItemRecord {
                size,
                mtime,
                status: ItemStatus::Unchanged,
                ..record
            };
            self.db.update_item(&record)?;
            return Ok(id);
        }

        let mut record = ItemRecord {
            size,
            mtime,
            status: ItemStatus::Modified,
            ..record
        };
        record = self.hash_into(record, path, change == Some(ChangeKind::NeedsRescan));
        self.db.update_item(&record)?;
        Ok(id)
    }

    fn add_item(
        &self,
        album: &AlbumInfo,
        file: &FoundFile,
        copy_source: Option<AlbumId>,
    ) -> Result<ItemId, ScanError> {
        let fresh = ItemRecord::new(
            album.id,
            file.name.as_str(),
            file.metadata.len(),
            unix_mtime(&file.metadata),
        );

        if let Some(source_id) = self.hints.item_source_for(album.id, &file.name) {
            if let Some(source) = self.db.item_by_id(source_id)? {
                let moved = self
                    .db
                    .item_path(source_id)?
                    .map_or(true, |old_path| !old_path.exists());
                return self.adopt_item(source, fresh, moved);
            }
        }
        if let Some(source_album) = copy_source {
            if let Some(source) = self.db.find_item(source_album, &file.name)? {
                return self.adopt_item(source, fresh, false);
            }
        }

        let record = self.hash_into(fresh, &file.path, false);
        Ok(self.db.insert_item(&record)?)
    }

    /// Take over the identity (move) or the attributes (copy) of `source`
    fn adopt_item(
        &self,
        source: ItemRecord,
        mut fresh: ItemRecord,
        moved: bool,
    ) -> Result<ItemId, ScanError> {
        fresh.unique_hash = source.unique_hash;
        fresh.is_partial_hash = source.is_partial_hash;
        if moved {
            fresh.id = source.id;
            fresh.status = ItemStatus::Moved;
            self.db.update_item(&fresh)?;
            log::debug!("Item {} moved to {}", source.id, fresh.name);
            Ok(source.id)
        } else {
            fresh.status = ItemStatus::Copied;
            let id = self.db.insert_item(&fresh)?;
            log::debug!("Item {} copied as {}", source.id, id);
            Ok(id)
        }
    }

    /// Remove albums in the subtree `under` that were not seen, except
    /// those announced as moved
    fn remove_stale_albums(
        &mut self,
        root: &AlbumRootInfo,
        under: &str,
        seen: &HashSet<AlbumId>,
    ) -> Result<(), ScanError> {
        let prefix = format!("{}/", under.trim_end_matches('/'));
        let stale: Vec<AlbumId> = self
            .db
            .albums_in_root(root.id)?
            .into_iter()
            .filter(|album| {
                under == "/"
                    || album.relative_path == under
                    || album.relative_path.starts_with(&prefix)
            })
            .filter(|album| !seen.contains(&album.id))
            .filter(|album| self.hints.lookup_album_move(root.id, album.id).is_none())
            .map(|album| album.id)
            .collect();
        if !stale.is_empty() {
            log::info!("Removing {} vanished albums", stale.len());
            self.db.remove_albums(&stale)?;
        }
        Ok(())
    }
}

impl ScanEngine for CollectionScanner {
    fn set_hint_container(&mut self, hints: Arc<HintCache>) {
        self.hints = hints;
    }

    fn set_observer(&mut self, observer: Arc<dyn ScanObserver>) {
        self.observer = Some(observer);
    }

    fn set_notifications(&mut self, sink: NotificationSender) {
        self.notifications = Some(sink);
    }

    fn set_deferred_file_scanning(&mut self, defer: bool) {
        self.defer_file_scanning = defer;
    }

    fn set_need_file_count(&mut self, need: bool) {
        self.need_file_count = need;
    }

    fn scan_file(&mut self, path: &Path) -> Result<ItemId, ScanError> {
        let metadata = std::fs::metadata(path).map_err(|e| ScanError::from(e).with_path(path))?;
        let (Some(dir), Some(name)) = (path.parent(), path.file_name().and_then(|n| n.to_str()))
        else {
            return Err(ScanError::invalid_path(path.to_path_buf()));
        };
        if !metadata.is_file() {
            return Err(ScanError::invalid_path(path.to_path_buf()));
        }

        let root = self.root_for(path)?;
        let (album, _) = self.resolve_album(&root, dir)?;
        match self.db.find_item(album.id, name)? {
            Some(record) => self.update_item(record, path, &metadata),
            None => {
                let file = FoundFile {
                    path: path.to_path_buf(),
                    name: name.to_string(),
                    metadata,
                };
                let copy_source = self.copy_source_of(&album);
                self.add_item(&album, &file, copy_source)
            }
        }
    }

    fn complete_scan(&mut self) -> Result<(), ScanError> {
        self.notify(ScanNotification::CompleteScanStarted);
        self.deferred_albums.clear();
        self.db.reset_statuses()?;

        let roots = self.db.album_roots()?;
        if self.need_file_count {
            let count: u64 = roots.iter().map(|root| self.count_files(&root.path)).sum();
            self.notify(ScanNotification::TotalFilesToScan { count });
        }

        for root in &roots {
            if !root.path.is_dir() {
                log::warn!("Album root {} is not available, skipped", root.path.display());
                continue;
            }
            self.notify(ScanNotification::StartScanningAlbumRoot {
                root: root.path.clone(),
            });
            let mut seen = HashSet::new();
            for dir in self.album_dirs(&root.path) {
                self.scan_album(root, &dir, &mut seen, true)?;
            }
            self.notify(ScanNotification::StartScanningForStaleAlbums);
            self.remove_stale_albums(root, "/", &seen)?;
        }

        log::info!(
            "Complete scan finished, {} albums deferred",
            self.deferred_albums.len()
        );
        Ok(())
    }

    fn partial_scan(&mut self, path: &Path) -> Result<(), ScanError> {
        let root = self.root_for(path)?;
        let relative = relative_album_path(&root.path, path)
            .ok_or_else(|| ScanError::invalid_path(path.to_path_buf()))?;

        if path.is_file() {
            self.scan_file(path)?;
            return Ok(());
        }

        let mut seen = HashSet::new();
        if path.is_dir() {
            for dir in self.album_dirs(path) {
                self.scan_album(&root, &dir, &mut seen, false)?;
            }
        }
        self.remove_stale_albums(&root, &relative, &seen)
    }

    fn finish_complete_scan(&mut self, album_paths: &[PathBuf]) -> Result<(), ScanError> {
        if self.need_file_count {
            let count: u64 = album_paths
                .iter()
                .map(|dir| self.album_files(dir).len() as u64)
                .sum();
            self.notify(ScanNotification::TotalFilesToScan { count });
        }

        for dir in album_paths {
            self.check_continue()?;
            if !dir.is_dir() {
                continue;
            }
            let root = match self.root_for(dir) {
                Ok(root) => root,
                Err(e) => {
                    log::warn!("Skipping deferred album: {}", e);
                    continue;
                }
            };
            let (album, _) = self.resolve_album(&root, dir)?;
            self.notify(ScanNotification::StartScanningAlbum {
                root: root.path.clone(),
                album: album.relative_path.clone(),
            });
            self.scan_album_files(&album, dir)?;
        }
        self.deferred_albums.clear();
        Ok(())
    }

    fn deferred_album_paths(&self) -> Vec<PathBuf> {
        self.deferred_albums.clone()
    }
}

/// Builds scanners and schema updaters over one catalog
#[derive(Debug, Clone)]
pub struct CollectionScannerFactory {
    config: ScanConfig,
}

impl CollectionScannerFactory {
    pub fn new(config: ScanConfig) -> Self {
        Self { config }
    }
}

impl EngineFactory for CollectionScannerFactory {
    fn create_engine(&self) -> Result<Box<dyn ScanEngine>, ScanError> {
        Ok(Box::new(CollectionScanner::open(self.config.clone())?))
    }

    fn create_schema_updater(&self) -> Result<Box<dyn SchemaUpdater>, ScanError> {
        Ok(Box::new(CatalogSchemaUpdater::new(self.config.clone())))
    }
}

/// Compute file hash (MD5)
/// For large files, compute partial hash (first 1MB + last 1MB)
pub(crate) fn compute_file_hash(path: &Path, large_file_threshold: u64) -> Option<(String, bool)> {
    use md5::{Digest, Md5};
    use std::fs::File;
    use std::io::{Read, Seek, SeekFrom};

    let mut file = File::open(path).ok()?;
    let file_size = file.metadata().ok()?.len();
    let mut hasher = Md5::new();

    if file_size <= large_file_threshold {
        let mut buffer = Vec::new();
        file.read_to_end(&mut buffer).ok()?;
        hasher.update(&buffer);
        return Some((format!("{:x}", hasher.finalize()), false));
    }

    let chunk_size = 1024 * 1024;
    let mut buffer = vec![0u8; chunk_size];

    let bytes_read = file.read(&mut buffer).ok()?;
    hasher.update(&buffer[..bytes_read]);

    if file_size > chunk_size as u64 {
        file.seek(SeekFrom::End(-(chunk_size as i64))).ok()?;
        let bytes_read = file.read(&mut buffer).ok()?;
        hasher.update(&buffer[..bytes_read]);
    }

    Some((format!("{:x}", hasher.finalize()), true))
}
