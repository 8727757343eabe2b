//! Catalog database: album roots, albums, items and deleted items

use rusqlite::{params, Connection, OptionalExtension, Result as SqliteResult, Row};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::models::{
    album_directory, AlbumId, AlbumInfo, AlbumRootId, AlbumRootInfo, ItemId, ItemStatus,
    MediaType,
};

/// Schema version written by this crate
pub const SCHEMA_VERSION: i64 = 2;

/// Item row as stored in the catalog
#[derive(Debug, Clone, PartialEq)]
pub struct ItemRecord {
    pub id: ItemId,
    pub album_id: AlbumId,
    pub name: String,
    pub size: u64,
    pub mtime: i64,
    pub extension: String,
    pub media_type: MediaType,
    pub unique_hash: Option<String>,
    pub is_partial_hash: bool,
    pub status: ItemStatus,
}

impl ItemRecord {
    /// A record not yet stored; `id` is assigned on insert
    pub fn new(album_id: AlbumId, name: impl Into<String>, size: u64, mtime: i64) -> Self {
        let name = name.into();
        let extension = Path::new(&name)
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_lowercase())
            .unwrap_or_default();
        Self {
            id: 0,
            album_id,
            media_type: MediaType::from_extension(&extension),
            name,
            size,
            mtime,
            extension,
            unique_hash: None,
            is_partial_hash: false,
            status: ItemStatus::New,
        }
    }

    pub fn with_hash(mut self, hash: String, is_partial: bool) -> Self {
        self.unique_hash = Some(hash);
        self.is_partial_hash = is_partial;
        self
    }

    fn from_row(row: &Row<'_>) -> SqliteResult<Self> {
        let extension: String = row.get(5)?;
        Ok(Self {
            id: row.get(0)?,
            album_id: row.get(1)?,
            name: row.get(2)?,
            size: row.get::<_, i64>(3)? as u64,
            mtime: row.get(4)?,
            media_type: MediaType::from_extension(&extension),
            extension,
            unique_hash: row.get(6)?,
            is_partial_hash: row.get::<_, Option<i64>>(7)?.unwrap_or(0) != 0,
            status: ItemStatus::from_str_lossy(
                &row.get::<_, Option<String>>(8)?.unwrap_or_default(),
            ),
        })
    }
}

const ITEM_COLUMNS: &str =
    "id, album_id, name, size, mtime, extension, unique_hash, is_partial_hash, status";

/// Deleted item record
#[derive(Debug, Clone)]
pub struct DeletedItemRecord {
    pub item_id: ItemId,
    pub album_id: AlbumId,
    pub name: String,
    pub size: u64,
    pub unique_hash: Option<String>,
    pub deleted_at: i64,
}

/// Item whose file should be hashed
#[derive(Debug, Clone)]
pub struct HashCandidate {
    pub id: ItemId,
    pub path: PathBuf,
}

/// Connection to the catalog
pub struct CatalogDatabase {
    conn: Connection,
}

impl CatalogDatabase {
    /// Open or create the catalog file. The schema is managed by
    /// `CatalogSchemaUpdater`.
    pub fn open(path: &Path) -> SqliteResult<Self> {
        let conn = Connection::open(path)?;
        // worker and single-file scans hold separate connections
        conn.busy_timeout(Duration::from_secs(5))?;
        Ok(Self { conn })
    }

    /// Open in-memory database with the current schema (for testing)
    pub fn open_memory() -> SqliteResult<Self> {
        let conn = Connection::open_in_memory()?;
        let db = Self { conn };
        db.create_schema()?;
        db.set_schema_version(SCHEMA_VERSION)?;
        Ok(db)
    }

    /// Stored schema version, `None` for an empty catalog
    pub fn schema_version(&self) -> SqliteResult<Option<i64>> {
        let has_settings: bool = self.conn.query_row(
            "SELECT COUNT(*) > 0 FROM sqlite_master WHERE type='table' AND name='settings'",
            [],
            |row| row.get(0),
        )?;
        if !has_settings {
            return Ok(None);
        }
        let value: Option<String> = self
            .conn
            .query_row(
                "SELECT value FROM settings WHERE key = 'schema_version'",
                [],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value.and_then(|v| v.parse().ok()))
    }

    pub(crate) fn set_schema_version(&self, version: i64) -> SqliteResult<()> {
        self.conn.execute(
            "INSERT OR REPLACE INTO settings (key, value) VALUES ('schema_version', ?1)",
            params![version.to_string()],
        )?;
        Ok(())
    }

    /// Create missing tables and indexes of the current schema
    pub(crate) fn create_schema(&self) -> SqliteResult<()> {
        self.conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS settings (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS album_roots (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                path TEXT NOT NULL UNIQUE
            );

            CREATE TABLE IF NOT EXISTS albums (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                album_root INTEGER NOT NULL,
                relative_path TEXT NOT NULL,
                modified INTEGER NOT NULL DEFAULT 0,
                UNIQUE(album_root, relative_path)
            );

            CREATE TABLE IF NOT EXISTS items (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                album_id INTEGER NOT NULL,
                name TEXT NOT NULL,
                size INTEGER NOT NULL,
                mtime INTEGER NOT NULL,
                extension TEXT NOT NULL,
                media_type TEXT NOT NULL,
                unique_hash TEXT,
                is_partial_hash INTEGER DEFAULT 0,
                status TEXT DEFAULT 'new',
                UNIQUE(album_id, name)
            );
            CREATE INDEX IF NOT EXISTS idx_items_album ON items(album_id);
            CREATE INDEX IF NOT EXISTS idx_items_hash ON items(unique_hash);
            CREATE INDEX IF NOT EXISTS idx_items_status ON items(status);

            CREATE TABLE IF NOT EXISTS deleted_items (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                item_id INTEGER NOT NULL,
                album_id INTEGER NOT NULL,
                name TEXT NOT NULL,
                size INTEGER NOT NULL,
                unique_hash TEXT,
                deleted_at INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_deleted_items_hash ON deleted_items(unique_hash);
            ",
        )?;
        Ok(())
    }

    /// Whether `table` has a column named `column`
    pub fn has_column(&self, table: &str, column: &str) -> SqliteResult<bool> {
        self.conn.query_row(
            "SELECT COUNT(*) > 0 FROM pragma_table_info(?1) WHERE name = ?2",
            params![table, column],
            |row| row.get(0),
        )
    }

    /// Version 1 catalogs lack the partial-hash flag
    pub(crate) fn migrate_v1_to_v2(&self) -> SqliteResult<()> {
        if !self.has_column("items", "is_partial_hash")? {
            self.conn.execute(
                "ALTER TABLE items ADD COLUMN is_partial_hash INTEGER DEFAULT 0",
                [],
            )?;
        }
        Ok(())
    }

    /// Register an album root; returns the id of the existing root if known
    pub fn add_album_root(&self, path: &Path) -> SqliteResult<AlbumRootId> {
        let path_str = path.to_string_lossy().replace('\\', "/");
        self.conn.execute(
            "INSERT OR IGNORE INTO album_roots (path) VALUES (?1)",
            params![path_str],
        )?;
        self.conn.query_row(
            "SELECT id FROM album_roots WHERE path = ?1",
            params![path_str],
            |row| row.get(0),
        )
    }

    pub fn album_roots(&self) -> SqliteResult<Vec<AlbumRootInfo>> {
        let mut stmt = self
            .conn
            .prepare("SELECT id, path FROM album_roots ORDER BY id")?;
        let rows = stmt.query_map([], |row| {
            Ok(AlbumRootInfo {
                id: row.get(0)?,
                path: PathBuf::from(row.get::<_, String>(1)?),
            })
        })?;
        rows.collect()
    }

    pub fn album_root(&self, id: AlbumRootId) -> SqliteResult<Option<AlbumRootInfo>> {
        self.conn
            .query_row(
                "SELECT id, path FROM album_roots WHERE id = ?1",
                params![id],
                |row| {
                    Ok(AlbumRootInfo {
                        id: row.get(0)?,
                        path: PathBuf::from(row.get::<_, String>(1)?),
                    })
                },
            )
            .optional()
    }

    fn album_from_row(row: &Row<'_>) -> SqliteResult<AlbumInfo> {
        Ok(AlbumInfo {
            id: row.get(0)?,
            root_id: row.get(1)?,
            relative_path: row.get(2)?,
        })
    }

    pub fn find_album(
        &self,
        root: AlbumRootId,
        relative_path: &str,
    ) -> SqliteResult<Option<AlbumInfo>> {
        self.conn
            .query_row(
                "SELECT id, album_root, relative_path FROM albums
                 WHERE album_root = ?1 AND relative_path = ?2",
                params![root, relative_path],
                Self::album_from_row,
            )
            .optional()
    }

    pub fn album_by_id(&self, id: AlbumId) -> SqliteResult<Option<AlbumInfo>> {
        self.conn
            .query_row(
                "SELECT id, album_root, relative_path FROM albums WHERE id = ?1",
                params![id],
                Self::album_from_row,
            )
            .optional()
    }

    pub fn albums_in_root(&self, root: AlbumRootId) -> SqliteResult<Vec<AlbumInfo>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, album_root, relative_path FROM albums
             WHERE album_root = ?1 ORDER BY relative_path",
        )?;
        let rows = stmt.query_map(params![root], Self::album_from_row)?;
        rows.collect()
    }

    pub fn add_album(
        &self,
        root: AlbumRootId,
        relative_path: &str,
        modified: i64,
    ) -> SqliteResult<AlbumInfo> {
        self.conn.execute(
            "INSERT INTO albums (album_root, relative_path, modified) VALUES (?1, ?2, ?3)",
            params![root, relative_path, modified],
        )?;
        Ok(AlbumInfo::new(
            self.conn.last_insert_rowid(),
            root,
            relative_path,
        ))
    }

    /// Give an existing album a new location, keeping its id and items
    pub fn relocate_album(
        &self,
        id: AlbumId,
        root: AlbumRootId,
        relative_path: &str,
    ) -> SqliteResult<AlbumInfo> {
        self.conn.execute(
            "UPDATE albums SET album_root = ?1, relative_path = ?2 WHERE id = ?3",
            params![root, relative_path, id],
        )?;
        Ok(AlbumInfo::new(id, root, relative_path))
    }

    /// Remove albums, moving their items to deleted_items
    pub fn remove_albums(&mut self, ids: &[AlbumId]) -> SqliteResult<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let now = unix_now();
        let tx = self.conn.transaction()?;
        {
            let mut insert_stmt = tx.prepare(
                "INSERT INTO deleted_items (item_id, album_id, name, size, unique_hash, deleted_at)
                 SELECT id, album_id, name, size, unique_hash, ?1 FROM items WHERE album_id = ?2",
            )?;
            let mut delete_items = tx.prepare("DELETE FROM items WHERE album_id = ?1")?;
            let mut delete_album = tx.prepare("DELETE FROM albums WHERE id = ?1")?;
            for id in ids {
                insert_stmt.execute(params![now, id])?;
                delete_items.execute(params![id])?;
                delete_album.execute(params![id])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    /// Load the items of an album keyed by file name
    pub fn load_album_items(&self, album: AlbumId) -> SqliteResult<HashMap<String, ItemRecord>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {} FROM items WHERE album_id = ?1",
            ITEM_COLUMNS
        ))?;
        let rows = stmt.query_map(params![album], ItemRecord::from_row)?;

        let mut index = HashMap::new();
        for row in rows {
            let record = row?;
            index.insert(record.name.clone(), record);
        }
        Ok(index)
    }

    pub fn item_by_id(&self, id: ItemId) -> SqliteResult<Option<ItemRecord>> {
        self.conn
            .query_row(
                &format!("SELECT {} FROM items WHERE id = ?1", ITEM_COLUMNS),
                params![id],
                ItemRecord::from_row,
            )
            .optional()
    }

    pub fn find_item(&self, album: AlbumId, name: &str) -> SqliteResult<Option<ItemRecord>> {
        self.conn
            .query_row(
                &format!(
                    "SELECT {} FROM items WHERE album_id = ?1 AND name = ?2",
                    ITEM_COLUMNS
                ),
                params![album, name],
                ItemRecord::from_row,
            )
            .optional()
    }

    /// Full path of an item's file
    pub fn item_path(&self, id: ItemId) -> SqliteResult<Option<PathBuf>> {
        let row: Option<(String, String, String)> = self
            .conn
            .query_row(
                "SELECT r.path, a.relative_path, i.name FROM items i
                 JOIN albums a ON i.album_id = a.id
                 JOIN album_roots r ON a.album_root = r.id
                 WHERE i.id = ?1",
                params![id],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()?;
        Ok(row.map(|(root, relative, name)| {
            album_directory(Path::new(&root), &relative).join(name)
        }))
    }

    /// Insert a new item; `record.id` is ignored
    pub fn insert_item(&self, record: &ItemRecord) -> SqliteResult<ItemId> {
        self.conn.execute(
            "INSERT INTO items
             (album_id, name, size, mtime, extension, media_type, unique_hash, is_partial_hash, status)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                record.album_id,
                record.name,
                record.size as i64,
                record.mtime,
                record.extension,
                record.media_type.as_str(),
                record.unique_hash,
                record.is_partial_hash as i32,
                record.status.as_str(),
            ],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    /// Write back all fields of an existing item
    pub fn update_item(&self, record: &ItemRecord) -> SqliteResult<()> {
        self.conn.execute(
            "UPDATE items SET album_id = ?1, name = ?2, size = ?3, mtime = ?4, extension = ?5,
             media_type = ?6, unique_hash = ?7, is_partial_hash = ?8, status = ?9
             WHERE id = ?10",
            params![
                record.album_id,
                record.name,
                record.size as i64,
                record.mtime,
                record.extension,
                record.media_type.as_str(),
                record.unique_hash,
                record.is_partial_hash as i32,
                record.status.as_str(),
                record.id,
            ],
        )?;
        Ok(())
    }

    /// Reset statuses left by the previous scan
    pub fn reset_statuses(&mut self) -> SqliteResult<()> {
        self.conn.execute(
            "UPDATE items SET status = 'unchanged' WHERE status != 'unchanged'",
            [],
        )?;
        Ok(())
    }

    /// Move items to deleted_items and remove them from items
    pub fn move_to_deleted(&mut self, ids: &[ItemId]) -> SqliteResult<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let now = unix_now();
        let tx = self.conn.transaction()?;
        {
            let mut insert_stmt = tx.prepare(
                "INSERT INTO deleted_items (item_id, album_id, name, size, unique_hash, deleted_at)
                 SELECT id, album_id, name, size, unique_hash, ?1 FROM items WHERE id = ?2",
            )?;
            let mut delete_stmt = tx.prepare("DELETE FROM items WHERE id = ?1")?;
            for id in ids {
                insert_stmt.execute(params![now, id])?;
                delete_stmt.execute(params![id])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    /// Every item with the path of its file
    pub fn hash_candidates(&self) -> SqliteResult<Vec<HashCandidate>> {
        let mut stmt = self.conn.prepare(
            "SELECT i.id, r.path, a.relative_path, i.name FROM items i
             JOIN albums a ON i.album_id = a.id
             JOIN album_roots r ON a.album_root = r.id
             ORDER BY i.id",
        )?;
        let rows = stmt.query_map([], |row| {
            let root: String = row.get(1)?;
            let relative: String = row.get(2)?;
            let name: String = row.get(3)?;
            Ok(HashCandidate {
                id: row.get(0)?,
                path: album_directory(Path::new(&root), &relative).join(name),
            })
        })?;
        rows.collect()
    }

    /// Batch update of unique hashes
    pub fn update_hashes(&mut self, hashes: &[(ItemId, String, bool)]) -> SqliteResult<()> {
        let tx = self.conn.transaction()?;
        {
            let mut stmt = tx.prepare(
                "UPDATE items SET unique_hash = ?1, is_partial_hash = ?2 WHERE id = ?3",
            )?;
            for (id, hash, is_partial) in hashes {
                stmt.execute(params![hash, *is_partial as i32, id])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    pub fn get_deleted_items(&self) -> SqliteResult<Vec<DeletedItemRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT item_id, album_id, name, size, unique_hash, deleted_at FROM deleted_items
             ORDER BY deleted_at DESC, id DESC",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(DeletedItemRecord {
                item_id: row.get(0)?,
                album_id: row.get(1)?,
                name: row.get(2)?,
                size: row.get::<_, i64>(3)? as u64,
                unique_hash: row.get(4)?,
                deleted_at: row.get(5)?,
            })
        })?;
        rows.collect()
    }

    pub fn item_count(&self) -> SqliteResult<u64> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM items", [], |row| row.get(0))?;
        Ok(count as u64)
    }

    pub fn album_count(&self) -> SqliteResult<u64> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM albums", [], |row| row.get(0))?;
        Ok(count as u64)
    }

    /// Get status counts
    pub fn get_status_counts(&self) -> SqliteResult<HashMap<String, u64>> {
        let mut stmt = self
            .conn
            .prepare("SELECT status, COUNT(*) FROM items GROUP BY status")?;

        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)? as u64))
        })?;

        let mut counts = HashMap::new();
        for row in rows {
            let (status, count) = row?;
            counts.insert(status, count);
        }
        Ok(counts)
    }
}

fn unix_now() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn catalog_with_album() -> (CatalogDatabase, AlbumInfo) {
        let db = CatalogDatabase::open_memory().unwrap();
        let root = db.add_album_root(Path::new("/photos")).unwrap();
        let album = db.add_album(root, "/Trips", 0).unwrap();
        (db, album)
    }

    #[test]
    fn test_open_memory_has_current_schema() {
        let db = CatalogDatabase::open_memory().unwrap();
        assert_eq!(db.schema_version().unwrap(), Some(SCHEMA_VERSION));
        assert!(db.has_column("items", "is_partial_hash").unwrap());
        assert_eq!(db.item_count().unwrap(), 0);
    }

    #[test]
    fn test_empty_catalog_has_no_version() {
        let dir = tempfile::tempdir().unwrap();
        let db = CatalogDatabase::open(&dir.path().join("catalog.db")).unwrap();
        assert_eq!(db.schema_version().unwrap(), None);
    }

    #[test]
    fn test_album_root_registration_is_idempotent() {
        let db = CatalogDatabase::open_memory().unwrap();
        let a = db.add_album_root(Path::new("/photos")).unwrap();
        let b = db.add_album_root(Path::new("/photos")).unwrap();
        assert_eq!(a, b);
        assert_eq!(db.album_roots().unwrap().len(), 1);
        assert_eq!(db.album_root(a).unwrap().unwrap().path, PathBuf::from("/photos"));
    }

    #[test]
    fn test_relocate_album_keeps_id() {
        let (db, album) = catalog_with_album();
        let moved = db.relocate_album(album.id, album.root_id, "/Archive/Trips").unwrap();

        assert_eq!(moved.id, album.id);
        assert!(db.find_album(album.root_id, "/Trips").unwrap().is_none());
        assert_eq!(
            db.find_album(album.root_id, "/Archive/Trips").unwrap(),
            Some(moved)
        );
    }

    #[test]
    fn test_insert_and_update_item() {
        let (db, album) = catalog_with_album();
        let record = ItemRecord::new(album.id, "IMG_0001.JPG", 1024, 1_700_000_000)
            .with_hash("abc".to_string(), false);
        let id = db.insert_item(&record).unwrap();

        let mut stored = db.item_by_id(id).unwrap().unwrap();
        assert_eq!(stored.extension, "jpg");
        assert_eq!(stored.media_type, MediaType::Image);
        assert_eq!(stored.status, ItemStatus::New);
        assert_eq!(stored.unique_hash.as_deref(), Some("abc"));

        stored.size = 2048;
        stored.status = ItemStatus::Modified;
        db.update_item(&stored).unwrap();
        assert_eq!(db.find_item(album.id, "IMG_0001.JPG").unwrap(), Some(stored));
        assert_eq!(
            db.item_path(id).unwrap(),
            Some(PathBuf::from("/photos/Trips/IMG_0001.JPG"))
        );
    }

    #[test]
    fn test_move_to_deleted() {
        let (mut db, album) = catalog_with_album();
        let id = db
            .insert_item(&ItemRecord::new(album.id, "a.jpg", 10, 0))
            .unwrap();
        db.insert_item(&ItemRecord::new(album.id, "b.jpg", 20, 0))
            .unwrap();

        db.move_to_deleted(&[id]).unwrap();
        assert_eq!(db.item_count().unwrap(), 1);
        let deleted = db.get_deleted_items().unwrap();
        assert_eq!(deleted.len(), 1);
        assert_eq!(deleted[0].item_id, id);
        assert_eq!(deleted[0].name, "a.jpg");
    }

    #[test]
    fn test_remove_albums_moves_items_to_deleted() {
        let (mut db, album) = catalog_with_album();
        db.insert_item(&ItemRecord::new(album.id, "a.jpg", 10, 0))
            .unwrap();

        db.remove_albums(&[album.id]).unwrap();
        assert_eq!(db.album_count().unwrap(), 0);
        assert_eq!(db.item_count().unwrap(), 0);
        assert_eq!(db.get_deleted_items().unwrap().len(), 1);
    }

    #[test]
    fn test_status_counts_and_reset() {
        let (mut db, album) = catalog_with_album();
        db.insert_item(&ItemRecord::new(album.id, "a.jpg", 10, 0))
            .unwrap();
        db.insert_item(&ItemRecord::new(album.id, "b.jpg", 10, 0))
            .unwrap();
        assert_eq!(db.get_status_counts().unwrap().get("new"), Some(&2));

        db.reset_statuses().unwrap();
        let counts = db.get_status_counts().unwrap();
        assert_eq!(counts.get("unchanged"), Some(&2));
        assert_eq!(counts.get("new"), None);
    }

    #[test]
    fn test_hash_candidates_and_update() {
        let (mut db, album) = catalog_with_album();
        let id = db
            .insert_item(&ItemRecord::new(album.id, "a.jpg", 10, 0))
            .unwrap();

        let candidates = db.hash_candidates().unwrap();
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].path, PathBuf::from("/photos/Trips/a.jpg"));

        db.update_hashes(&[(id, "ffff".to_string(), true)]).unwrap();
        let stored = db.item_by_id(id).unwrap().unwrap();
        assert_eq!(stored.unique_hash.as_deref(), Some("ffff"));
        assert!(stored.is_partial_hash);
    }
}
