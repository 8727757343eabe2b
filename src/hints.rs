//! Scan hints: facts the application announces about changes it performs itself
//!
//! A hint lets the next scan recognize a move, copy or metadata edit cheaply
//! instead of treating it as delete + create. Hints live only in memory and
//! are discarded as a whole batch once the coordinator has been idle for the
//! quiescence window.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::models::{join_album_path, AlbumId, AlbumInfo, AlbumRootId, ItemId};

/// Album `src_album_id` is expected to reappear at `dst_relative_path` in `dst_album_root`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlbumMoveHint {
    pub src_album_root: AlbumRootId,
    pub src_album_id: AlbumId,
    pub dst_album_root: AlbumRootId,
    pub dst_relative_path: String,
}

impl AlbumMoveHint {
    pub fn new(
        src_album_root: AlbumRootId,
        src_album_id: AlbumId,
        dst_album_root: AlbumRootId,
        dst_relative_path: impl Into<String>,
    ) -> Self {
        Self {
            src_album_root,
            src_album_id,
            dst_album_root,
            dst_relative_path: dst_relative_path.into(),
        }
    }
}

/// A batch of items is expected to reappear under `dst_album_id` with the given names
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemMoveHint {
    pub src_item_ids: BTreeSet<ItemId>,
    pub dst_album_root: AlbumRootId,
    pub dst_album_id: AlbumId,
    pub dst_names: BTreeMap<ItemId, String>,
}

impl ItemMoveHint {
    /// Pair source ids with destination names positionally.
    /// Ids without a name are dropped.
    pub fn new(ids: &[ItemId], dst_album: &AlbumInfo, names: &[String]) -> Self {
        if ids.len() != names.len() {
            log::warn!(
                "Item move hint with {} ids but {} names; unpaired entries dropped",
                ids.len(),
                names.len()
            );
        }
        let dst_names: BTreeMap<ItemId, String> = ids
            .iter()
            .copied()
            .zip(names.iter().cloned())
            .collect();
        Self {
            src_item_ids: dst_names.keys().copied().collect(),
            dst_album_root: dst_album.root_id,
            dst_album_id: dst_album.id,
            dst_names,
        }
    }
}

/// How a changed item has to be treated by the next scan
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChangeKind {
    /// Dirty even if the modification time did not change
    Modified,
    /// Re-read completely
    NeedsRescan,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemChangeHint {
    pub item_ids: BTreeSet<ItemId>,
    pub kind: ChangeKind,
}

impl ItemChangeHint {
    pub fn new(ids: impl IntoIterator<Item = ItemId>, kind: ChangeKind) -> Self {
        Self {
            item_ids: ids.into_iter().collect(),
            kind,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AdjustmentStatus {
    AboutToEdit,
    EditFinished,
    EditAborted,
}

/// Brackets an in-place metadata write performed by the application
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetadataAdjustmentHint {
    pub item_id: ItemId,
    pub status: AdjustmentStatus,
    pub disk_mod_time: Option<DateTime<Utc>>,
    pub disk_size: Option<u64>,
}

impl MetadataAdjustmentHint {
    pub fn new(
        item_id: ItemId,
        status: AdjustmentStatus,
        disk_mod_time: Option<DateTime<Utc>>,
        disk_size: Option<u64>,
    ) -> Self {
        Self {
            item_id,
            status,
            disk_mod_time,
            disk_size,
        }
    }

    /// Capture the current modification time and size of `path`.
    /// A missing file yields empty fields.
    pub fn from_disk(item_id: ItemId, status: AdjustmentStatus, path: &Path) -> Self {
        match std::fs::metadata(path) {
            Ok(metadata) => Self::new(
                item_id,
                status,
                metadata.modified().ok().map(DateTime::<Utc>::from),
                Some(metadata.len()),
            ),
            Err(_) => Self::new(item_id, status, None, None),
        }
    }

    /// Whether the recorded state matches a file with the given Unix mtime and size
    pub fn matches_disk(&self, mtime: i64, size: u64) -> bool {
        self.disk_mod_time.map(|t| t.timestamp()) == Some(mtime) && self.disk_size == Some(size)
    }
}

/// Any hint the application can record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Hint {
    AlbumMove(AlbumMoveHint),
    ItemMove(ItemMoveHint),
    ItemChange(ItemChangeHint),
    MetadataAdjustment(MetadataAdjustmentHint),
}

impl From<AlbumMoveHint> for Hint {
    fn from(hint: AlbumMoveHint) -> Self {
        Hint::AlbumMove(hint)
    }
}

impl From<ItemMoveHint> for Hint {
    fn from(hint: ItemMoveHint) -> Self {
        Hint::ItemMove(hint)
    }
}

impl From<ItemChangeHint> for Hint {
    fn from(hint: ItemChangeHint) -> Self {
        Hint::ItemChange(hint)
    }
}

impl From<MetadataAdjustmentHint> for Hint {
    fn from(hint: MetadataAdjustmentHint) -> Self {
        Hint::MetadataAdjustment(hint)
    }
}

/// Build the hints for moving or copying `album` and its sub-albums below
/// `dst_parent_path` in `dst_root`, the top album being named `album_name`.
pub fn hints_for_album_tree(
    album: &AlbumInfo,
    sub_albums: &[AlbumInfo],
    dst_root: AlbumRootId,
    dst_parent_path: &str,
    album_name: &str,
) -> Vec<AlbumMoveHint> {
    let mut hints = vec![AlbumMoveHint::new(
        album.root_id,
        album.id,
        dst_root,
        join_album_path(dst_parent_path, album_name),
    )];

    // "/" would otherwise cut the leading slash off every child suffix
    let parent_path = if album.relative_path == "/" {
        ""
    } else {
        album.relative_path.as_str()
    };

    for sub in sub_albums {
        let Some(suffix) = sub.relative_path.strip_prefix(parent_path) else {
            continue;
        };
        if sub.id == album.id || !suffix.starts_with('/') {
            continue;
        }
        hints.push(AlbumMoveHint::new(
            sub.root_id,
            sub.id,
            dst_root,
            join_album_path(dst_parent_path, &format!("{}{}", album_name, suffix)),
        ));
    }

    hints
}

#[derive(Debug, Default)]
struct HintTables {
    album_by_src: HashMap<(AlbumRootId, AlbumId), AlbumMoveHint>,
    album_by_dst: HashMap<(AlbumRootId, String), AlbumMoveHint>,
    item_moves: HashMap<ItemId, Arc<ItemMoveHint>>,
    newly_appeared: HashMap<(AlbumId, String), ItemId>,
    item_changes: HashMap<ItemId, ChangeKind>,
    about_to_edit: HashMap<ItemId, MetadataAdjustmentHint>,
    adjusted: HashMap<ItemId, MetadataAdjustmentHint>,
    /// Stamped under the same lock as the insert it belongs to
    last_hint_added: Option<Instant>,
}

impl HintTables {
    fn is_empty(&self) -> bool {
        self.album_by_src.is_empty()
            && self.item_moves.is_empty()
            && self.item_changes.is_empty()
            && self.about_to_edit.is_empty()
            && self.adjusted.is_empty()
    }

    fn clear_all(&mut self) {
        *self = HintTables::default();
    }

    fn insert(&mut self, hint: Hint) {
        match hint {
            Hint::AlbumMove(hint) => {
                self.album_by_dst.insert(
                    (hint.dst_album_root, hint.dst_relative_path.clone()),
                    hint.clone(),
                );
                self.album_by_src
                    .insert((hint.src_album_root, hint.src_album_id), hint);
            }
            Hint::ItemMove(hint) => {
                let hint = Arc::new(hint);
                for (id, name) in &hint.dst_names {
                    self.newly_appeared
                        .insert((hint.dst_album_id, name.clone()), *id);
                    self.item_moves.insert(*id, Arc::clone(&hint));
                }
            }
            Hint::ItemChange(hint) => {
                for id in hint.item_ids {
                    let entry = self.item_changes.entry(id).or_insert(hint.kind);
                    if hint.kind == ChangeKind::NeedsRescan {
                        *entry = ChangeKind::NeedsRescan;
                    }
                }
            }
            Hint::MetadataAdjustment(hint) => self.insert_adjustment(hint),
        }
    }

    fn insert_adjustment(&mut self, hint: MetadataAdjustmentHint) {
        match hint.status {
            AdjustmentStatus::AboutToEdit => {
                if self.about_to_edit.contains_key(&hint.item_id) {
                    // keep the older state, it describes the file before any of the edits
                    log::warn!("Item {} already has an edit in progress", hint.item_id);
                    return;
                }
                self.about_to_edit.insert(hint.item_id, hint);
            }
            AdjustmentStatus::EditFinished => {
                if self.about_to_edit.remove(&hint.item_id).is_none() {
                    log::debug!("Edit of item {} finished without a start hint", hint.item_id);
                    return;
                }
                self.adjusted.insert(hint.item_id, hint);
            }
            AdjustmentStatus::EditAborted => {
                self.about_to_edit.remove(&hint.item_id);
            }
        }
    }
}

/// Process-wide store of hints shared by the application thread, the
/// background worker and single-file scans.
#[derive(Debug)]
pub struct HintCache {
    tables: RwLock<HintTables>,
    quiescence: Duration,
}

impl HintCache {
    /// Create an empty cache with the given quiescence window
    pub fn new(quiescence: Duration) -> Self {
        Self {
            tables: RwLock::new(HintTables::default()),
            quiescence,
        }
    }

    pub fn quiescence(&self) -> Duration {
        self.quiescence
    }

    /// Store a hint and restart the quiescence timer
    pub fn record(&self, hint: impl Into<Hint>) {
        self.record_at(hint.into(), Instant::now());
    }

    /// Store several hints at once
    pub fn record_all<H: Into<Hint>>(&self, hints: impl IntoIterator<Item = H>) {
        let now = Instant::now();
        let mut tables = self.tables.write();
        for hint in hints {
            tables.insert(hint.into());
        }
        tables.last_hint_added = Some(now);
    }

    /// Run the garbage-collection check, then store the hint.
    /// `worker_idle` tells whether no scan is currently running.
    pub fn record_with_gc(&self, hint: impl Into<Hint>, worker_idle: bool) {
        let now = Instant::now();
        self.collect_garbage_at(now, worker_idle);
        self.record_at(hint.into(), now);
    }

    fn record_at(&self, hint: Hint, now: Instant) {
        let mut tables = self.tables.write();
        tables.insert(hint);
        tables.last_hint_added = Some(now);
    }

    /// Clear everything if the last hint is older than the quiescence window
    /// and the worker is idle. Returns whether the cache was cleared.
    pub fn collect_garbage(&self, worker_idle: bool) -> bool {
        self.collect_garbage_at(Instant::now(), worker_idle)
    }

    pub(crate) fn collect_garbage_at(&self, now: Instant, worker_idle: bool) -> bool {
        if !worker_idle {
            return false;
        }
        let mut tables = self.tables.write();
        let Some(added) = tables.last_hint_added else {
            return false;
        };
        if now.saturating_duration_since(added) <= self.quiescence {
            return false;
        }
        tables.clear_all();
        log::debug!("Discarded stale scan hints");
        true
    }

    /// Time left until the current batch becomes stale, `None` when nothing is pending
    pub fn expires_in(&self, now: Instant) -> Option<Duration> {
        let tables = self.tables.read();
        let added = tables.last_hint_added?;
        if tables.is_empty() {
            return None;
        }
        let elapsed = now.saturating_duration_since(added);
        // strictly past the window
        Some(
            self.quiescence
                .saturating_sub(elapsed)
                .saturating_add(Duration::from_millis(1)),
        )
    }

    pub fn clear(&self) {
        self.tables.write().clear_all();
    }

    pub fn is_empty(&self) -> bool {
        self.tables.read().is_empty()
    }

    /// Look up the move of an album by its old identity
    pub fn lookup_album_move(
        &self,
        src_root: AlbumRootId,
        src_id: AlbumId,
    ) -> Option<AlbumMoveHint> {
        self.tables
            .read()
            .album_by_src
            .get(&(src_root, src_id))
            .cloned()
    }

    /// Look up the batch move that contains the item
    pub fn lookup_item_move(&self, src_id: ItemId) -> Option<ItemMoveHint> {
        self.tables
            .read()
            .item_moves
            .get(&src_id)
            .map(|hint| hint.as_ref().clone())
    }

    pub fn lookup_item_change(&self, id: ItemId) -> Option<ChangeKind> {
        self.tables.read().item_changes.get(&id).copied()
    }

    /// The finished edit of the item if any, otherwise the edit in progress
    pub fn lookup_metadata_adjustment(&self, id: ItemId) -> Option<MetadataAdjustmentHint> {
        let tables = self.tables.read();
        tables
            .adjusted
            .get(&id)
            .or_else(|| tables.about_to_edit.get(&id))
            .cloned()
    }

    /// Resolve a newly appeared album directory to the album it came from
    pub fn album_source_for(
        &self,
        dst_root: AlbumRootId,
        dst_path: &str,
    ) -> Option<AlbumMoveHint> {
        self.tables
            .read()
            .album_by_dst
            .get(&(dst_root, dst_path.to_string()))
            .cloned()
    }

    /// Resolve a newly appeared file to the item it came from
    pub fn item_source_for(&self, dst_album: AlbumId, name: &str) -> Option<ItemId> {
        self.tables
            .read()
            .newly_appeared
            .get(&(dst_album, name.to_string()))
            .copied()
    }

    /// Consume the change hint of an item
    pub fn take_item_change(&self, id: ItemId) -> Option<ChangeKind> {
        self.tables.write().item_changes.remove(&id)
    }

    /// Consume the finished-edit hint of an item
    pub fn take_metadata_adjusted(&self, id: ItemId) -> Option<MetadataAdjustmentHint> {
        self.tables.write().adjusted.remove(&id)
    }

    /// Whether a metadata edit of the item is in progress
    pub fn is_being_edited(&self, id: ItemId) -> bool {
        self.tables.read().about_to_edit.contains_key(&id)
    }

    /// Whether any hint may concern the item as it sits in its album
    pub fn has_item_hint(&self, id: ItemId) -> bool {
        let tables = self.tables.read();
        tables.item_changes.contains_key(&id)
            || tables.about_to_edit.contains_key(&id)
            || tables.adjusted.contains_key(&id)
    }
}

impl Default for HintCache {
    fn default() -> Self {
        Self::new(Duration::from_millis(crate::config::DEFAULT_HINT_QUIESCENCE_MS))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cache() -> HintCache {
        HintCache::new(Duration::from_secs(300))
    }

    #[test]
    fn test_album_move_lookup_both_ways() {
        let hints = cache();
        hints.record(AlbumMoveHint::new(1, 5, 1, "/Trips/Japan"));

        let by_src = hints.lookup_album_move(1, 5).unwrap();
        assert_eq!(by_src.dst_relative_path, "/Trips/Japan");

        let by_dst = hints.album_source_for(1, "/Trips/Japan").unwrap();
        assert_eq!(by_dst.src_album_id, 5);

        assert!(hints.lookup_album_move(2, 5).is_none());
        assert!(hints.album_source_for(1, "/Trips").is_none());
    }

    #[test]
    fn test_item_move_hint() {
        let hints = cache();
        let dst = AlbumInfo::new(9, 1, "/Best");
        hints.record(ItemMoveHint::new(
            &[10, 11],
            &dst,
            &["a.jpg".to_string(), "b.jpg".to_string()],
        ));

        let hint = hints.lookup_item_move(11).unwrap();
        assert_eq!(hint.dst_album_id, 9);
        assert_eq!(hint.dst_names.get(&11).map(String::as_str), Some("b.jpg"));
        assert_eq!(hints.item_source_for(9, "a.jpg"), Some(10));
        assert_eq!(hints.item_source_for(9, "c.jpg"), None);
    }

    #[test]
    fn test_item_move_hint_drops_unpaired_ids() {
        let dst = AlbumInfo::new(9, 1, "/Best");
        let hint = ItemMoveHint::new(&[1, 2, 3], &dst, &["a.jpg".to_string()]);
        assert_eq!(hint.src_item_ids.len(), 1);
        assert!(hint.src_item_ids.contains(&1));
    }

    #[test]
    fn test_rescan_dominates_modified() {
        let hints = cache();
        hints.record(ItemChangeHint::new([1], ChangeKind::NeedsRescan));
        hints.record(ItemChangeHint::new([1, 2], ChangeKind::Modified));

        assert_eq!(hints.lookup_item_change(1), Some(ChangeKind::NeedsRescan));
        assert_eq!(hints.lookup_item_change(2), Some(ChangeKind::Modified));
        assert_eq!(hints.take_item_change(2), Some(ChangeKind::Modified));
        assert_eq!(hints.lookup_item_change(2), None);
    }

    #[test]
    fn test_metadata_edit_lifecycle() {
        let hints = cache();
        let start = MetadataAdjustmentHint::new(7, AdjustmentStatus::AboutToEdit, None, Some(10));
        hints.record(start.clone());
        assert!(hints.is_being_edited(7));

        // second start keeps the first
        hints.record(MetadataAdjustmentHint::new(
            7,
            AdjustmentStatus::AboutToEdit,
            None,
            Some(99),
        ));
        assert_eq!(hints.lookup_metadata_adjustment(7), Some(start));

        hints.record(MetadataAdjustmentHint::new(
            7,
            AdjustmentStatus::EditFinished,
            None,
            Some(12),
        ));
        assert!(!hints.is_being_edited(7));
        let finished = hints.lookup_metadata_adjustment(7).unwrap();
        assert_eq!(finished.status, AdjustmentStatus::EditFinished);
        assert_eq!(finished.disk_size, Some(12));
        assert!(hints.take_metadata_adjusted(7).is_some());
        assert!(hints.lookup_metadata_adjustment(7).is_none());
    }

    #[test]
    fn test_aborted_edit_leaves_nothing() {
        let hints = cache();
        hints.record(MetadataAdjustmentHint::new(3, AdjustmentStatus::AboutToEdit, None, None));
        hints.record(MetadataAdjustmentHint::new(3, AdjustmentStatus::EditAborted, None, None));
        assert!(hints.lookup_metadata_adjustment(3).is_none());
        assert!(!hints.has_item_hint(3));
    }

    #[test]
    fn test_finished_without_start_is_ignored() {
        let hints = cache();
        hints.record(MetadataAdjustmentHint::new(4, AdjustmentStatus::EditFinished, None, None));
        assert!(hints.lookup_metadata_adjustment(4).is_none());
    }

    #[test]
    fn test_garbage_collection_window() {
        let hints = HintCache::new(Duration::from_secs(60));
        let t0 = Instant::now();
        hints.record_at(AlbumMoveHint::new(1, 5, 1, "/X").into(), t0);

        // busy worker never collects
        assert!(!hints.collect_garbage_at(t0 + Duration::from_secs(120), false));
        // inside the window
        assert!(!hints.collect_garbage_at(t0 + Duration::from_secs(59), true));
        assert!(hints.lookup_album_move(1, 5).is_some());
        // past the window
        assert!(hints.collect_garbage_at(t0 + Duration::from_secs(61), true));
        assert!(hints.is_empty());
        assert!(hints.expires_in(t0 + Duration::from_secs(61)).is_none());
    }

    #[test]
    fn test_collection_racing_a_record_keeps_the_new_hint() {
        let hints = Arc::new(HintCache::new(Duration::from_millis(50)));
        let stale = Instant::now();
        std::thread::sleep(Duration::from_millis(60));

        for id in 0..200 {
            hints.record_at(ItemChangeHint::new([1000 + id], ChangeKind::Modified).into(), stale);
            let collector = {
                let hints = Arc::clone(&hints);
                std::thread::spawn(move || hints.collect_garbage(true))
            };
            hints.record(ItemChangeHint::new([id], ChangeKind::Modified));
            collector.join().unwrap();
            assert_eq!(hints.lookup_item_change(id), Some(ChangeKind::Modified));
        }
    }

    #[test]
    fn test_expires_in_counts_down() {
        let hints = HintCache::new(Duration::from_secs(60));
        let t0 = Instant::now();
        assert!(hints.expires_in(t0).is_none());

        hints.record_at(ItemChangeHint::new([1], ChangeKind::Modified).into(), t0);
        let left = hints.expires_in(t0 + Duration::from_secs(20)).unwrap();
        assert!(left > Duration::from_secs(39) && left <= Duration::from_secs(41));
    }

    #[test]
    fn test_hints_for_album_tree() {
        let album = AlbumInfo::new(5, 1, "/Japan");
        let subs = vec![
            AlbumInfo::new(6, 1, "/Japan/Kyoto"),
            AlbumInfo::new(7, 1, "/Japan/Kyoto/Temples"),
            AlbumInfo::new(8, 1, "/Japanese"),
        ];
        let hints = hints_for_album_tree(&album, &subs, 2, "/Trips", "Japan 2019");

        let paths: Vec<_> = hints.iter().map(|h| h.dst_relative_path.as_str()).collect();
        assert_eq!(
            paths,
            vec![
                "/Trips/Japan 2019",
                "/Trips/Japan 2019/Kyoto",
                "/Trips/Japan 2019/Kyoto/Temples"
            ]
        );
        assert!(hints.iter().all(|h| h.dst_album_root == 2));
    }

    #[test]
    fn test_hints_for_album_tree_into_root() {
        let album = AlbumInfo::new(5, 1, "/Japan");
        let hints = hints_for_album_tree(&album, &[], 1, "/", "Japan");
        assert_eq!(hints[0].dst_relative_path, "/Japan");
    }

    #[test]
    fn test_metadata_hint_from_missing_file() {
        let hint = MetadataAdjustmentHint::from_disk(
            1,
            AdjustmentStatus::AboutToEdit,
            Path::new("/definitely/not/here.jpg"),
        );
        assert!(hint.disk_mod_time.is_none());
        assert!(hint.disk_size.is_none());
    }
}
