//! Core data models shared by the coordinator, the hints and the catalog

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Catalog id of an item (one file)
pub type ItemId = i64;

/// Catalog id of an album (one directory)
pub type AlbumId = i64;

/// Catalog id of an album root (one collection location)
pub type AlbumRootId = i64;

/// Item status recorded by the last scan that touched it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ItemStatus {
    /// Item appeared without any known origin
    #[default]
    New,
    /// Item content or metadata changed
    Modified,
    /// Item unchanged since the previous scan
    Unchanged,
    /// Item was relocated under a new album or name
    Moved,
    /// Item was created as a copy of another item
    Copied,
}

impl ItemStatus {
    /// Get string representation
    pub fn as_str(&self) -> &'static str {
        match self {
            ItemStatus::New => "new",
            ItemStatus::Modified => "modified",
            ItemStatus::Unchanged => "unchanged",
            ItemStatus::Moved => "moved",
            ItemStatus::Copied => "copied",
        }
    }

    /// Parse the stored representation; unknown values read as unchanged
    pub fn from_str_lossy(s: &str) -> Self {
        match s {
            "new" => ItemStatus::New,
            "modified" => ItemStatus::Modified,
            "moved" => ItemStatus::Moved,
            "copied" => ItemStatus::Copied,
            _ => ItemStatus::Unchanged,
        }
    }
}

/// Media type classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaType {
    Video,
    Image,
    Audio,
    Unknown,
}

impl MediaType {
    /// Infer media type from file extension
    pub fn from_extension(ext: &str) -> Self {
        match ext.to_lowercase().as_str() {
            "mp4" | "mkv" | "avi" | "wmv" | "flv" | "mov" | "webm" | "m4v" | "mts" | "3gp" => {
                MediaType::Video
            }
            "jpg" | "jpeg" | "png" | "gif" | "webp" | "bmp" | "tiff" | "tif" | "heic" | "cr2"
            | "nef" | "arw" | "dng" | "orf" | "raf" => MediaType::Image,
            "mp3" | "flac" | "wav" | "aac" | "ogg" | "m4a" => MediaType::Audio,
            _ => MediaType::Unknown,
        }
    }

    /// Get the string representation
    pub fn as_str(&self) -> &'static str {
        match self {
            MediaType::Video => "video",
            MediaType::Image => "image",
            MediaType::Audio => "audio",
            MediaType::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for MediaType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A registered collection location
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlbumRootInfo {
    pub id: AlbumRootId,
    pub path: PathBuf,
}

/// An album as known to the application.
///
/// `relative_path` is relative to the album root and always starts with `/`;
/// the root directory itself is the album `/`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlbumInfo {
    pub id: AlbumId,
    pub root_id: AlbumRootId,
    pub relative_path: String,
}

impl AlbumInfo {
    pub fn new(id: AlbumId, root_id: AlbumRootId, relative_path: impl Into<String>) -> Self {
        Self {
            id,
            root_id,
            relative_path: relative_path.into(),
        }
    }

    /// Last path component, or `/` for the root album
    pub fn title(&self) -> &str {
        if self.relative_path == "/" {
            return "/";
        }
        self.relative_path
            .rsplit('/')
            .next()
            .unwrap_or(self.relative_path.as_str())
    }
}

/// Handle to a catalogued item together with its location on disk
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemInfo {
    pub id: ItemId,
    pub album_id: AlbumId,
    pub name: String,
    /// Full path of the file on disk
    pub path: PathBuf,
}

impl ItemInfo {
    pub fn new(id: ItemId, album_id: AlbumId, name: impl Into<String>, path: PathBuf) -> Self {
        Self {
            id,
            album_id,
            name: name.into(),
            path,
        }
    }
}

/// Join an album path and a child name without producing `//`
pub fn join_album_path(parent: &str, child: &str) -> String {
    if parent == "/" || parent.is_empty() {
        format!("/{}", child.trim_start_matches('/'))
    } else {
        format!("{}/{}", parent.trim_end_matches('/'), child.trim_start_matches('/'))
    }
}

/// Directory of the album `relative_path` below `root`
pub fn album_directory(root: &Path, relative_path: &str) -> PathBuf {
    let relative = relative_path.trim_start_matches('/');
    if relative.is_empty() {
        root.to_path_buf()
    } else {
        root.join(relative)
    }
}

/// Album path of `dir` relative to `root`, `None` if `dir` lies outside it
pub fn relative_album_path(root: &Path, dir: &Path) -> Option<String> {
    let relative = dir.strip_prefix(root).ok()?;
    let parts: Vec<String> = relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect();
    Some(format!("/{}", parts.join("/")))
}

/// Current modification time of a file as Unix seconds
pub fn unix_mtime(metadata: &std::fs::Metadata) -> i64 {
    metadata
        .modified()
        .ok()
        .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_media_type_from_extension() {
        assert_eq!(MediaType::from_extension("JPG"), MediaType::Image);
        assert_eq!(MediaType::from_extension("nef"), MediaType::Image);
        assert_eq!(MediaType::from_extension("mov"), MediaType::Video);
        assert_eq!(MediaType::from_extension("flac"), MediaType::Audio);
        assert_eq!(MediaType::from_extension("txt"), MediaType::Unknown);
    }

    #[test]
    fn test_item_status_round_trip_names() {
        for status in [
            ItemStatus::New,
            ItemStatus::Modified,
            ItemStatus::Unchanged,
            ItemStatus::Moved,
            ItemStatus::Copied,
        ] {
            assert_eq!(ItemStatus::from_str_lossy(status.as_str()), status);
        }
        assert_eq!(ItemStatus::from_str_lossy("bogus"), ItemStatus::Unchanged);
    }

    #[test]
    fn test_album_title() {
        assert_eq!(AlbumInfo::new(1, 1, "/Trips/Japan").title(), "Japan");
        assert_eq!(AlbumInfo::new(1, 1, "/Trips").title(), "Trips");
        assert_eq!(AlbumInfo::new(1, 1, "/").title(), "/");
    }

    #[test]
    fn test_join_album_path() {
        assert_eq!(join_album_path("/", "Japan"), "/Japan");
        assert_eq!(join_album_path("/Trips", "Japan"), "/Trips/Japan");
        assert_eq!(join_album_path("/Trips/", "Japan/Kyoto"), "/Trips/Japan/Kyoto");
    }

    #[test]
    fn test_album_directory_and_relative_path() {
        let root = Path::new("/photos");
        assert_eq!(album_directory(root, "/"), PathBuf::from("/photos"));
        assert_eq!(
            album_directory(root, "/Trips/Japan"),
            PathBuf::from("/photos/Trips/Japan")
        );

        assert_eq!(relative_album_path(root, root).as_deref(), Some("/"));
        assert_eq!(
            relative_album_path(root, Path::new("/photos/Trips/Japan")).as_deref(),
            Some("/Trips/Japan")
        );
        assert_eq!(relative_album_path(root, Path::new("/music")), None);
    }
}
