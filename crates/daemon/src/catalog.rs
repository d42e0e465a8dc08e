//! Media catalog: where jobs resolve their source file from a media id.
//!
//! The engine only needs [`MediaCatalog::get_media`]. [`DirectoryCatalog`] builds
//! a catalog by walking library roots on disk; [`StaticCatalog`] holds an explicit
//! list of items (one-shot transcodes, tests).

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use uuid::Uuid;
use walkdir::{DirEntry, WalkDir};

/// Media file extensions picked up by the directory scan
const MEDIA_EXTENSIONS: &[&str] = &["mkv", "mp4", "avi", "mov", "m4v", "webm"];

/// Kind of media item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaKind {
    Movie,
    Episode,
}

impl std::fmt::Display for MediaKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MediaKind::Movie => write!(f, "movie"),
            MediaKind::Episode => write!(f, "episode"),
        }
    }
}

/// A transcodable media item.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MediaItem {
    pub id: String,
    pub title: String,
    pub year: Option<i32>,
    pub path: PathBuf,
    pub kind: MediaKind,
    pub show_id: Option<String>,
    pub show_title: Option<String>,
    pub season: Option<u32>,
    pub episode: Option<u32>,
}

/// Source of media items for job submission.
pub trait MediaCatalog: Send + Sync {
    fn get_media(&self, id: &str) -> Option<MediaItem>;

    /// All known items, for listing.
    fn list_media(&self) -> Vec<MediaItem> {
        Vec::new()
    }
}

/// Catalog over a fixed set of items.
#[derive(Debug, Clone, Default)]
pub struct StaticCatalog {
    items: HashMap<String, MediaItem>,
}

impl StaticCatalog {
    pub fn new(items: impl IntoIterator<Item = MediaItem>) -> Self {
        Self {
            items: items.into_iter().map(|m| (m.id.clone(), m)).collect(),
        }
    }

    /// Catalog holding a single file, identified by its stable path id.
    pub fn single_file(path: &Path) -> (Self, String) {
        let item = movie_from_path(path);
        let id = item.id.clone();
        (Self::new([item]), id)
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

impl MediaCatalog for StaticCatalog {
    fn get_media(&self, id: &str) -> Option<MediaItem> {
        self.items.get(id).cloned()
    }

    fn list_media(&self) -> Vec<MediaItem> {
        let mut items: Vec<_> = self.items.values().cloned().collect();
        items.sort_by(|a, b| a.path.cmp(&b.path));
        items
    }
}

/// Catalog built by walking library directories.
///
/// Files whose name carries an `SxxEyy` marker become episodes of the show named
/// by their directory; everything else is a movie. Ids are derived from paths so
/// they survive a rescan.
#[derive(Debug, Clone, Default)]
pub struct DirectoryCatalog {
    inner: StaticCatalog,
}

impl DirectoryCatalog {
    pub fn scan<P: AsRef<Path>>(roots: &[P]) -> Self {
        let mut items = Vec::new();
        for root in roots {
            let walker = WalkDir::new(root.as_ref())
                .follow_links(true)
                .into_iter()
                .filter_map(|entry| match entry {
                    Ok(entry) => Some(entry),
                    Err(e) => {
                        log::warn!("Skipping unreadable library entry: {}", e);
                        None
                    }
                });

            for entry in walker.filter(is_media_file) {
                items.push(item_from_path(entry.path()));
            }
        }
        log::info!("Library scan found {} media items", items.len());
        Self {
            inner: StaticCatalog::new(items),
        }
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

impl MediaCatalog for DirectoryCatalog {
    fn get_media(&self, id: &str) -> Option<MediaItem> {
        self.inner.get_media(id)
    }

    fn list_media(&self) -> Vec<MediaItem> {
        self.inner.list_media()
    }
}

fn is_media_file(entry: &DirEntry) -> bool {
    entry.file_type().is_file()
        && entry
            .path()
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| MEDIA_EXTENSIONS.contains(&e.to_lowercase().as_str()))
            .unwrap_or(false)
}

fn stable_id(path: &Path) -> String {
    Uuid::new_v5(&Uuid::NAMESPACE_URL, path.to_string_lossy().as_bytes()).to_string()
}

fn item_from_path(path: &Path) -> MediaItem {
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_default();

    match parse_season_episode(&stem) {
        Some((season, episode)) => {
            let show_dir = show_directory(path);
            let show_title = show_dir
                .and_then(|d| d.file_name())
                .map(|n| n.to_string_lossy().to_string());
            MediaItem {
                id: stable_id(path),
                title: stem.replace('.', " ").trim().to_string(),
                year: None,
                path: path.to_path_buf(),
                kind: MediaKind::Episode,
                show_id: show_dir.map(stable_id),
                show_title,
                season: Some(season),
                episode: Some(episode),
            }
        }
        None => movie_from_path(path),
    }
}

fn movie_from_path(path: &Path) -> MediaItem {
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_default();
    let (title, year) = parse_title_year(&stem);
    MediaItem {
        id: stable_id(path),
        title,
        year,
        path: path.to_path_buf(),
        kind: MediaKind::Movie,
        show_id: None,
        show_title: None,
        season: None,
        episode: None,
    }
}

/// The show folder for an episode: the parent, or the grandparent when the
/// parent is a `Season NN` folder.
fn show_directory(path: &Path) -> Option<&Path> {
    let parent = path.parent()?;
    let is_season_dir = parent
        .file_name()
        .map(|n| n.to_string_lossy().to_lowercase().starts_with("season"))
        .unwrap_or(false);
    if is_season_dir {
        parent.parent()
    } else {
        Some(parent)
    }
}

/// Split `Title (2010)` into its title and year.
pub fn parse_title_year(stem: &str) -> (String, Option<i32>) {
    let trimmed = stem.trim();
    if let Some(open) = trimmed.rfind('(') {
        if let Some(inner) = trimmed[open + 1..].strip_suffix(')') {
            if inner.len() == 4 {
                if let Ok(year) = inner.parse::<i32>() {
                    let title = trimmed[..open].replace('.', " ").trim().to_string();
                    return (title, Some(year));
                }
            }
        }
    }
    (trimmed.replace('.', " ").trim().to_string(), None)
}

/// Find an `SxxEyy` marker in a file name.
pub fn parse_season_episode(name: &str) -> Option<(u32, u32)> {
    let bytes = name.as_bytes();
    for start in 0..bytes.len() {
        if !bytes[start].eq_ignore_ascii_case(&b's') {
            continue;
        }
        if start > 0 && bytes[start - 1].is_ascii_alphanumeric() {
            continue;
        }
        let season_end = digits_end(bytes, start + 1);
        if season_end == start + 1 || season_end >= bytes.len() {
            continue;
        }
        if !bytes[season_end].eq_ignore_ascii_case(&b'e') {
            continue;
        }
        let episode_end = digits_end(bytes, season_end + 1);
        if episode_end == season_end + 1 {
            continue;
        }
        let season = name[start + 1..season_end].parse().ok()?;
        let episode = name[season_end + 1..episode_end].parse().ok()?;
        return Some((season, episode));
    }
    None
}

fn digits_end(bytes: &[u8], from: usize) -> usize {
    let mut end = from;
    while end < bytes.len() && bytes[end].is_ascii_digit() {
        end += 1;
    }
    end
}

#[cfg(test)]
pub(crate) fn test_media(id: &str) -> MediaItem {
    MediaItem {
        id: id.to_string(),
        title: format!("Title {}", id),
        year: Some(2020),
        path: PathBuf::from(format!("/media/{}.mkv", id)),
        kind: MediaKind::Movie,
        show_id: None,
        show_title: None,
        season: None,
        episode: None,
    }
}
