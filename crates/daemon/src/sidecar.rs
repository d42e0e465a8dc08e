//! Sidecar metadata for completed transcodes
//!
//! Each finished output `<name>.<ext>` gets a `<name>.<ext>.json` file next to it
//! describing where it came from. The transcode directory can later be listed
//! from these sidecars alone.

use crate::catalog::{MediaItem, MediaKind};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Error type for sidecar operations
#[derive(Debug, Error)]
pub enum SidecarError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid sidecar JSON: {0}")]
    Json(#[from] serde_json::Error),
}

/// Metadata written beside a completed output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SidecarRecord {
    pub original_path: PathBuf,
    pub media_id: String,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub year: Option<i32>,
    pub kind: MediaKind,
    pub preset_name: String,
    pub completed_at: DateTime<Utc>,
    pub output_size: Option<String>,
    pub duration: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub show_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub show_title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub season_number: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub episode_number: Option<u32>,
}

impl SidecarRecord {
    pub fn new(
        media: &MediaItem,
        preset_name: &str,
        output_size: Option<String>,
        duration: Option<f64>,
    ) -> Self {
        Self {
            original_path: media.path.clone(),
            media_id: media.id.clone(),
            title: media.title.clone(),
            year: media.year,
            kind: media.kind,
            preset_name: preset_name.to_string(),
            completed_at: Utc::now(),
            output_size,
            duration,
            show_id: media.show_id.clone(),
            show_title: media.show_title.clone(),
            season_number: media.season,
            episode_number: media.episode,
        }
    }
}

/// A completed transcode found on disk.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CompletedTranscode {
    pub output_path: PathBuf,
    pub size_bytes: u64,
    #[serde(flatten)]
    pub record: SidecarRecord,
}

/// Sidecar location for an output file.
pub fn sidecar_path(output_path: &Path) -> PathBuf {
    let mut name = output_path.as_os_str().to_owned();
    name.push(".json");
    PathBuf::from(name)
}

pub fn write_sidecar(output_path: &Path, record: &SidecarRecord) -> Result<PathBuf, SidecarError> {
    let path = sidecar_path(output_path);
    let json = serde_json::to_string_pretty(record)?;
    fs::write(&path, json)?;
    Ok(path)
}

pub fn read_sidecar(path: &Path) -> Result<SidecarRecord, SidecarError> {
    let contents = fs::read_to_string(path)?;
    Ok(serde_json::from_str(&contents)?)
}

/// List completed transcodes in `transcode_dir`, newest first.
///
/// Sidecars whose media file is gone are ignored; unreadable ones are skipped
/// with a warning. A missing directory yields an empty list.
pub fn list_completed(transcode_dir: &Path) -> Result<Vec<CompletedTranscode>, SidecarError> {
    let entries = match fs::read_dir(transcode_dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };

    let mut completed = Vec::new();
    for entry in entries {
        let path = entry?.path();
        if path.extension().and_then(|e| e.to_str()) != Some("json") {
            continue;
        }
        // `<name>.<ext>.json` describes `<name>.<ext>`
        let output_path = path.with_extension("");
        let size_bytes = match fs::metadata(&output_path) {
            Ok(meta) if meta.is_file() => meta.len(),
            _ => continue,
        };
        match read_sidecar(&path) {
            Ok(record) => completed.push(CompletedTranscode {
                output_path,
                size_bytes,
                record,
            }),
            Err(e) => log::warn!("Skipping sidecar {}: {}", path.display(), e),
        }
    }

    completed.sort_by(|a, b| b.record.completed_at.cmp(&a.record.completed_at));
    Ok(completed)
}

/// Delete a completed output and its sidecar.
pub fn delete_completed(output_path: &Path) -> Result<(), SidecarError> {
    fs::remove_file(output_path)?;
    match fs::remove_file(sidecar_path(output_path)) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Human-readable file size (`1.50 kB`).
pub fn format_file_size(bytes: u64) -> String {
    humansize::format_size(bytes, humansize::WINDOWS)
}
