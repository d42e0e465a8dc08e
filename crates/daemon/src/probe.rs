//! Source media probing.
//!
//! Runs the prober binary once per job to learn the source duration, which turns
//! encoded time into a progress fraction. Probe failures are never fatal: the
//! supervisor can still pick the duration up from the encoder's own banner.

use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;
use tokio::process::Command;

/// Error type for probe operations.
#[derive(Debug, Error)]
pub enum ProbeError {
    /// Prober could not be executed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Prober ran but reported an error.
    #[error("Probe failed: {0}")]
    Failed(String),

    /// Prober output could not be interpreted.
    #[error("Failed to parse probe output: {0}")]
    Parse(String),
}

/// What the engine needs to know about a source file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MediaProbe {
    /// Duration in seconds, when the container reports one.
    pub duration: Option<f64>,
    pub video_codec: Option<String>,
    pub width: Option<u32>,
    pub height: Option<u32>,
}

/// Raw prober JSON structures.
mod probe_json {
    use serde::Deserialize;

    #[derive(Debug, Deserialize)]
    pub struct ProbeOutput {
        pub streams: Option<Vec<Stream>>,
        pub format: Option<Format>,
    }

    #[derive(Debug, Deserialize)]
    pub struct Stream {
        pub codec_type: Option<String>,
        pub codec_name: Option<String>,
        pub width: Option<u32>,
        pub height: Option<u32>,
    }

    #[derive(Debug, Deserialize)]
    pub struct Format {
        pub duration: Option<String>,
    }
}

/// Probe `media_path` with the prober at `prober_path`.
///
/// Runs `<prober> -v error -print_format json -show_format -show_streams <path>`.
pub async fn probe_media(prober_path: &Path, media_path: &Path) -> Result<MediaProbe, ProbeError> {
    let output = Command::new(prober_path)
        .args([
            "-v",
            "error",
            "-print_format",
            "json",
            "-show_format",
            "-show_streams",
        ])
        .arg(media_path)
        .kill_on_drop(true)
        .output()
        .await?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(ProbeError::Failed(format!(
            "prober exited with status {}: {}",
            output.status,
            stderr.trim()
        )));
    }

    parse_probe_output(&String::from_utf8_lossy(&output.stdout))
}

/// Source duration in seconds.
pub async fn probe_duration(prober_path: &Path, media_path: &Path) -> Result<f64, ProbeError> {
    probe_media(prober_path, media_path)
        .await?
        .duration
        .ok_or_else(|| ProbeError::Parse("no duration reported".to_string()))
}

/// Parse prober JSON output.
pub fn parse_probe_output(json_str: &str) -> Result<MediaProbe, ProbeError> {
    let raw: probe_json::ProbeOutput =
        serde_json::from_str(json_str).map_err(|e| ProbeError::Parse(e.to_string()))?;

    let duration = raw
        .format
        .and_then(|f| f.duration)
        .and_then(|d| d.trim().parse::<f64>().ok())
        .filter(|d| d.is_finite() && *d > 0.0);

    let video = raw
        .streams
        .unwrap_or_default()
        .into_iter()
        .find(|s| s.codec_type.as_deref() == Some("video"));

    Ok(MediaProbe {
        duration,
        video_codec: video.as_ref().and_then(|v| v.codec_name.clone()),
        width: video.as_ref().and_then(|v| v.width),
        height: video.as_ref().and_then(|v| v.height),
    })
}
