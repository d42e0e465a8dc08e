//! Encoding presets and the enums they are built from

use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Hardware acceleration method selection.
///
/// `Auto` defers to the detected capability snapshot; `None` forces software.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HwAccel {
    Auto,
    None,
    Vaapi,
    Cuda,
    Qsv,
    Videotoolbox,
}

impl Default for HwAccel {
    fn default() -> Self {
        Self::Auto
    }
}

impl std::fmt::Display for HwAccel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HwAccel::Auto => write!(f, "auto"),
            HwAccel::None => write!(f, "none"),
            HwAccel::Vaapi => write!(f, "vaapi"),
            HwAccel::Cuda => write!(f, "cuda"),
            HwAccel::Qsv => write!(f, "qsv"),
            HwAccel::Videotoolbox => write!(f, "videotoolbox"),
        }
    }
}

impl FromStr for HwAccel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "auto" => Ok(HwAccel::Auto),
            "none" | "software" | "" => Ok(HwAccel::None),
            "vaapi" => Ok(HwAccel::Vaapi),
            "cuda" | "nvenc" => Ok(HwAccel::Cuda),
            "qsv" => Ok(HwAccel::Qsv),
            "videotoolbox" => Ok(HwAccel::Videotoolbox),
            other => Err(format!("unknown hardware acceleration method: {}", other)),
        }
    }
}

/// Target video codec.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VideoCodec {
    H264,
    Hevc,
    Vp9,
    Av1,
}

impl std::fmt::Display for VideoCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VideoCodec::H264 => write!(f, "h264"),
            VideoCodec::Hevc => write!(f, "hevc"),
            VideoCodec::Vp9 => write!(f, "vp9"),
            VideoCodec::Av1 => write!(f, "av1"),
        }
    }
}

/// Output container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Container {
    Mp4,
    Mkv,
    Webm,
    Mov,
}

impl Container {
    /// File extension without the leading dot.
    pub fn extension(&self) -> &'static str {
        match self {
            Container::Mp4 => "mp4",
            Container::Mkv => "mkv",
            Container::Webm => "webm",
            Container::Mov => "mov",
        }
    }

    /// Whether the container can carry the given video codec.
    pub fn supports(&self, codec: VideoCodec) -> bool {
        use VideoCodec::*;
        match self {
            Container::Mp4 | Container::Mov => matches!(codec, H264 | Hevc | Av1),
            Container::Mkv => true,
            Container::Webm => matches!(codec, Vp9 | Av1),
        }
    }

    /// Audio codec used when the preset does not name one.
    pub fn default_audio_codec(&self) -> &'static str {
        match self {
            Container::Webm => "libopus",
            _ => "aac",
        }
    }
}

impl std::fmt::Display for Container {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.extension())
    }
}

/// Coarse quality knob, mapped per encoder to CRF, QP, preset level or bitrate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Quality {
    High,
    Medium,
    Low,
}

impl Default for Quality {
    fn default() -> Self {
        Self::Medium
    }
}

impl std::fmt::Display for Quality {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Quality::High => write!(f, "high"),
            Quality::Medium => write!(f, "medium"),
            Quality::Low => write!(f, "low"),
        }
    }
}

/// A named bundle of encoding parameters.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Preset {
    pub name: String,
    /// `360p`..`2160p`, an explicit `WxH`, or `original` to keep the source size
    #[serde(default = "default_scale")]
    pub scale: String,
    #[serde(default = "default_codec")]
    pub codec: VideoCodec,
    #[serde(default = "default_container")]
    pub container: Container,
    #[serde(default)]
    pub quality: Quality,
    /// Explicit CRF for software encodes, overriding `quality`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub crf: Option<u8>,
    /// Capped bitrate such as `4M` or `2500k`; mutually exclusive with `crf`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bitrate: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audio_codec: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audio_bitrate: Option<String>,
    /// Per-preset override of the global acceleration method
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hw_accel: Option<HwAccel>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hw_device: Option<String>,
    /// When false a hardware failure fails the job instead of escalating tiers
    #[serde(default = "default_allow_hw_failover")]
    pub allow_hw_failover: bool,
}

fn default_scale() -> String {
    "1080p".to_string()
}

fn default_codec() -> VideoCodec {
    VideoCodec::H264
}

fn default_container() -> Container {
    Container::Mp4
}

fn default_allow_hw_failover() -> bool {
    true
}

impl Preset {
    /// Create a preset with default parameters.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            scale: default_scale(),
            codec: default_codec(),
            container: default_container(),
            quality: Quality::default(),
            crf: None,
            bitrate: None,
            audio_codec: None,
            audio_bitrate: None,
            hw_accel: None,
            hw_device: None,
            allow_hw_failover: default_allow_hw_failover(),
        }
    }
}

/// Presets used when the configuration file defines none.
pub fn default_presets() -> Vec<Preset> {
    let mut high = Preset::new("high");
    high.scale = "1080p".to_string();
    high.quality = Quality::High;
    high.audio_bitrate = Some("192k".to_string());

    let mut medium = Preset::new("medium");
    medium.scale = "720p".to_string();
    medium.quality = Quality::Medium;
    medium.audio_bitrate = Some("128k".to_string());

    let mut low = Preset::new("low");
    low.scale = "480p".to_string();
    low.quality = Quality::Low;
    low.audio_bitrate = Some("96k".to_string());

    vec![high, medium, low]
}
