//! Encoder command construction
//!
//! Builds the ffmpeg argument vector for one acceleration tier. The builder is
//! pure: it never touches the filesystem or spawns anything, so every
//! `(codec, tier, quality)` combination can be checked against its expected argv.

use crate::capabilities::Acceleration;
use crate::config::{Container, HwAccel, Preset, Quality, VideoCodec};
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

/// Error type for command construction
#[derive(Debug, Error, PartialEq)]
pub enum BuildError {
    /// A preset field is malformed (scale, quality or bitrate)
    #[error("Invalid preset parameter: {0}")]
    InvalidPresetParameter(String),

    /// The container cannot carry the codec
    #[error("Codec {codec} is not supported in a {container} container")]
    UnsupportedCodec {
        codec: VideoCodec,
        container: Container,
    },

    /// A hardware tier was requested for a codec the method cannot encode
    #[error("{method} has no hardware encoder for {codec}")]
    NoHardwareEncoder { method: HwAccel, codec: VideoCodec },
}

/// One acceleration strategy attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Tier {
    /// Hardware decode, hardware scaling filter, hardware encode
    PrimaryHw,
    /// Same backend; frames round-trip through system memory so pixel formats
    /// the hardware decoder cannot hand over directly are converted first
    AltHw,
    /// Hardware decode, software scale and encode
    Hybrid,
    /// No hardware involvement
    Software,
}

impl Tier {
    /// Whether the tier uses a hardware encoder.
    pub fn encodes_in_hardware(&self) -> bool {
        matches!(self, Tier::PrimaryHw | Tier::AltHw)
    }
}

impl std::fmt::Display for Tier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Tier::PrimaryHw => write!(f, "primary-hw"),
            Tier::AltHw => write!(f, "alt-hw"),
            Tier::Hybrid => write!(f, "hybrid"),
            Tier::Software => write!(f, "software"),
        }
    }
}

/// Target frame size.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

/// Parse a preset scale: a named height (`720p`), `WxH`, or `original`.
///
/// Returns `None` when the source size should be kept.
pub fn parse_scale(scale: &str) -> Result<Option<Resolution>, BuildError> {
    let s = scale.trim().to_lowercase();
    let named = match s.as_str() {
        "" | "original" | "source" => return Ok(None),
        "360p" => Some((640, 360)),
        "480p" => Some((854, 480)),
        "720p" => Some((1280, 720)),
        "1080p" => Some((1920, 1080)),
        "1440p" => Some((2560, 1440)),
        "2160p" | "4k" => Some((3840, 2160)),
        _ => None,
    };
    if let Some((width, height)) = named {
        return Ok(Some(Resolution { width, height }));
    }

    let invalid = || BuildError::InvalidPresetParameter(format!("unrecognized scale '{}'", scale));
    let (w, h) = s.split_once('x').ok_or_else(invalid)?;
    let width: u32 = w.parse().map_err(|_| invalid())?;
    let height: u32 = h.parse().map_err(|_| invalid())?;
    if width == 0 || height == 0 || width > 16384 || height > 16384 {
        return Err(invalid());
    }
    Ok(Some(Resolution { width, height }))
}

/// Parse a bitrate such as `2500k` or `4M` into kbit/s.
pub fn parse_bitrate(bitrate: &str) -> Result<u32, BuildError> {
    let invalid = || {
        BuildError::InvalidPresetParameter(format!(
            "bitrate '{}' must be a number followed by k or M",
            bitrate
        ))
    };
    let b = bitrate.trim();
    let (number, multiplier) = if let Some(n) = b.strip_suffix(['k', 'K']) {
        (n, 1.0)
    } else if let Some(n) = b.strip_suffix(['m', 'M']) {
        (n, 1000.0)
    } else {
        return Err(invalid());
    };
    let value: f64 = number.parse().map_err(|_| invalid())?;
    if !value.is_finite() || value <= 0.0 {
        return Err(invalid());
    }
    let kbps = (value * multiplier).round();
    if kbps < 1.0 || kbps > u32::MAX as f64 {
        return Err(invalid());
    }
    Ok(kbps as u32)
}

/// Validated, encoder-independent view of a preset's quality settings.
#[derive(Debug, Clone, PartialEq)]
pub struct EncodeSettings {
    pub scale: Option<Resolution>,
    pub bitrate_kbps: Option<u32>,
    pub crf: Option<u8>,
}

/// Validate a preset before any process is launched.
pub fn validate_preset(preset: &Preset) -> Result<EncodeSettings, BuildError> {
    if !preset.container.supports(preset.codec) {
        return Err(BuildError::UnsupportedCodec {
            codec: preset.codec,
            container: preset.container,
        });
    }
    let scale = parse_scale(&preset.scale)?;
    let bitrate_kbps = preset.bitrate.as_deref().map(parse_bitrate).transpose()?;
    if preset.crf.is_some() && bitrate_kbps.is_some() {
        return Err(BuildError::InvalidPresetParameter(
            "crf and bitrate are mutually exclusive".to_string(),
        ));
    }
    if let Some(crf) = preset.crf {
        let max = match preset.codec {
            VideoCodec::H264 | VideoCodec::Hevc => 51,
            VideoCodec::Vp9 | VideoCodec::Av1 => 63,
        };
        if crf > max {
            return Err(BuildError::InvalidPresetParameter(format!(
                "crf {} is outside 0-{} for {}",
                crf, max, preset.codec
            )));
        }
    }
    if let Some(audio_bitrate) = preset.audio_bitrate.as_deref() {
        parse_bitrate(audio_bitrate)?;
    }
    Ok(EncodeSettings {
        scale,
        bitrate_kbps,
        crf: preset.crf,
    })
}

/// Software encoder for a codec.
pub fn software_encoder(codec: VideoCodec) -> &'static str {
    match codec {
        VideoCodec::H264 => "libx264",
        VideoCodec::Hevc => "libx265",
        VideoCodec::Vp9 => "libvpx-vp9",
        VideoCodec::Av1 => "libsvtav1",
    }
}

/// Hardware encoder for a codec on a method, if the method has one.
pub fn hardware_encoder(method: HwAccel, codec: VideoCodec) -> Option<&'static str> {
    use VideoCodec::*;
    match (method, codec) {
        (HwAccel::Vaapi, H264) => Some("h264_vaapi"),
        (HwAccel::Vaapi, Hevc) => Some("hevc_vaapi"),
        (HwAccel::Vaapi, Vp9) => Some("vp9_vaapi"),
        (HwAccel::Vaapi, Av1) => Some("av1_vaapi"),
        (HwAccel::Cuda, H264) => Some("h264_nvenc"),
        (HwAccel::Cuda, Hevc) => Some("hevc_nvenc"),
        (HwAccel::Cuda, Av1) => Some("av1_nvenc"),
        (HwAccel::Qsv, H264) => Some("h264_qsv"),
        (HwAccel::Qsv, Hevc) => Some("hevc_qsv"),
        (HwAccel::Qsv, Vp9) => Some("vp9_qsv"),
        (HwAccel::Qsv, Av1) => Some("av1_qsv"),
        (HwAccel::Videotoolbox, H264) => Some("h264_videotoolbox"),
        (HwAccel::Videotoolbox, Hevc) => Some("hevc_videotoolbox"),
        _ => None,
    }
}

fn software_crf(codec: VideoCodec, quality: Quality) -> u8 {
    match (codec, quality) {
        (VideoCodec::H264, Quality::High) => 20,
        (VideoCodec::H264, Quality::Medium) => 23,
        (VideoCodec::H264, Quality::Low) => 28,
        (VideoCodec::Hevc, Quality::High) => 22,
        (VideoCodec::Hevc, Quality::Medium) => 26,
        (VideoCodec::Hevc, Quality::Low) => 30,
        (VideoCodec::Vp9, Quality::High) => 28,
        (VideoCodec::Vp9, Quality::Medium) => 33,
        (VideoCodec::Vp9, Quality::Low) => 38,
        (VideoCodec::Av1, Quality::High) => 28,
        (VideoCodec::Av1, Quality::Medium) => 33,
        (VideoCodec::Av1, Quality::Low) => 40,
    }
}

/// Constant quantizer for device-backed encoders.
fn device_qp(quality: Quality) -> u8 {
    match quality {
        Quality::High => 20,
        Quality::Medium => 25,
        Quality::Low => 30,
    }
}

/// NVENC speed/quality preset and constant-quality target.
fn nvenc_preset(quality: Quality) -> (&'static str, u8) {
    match quality {
        Quality::High => ("p7", 21),
        Quality::Medium => ("p5", 26),
        Quality::Low => ("p3", 31),
    }
}

/// Bitrate cap used by encoders that only take a target rate.
fn capped_bitrate_kbps(scale: Option<Resolution>, quality: Quality) -> u32 {
    let base = match scale.map(|r| r.height) {
        Some(h) if h >= 2160 => 16000,
        Some(h) if h >= 1440 => 10000,
        Some(h) if h >= 1080 => 6000,
        Some(h) if h >= 720 => 3500,
        Some(h) if h >= 480 => 1500,
        Some(_) => 900,
        None => 6000,
    };
    match quality {
        Quality::High => base * 3 / 2,
        Quality::Medium => base,
        Quality::Low => base * 3 / 5,
    }
}

fn push(args: &mut Vec<String>, items: &[&str]) {
    args.extend(items.iter().map(|s| s.to_string()));
}

fn rate_cap_args(args: &mut Vec<String>, kbps: u32) {
    push(
        args,
        &[
            "-b:v",
            &format!("{}k", kbps),
            "-maxrate",
            &format!("{}k", kbps),
            "-bufsize",
            &format!("{}k", kbps * 2),
        ],
    );
}

/// Decoder-side options placed before `-i`.
fn input_args(args: &mut Vec<String>, tier: Tier, accel: &Acceleration) {
    let device = accel.device.as_deref();
    match (accel.method, tier) {
        (HwAccel::Vaapi, Tier::PrimaryHw) => {
            push(args, &["-hwaccel", "vaapi"]);
            if let Some(d) = device {
                push(args, &["-hwaccel_device", d]);
            }
            push(args, &["-hwaccel_output_format", "vaapi"]);
        }
        (HwAccel::Vaapi, Tier::AltHw) => {
            if let Some(d) = device {
                push(args, &["-init_hw_device", &format!("vaapi=va:{}", d)]);
            } else {
                push(args, &["-init_hw_device", "vaapi=va"]);
            }
            push(args, &["-filter_hw_device", "va", "-hwaccel", "vaapi"]);
            if let Some(d) = device {
                push(args, &["-hwaccel_device", d]);
            }
        }
        (HwAccel::Qsv, Tier::PrimaryHw) => {
            push(args, &["-hwaccel", "qsv"]);
            if let Some(d) = device {
                push(args, &["-qsv_device", d]);
            }
            push(args, &["-hwaccel_output_format", "qsv"]);
        }
        (HwAccel::Qsv, Tier::AltHw) => {
            push(args, &["-init_hw_device", "qsv=qs:hw", "-filter_hw_device", "qs", "-hwaccel", "qsv"]);
            if let Some(d) = device {
                push(args, &["-qsv_device", d]);
            }
        }
        (HwAccel::Cuda, Tier::PrimaryHw) => {
            push(args, &["-hwaccel", "cuda"]);
            if let Some(d) = device {
                push(args, &["-hwaccel_device", d]);
            }
            push(args, &["-hwaccel_output_format", "cuda"]);
        }
        (HwAccel::Videotoolbox, Tier::PrimaryHw) => {
            push(args, &["-hwaccel", "videotoolbox", "-hwaccel_output_format", "videotoolbox_vld"]);
        }
        // Remaining hardware tiers decode on the device into system memory
        (method, _) => {
            push(args, &["-hwaccel", &method.to_string()]);
            if let Some(d) = device {
                match method {
                    HwAccel::Qsv => push(args, &["-qsv_device", d]),
                    HwAccel::Videotoolbox => {}
                    _ => push(args, &["-hwaccel_device", d]),
                }
            }
        }
    }
}

/// Filter graph for a hardware-encoding tier.
fn hardware_filter(tier: Tier, method: HwAccel, scale: Option<Resolution>) -> Option<String> {
    let hw_scale = scale.map(|r| match method {
        HwAccel::Vaapi => format!("scale_vaapi=w={}:h={}", r.width, r.height),
        HwAccel::Qsv => format!("scale_qsv=w={}:h={}", r.width, r.height),
        HwAccel::Cuda => format!("scale_cuda={}:{}", r.width, r.height),
        _ => format!("scale_vt=w={}:h={}", r.width, r.height),
    });
    match (tier, method) {
        (Tier::PrimaryHw, _) => hw_scale,
        (_, HwAccel::Vaapi) => Some(join_filters(&["format=nv12", "hwupload"], hw_scale)),
        (_, HwAccel::Qsv) => Some(join_filters(&["format=nv12", "hwupload=extra_hw_frames=64"], hw_scale)),
        // CUDA and VideoToolbox encoders accept nv12 from system memory
        _ => Some(match scale {
            Some(r) => format!("scale={}:{},format=nv12", r.width, r.height),
            None => "format=nv12".to_string(),
        }),
    }
}

fn join_filters(head: &[&str], tail: Option<String>) -> String {
    let mut parts: Vec<String> = head.iter().map(|s| s.to_string()).collect();
    parts.extend(tail);
    parts.join(",")
}

/// Build the encoder argument vector for one tier.
///
/// `accel` is the resolved acceleration method, or `None` when the capability
/// snapshot offers no usable hardware. Without it every tier degrades to a pure
/// software command. Output is always overwritten, and progress is reported as
/// `key=value` lines on stdout.
pub fn build_command(
    input: &Path,
    output: &Path,
    preset: &Preset,
    settings: &EncodeSettings,
    tier: Tier,
    accel: Option<&Acceleration>,
) -> Result<Vec<String>, BuildError> {
    let accel = accel.filter(|_| tier != Tier::Software);
    let mut args = Vec::new();
    push(&mut args, &["-hide_banner", "-y"]);

    if let Some(accel) = accel {
        input_args(&mut args, tier, accel);
    }
    args.push("-i".to_string());
    args.push(input.to_string_lossy().to_string());

    match accel {
        Some(accel) if tier.encodes_in_hardware() => {
            let encoder = hardware_encoder(accel.method, preset.codec).ok_or(
                BuildError::NoHardwareEncoder {
                    method: accel.method,
                    codec: preset.codec,
                },
            )?;
            if let Some(filter) = hardware_filter(tier, accel.method, settings.scale) {
                push(&mut args, &["-vf", &filter]);
            }
            push(&mut args, &["-c:v", encoder]);
            hardware_quality_args(&mut args, accel, preset, settings);
        }
        _ => {
            if let Some(r) = settings.scale {
                push(&mut args, &["-vf", &format!("scale={}:{}", r.width, r.height)]);
            }
            push(&mut args, &["-c:v", software_encoder(preset.codec)]);
            software_quality_args(&mut args, preset, settings);
        }
    }

    audio_args(&mut args, preset);

    if matches!(preset.container, Container::Mp4 | Container::Mov) {
        push(&mut args, &["-movflags", "+faststart"]);
    }
    push(&mut args, &["-progress", "pipe:1", "-nostats"]);
    args.push(output.to_string_lossy().to_string());
    Ok(args)
}

fn software_quality_args(args: &mut Vec<String>, preset: &Preset, settings: &EncodeSettings) {
    match preset.codec {
        VideoCodec::H264 | VideoCodec::Hevc => push(args, &["-preset", "medium"]),
        VideoCodec::Av1 => push(args, &["-preset", "8"]),
        VideoCodec::Vp9 => push(args, &["-row-mt", "1"]),
    }
    match settings.bitrate_kbps {
        Some(kbps) => rate_cap_args(args, kbps),
        None => {
            let crf = settings
                .crf
                .unwrap_or_else(|| software_crf(preset.codec, preset.quality));
            push(args, &["-crf", &crf.to_string()]);
            if preset.codec == VideoCodec::Vp9 {
                // Constant quality mode for libvpx
                push(args, &["-b:v", "0"]);
            }
        }
    }
}

fn hardware_quality_args(
    args: &mut Vec<String>,
    accel: &Acceleration,
    preset: &Preset,
    settings: &EncodeSettings,
) {
    match accel.method {
        HwAccel::Cuda => {
            let (level, cq) = nvenc_preset(preset.quality);
            push(args, &["-preset", level, "-rc", "vbr"]);
            match settings.bitrate_kbps {
                Some(kbps) => rate_cap_args(args, kbps),
                None => push(args, &["-cq", &cq.to_string(), "-b:v", "0"]),
            }
            if let Some(d) = accel.device.as_deref() {
                push(args, &["-gpu", d]);
            }
        }
        HwAccel::Vaapi | HwAccel::Qsv => match settings.bitrate_kbps {
            Some(kbps) => rate_cap_args(args, kbps),
            None => {
                let flag = if accel.method == HwAccel::Vaapi { "-qp" } else { "-global_quality" };
                push(args, &[flag, &device_qp(preset.quality).to_string()]);
            }
        },
        _ => {
            let kbps = settings
                .bitrate_kbps
                .unwrap_or_else(|| capped_bitrate_kbps(settings.scale, preset.quality));
            rate_cap_args(args, kbps);
        }
    }
}

fn audio_args(args: &mut Vec<String>, preset: &Preset) {
    let codec = preset
        .audio_codec
        .as_deref()
        .unwrap_or_else(|| preset.container.default_audio_codec());
    push(args, &["-c:a", codec]);
    if codec != "copy" {
        if let Some(bitrate) = preset.audio_bitrate.as_deref() {
            push(args, &["-b:a", bitrate]);
        }
        if codec == "libopus" || codec == "opus" {
            push(args, &["-ac", "2"]);
        }
    }
}

/// Render an argument vector as a single diagnostic string.
pub fn command_line(program: &Path, args: &[String]) -> String {
    let mut line = program.to_string_lossy().to_string();
    for arg in args {
        line.push(' ');
        if arg.is_empty() || arg.contains(char::is_whitespace) {
            line.push('"');
            line.push_str(arg);
            line.push('"');
        } else {
            line.push_str(arg);
        }
    }
    line
}
