//! Hardware acceleration capability detection.
//!
//! Asks the encoder which hardware encoders and `-hwaccel` backends it was built
//! with, then confirms each backend against the host: render nodes for the
//! DRM-based backends, a vendor query tool for GPU-index backends. The result is
//! an immutable [`CapabilitySnapshot`]; detection never fails, it only finds less.

use crate::config::HwAccel;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::process::Command;
use tokio::sync::RwLock;

/// Default directory holding DRM render nodes
pub const DEFAULT_DRI_DIR: &str = "/dev/dri";

/// Default vendor tool used to enumerate GPUs for the cuda backend
pub const DEFAULT_GPU_QUERY_TOOL: &str = "nvidia-smi";

/// Snapshot shared between the engine and running jobs; replaced on refresh.
pub type SharedCapabilities = Arc<RwLock<CapabilitySnapshot>>;

/// A concrete acceleration choice: method plus optional device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Acceleration {
    pub method: HwAccel,
    /// Render node path or GPU index, depending on the method
    pub device: Option<String>,
}

/// A device usable by a method.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HwDevice {
    pub id: String,
    pub name: String,
}

/// Detected hardware capabilities of the host and encoder.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CapabilitySnapshot {
    pub methods: BTreeSet<HwAccel>,
    pub devices: BTreeMap<HwAccel, Vec<HwDevice>>,
    /// Hardware encoder names the encoder reported, per method
    pub encoders: BTreeMap<HwAccel, Vec<String>>,
    pub recommended: Option<Acceleration>,
}

impl CapabilitySnapshot {
    /// Assemble a snapshot from what the encoder reported and the devices found
    /// on the host, keeping only methods that are usable end to end.
    pub fn from_parts(
        encoders: BTreeMap<HwAccel, Vec<String>>,
        hwaccels: BTreeSet<HwAccel>,
        render_nodes: Vec<HwDevice>,
        gpus: Vec<HwDevice>,
    ) -> Self {
        let mut snapshot = Self::default();

        for method in hwaccels {
            let names = match encoders.get(&method) {
                Some(names) if !names.is_empty() => names.clone(),
                _ => continue,
            };
            let devices = match method {
                HwAccel::Vaapi | HwAccel::Qsv => render_nodes.clone(),
                HwAccel::Cuda => gpus.clone(),
                _ => Vec::new(),
            };
            let needs_device = matches!(method, HwAccel::Vaapi | HwAccel::Qsv | HwAccel::Cuda);
            if needs_device && devices.is_empty() {
                log::debug!("Encoder supports {} but no device was found", method);
                continue;
            }

            snapshot.methods.insert(method);
            snapshot.encoders.insert(method, names);
            if !devices.is_empty() {
                snapshot.devices.insert(method, devices);
            }
        }

        snapshot.recommended = snapshot.recommend();
        snapshot
    }

    /// Render-node backends first, then GPU-index backends, then OS-native ones.
    fn recommend(&self) -> Option<Acceleration> {
        [
            HwAccel::Vaapi,
            HwAccel::Qsv,
            HwAccel::Cuda,
            HwAccel::Videotoolbox,
        ]
        .into_iter()
        .find(|m| self.methods.contains(m))
        .map(|method| Acceleration {
            method,
            device: self.default_device(method),
        })
    }

    fn default_device(&self, method: HwAccel) -> Option<String> {
        self.devices
            .get(&method)
            .and_then(|d| d.first())
            .map(|d| d.id.clone())
    }

    pub fn has_hardware(&self) -> bool {
        !self.methods.is_empty()
    }

    /// Resolve a requested method against this snapshot.
    ///
    /// `Auto` takes the recommendation. An explicit method is honoured only if it
    /// was detected. `device_override` replaces the default device.
    pub fn resolve(&self, requested: HwAccel, device_override: Option<&str>) -> Option<Acceleration> {
        let mut accel = match requested {
            HwAccel::None => return None,
            HwAccel::Auto => self.recommended.clone()?,
            method if self.methods.contains(&method) => Acceleration {
                method,
                device: self.default_device(method),
            },
            method => {
                log::warn!(
                    "Requested hardware acceleration '{}' is not available; using software",
                    method
                );
                return None;
            }
        };
        if let Some(device) = device_override {
            accel.device = Some(device.to_string());
        }
        Some(accel)
    }

    /// Whether `encoder` was reported for `method`. Methods with no encoder list
    /// are trusted.
    pub fn has_encoder(&self, method: HwAccel, encoder: &str) -> bool {
        match self.encoders.get(&method) {
            Some(names) if !names.is_empty() => names.iter().any(|n| n == encoder),
            _ => true,
        }
    }
}

/// Method an encoder name belongs to, by its suffix.
fn encoder_method(name: &str) -> Option<HwAccel> {
    if name.ends_with("_vaapi") {
        Some(HwAccel::Vaapi)
    } else if name.ends_with("_nvenc") {
        Some(HwAccel::Cuda)
    } else if name.ends_with("_qsv") {
        Some(HwAccel::Qsv)
    } else if name.ends_with("_videotoolbox") {
        Some(HwAccel::Videotoolbox)
    } else {
        None
    }
}

/// Parse `-encoders` output into hardware video encoders per method.
pub fn parse_encoders(output: &str) -> BTreeMap<HwAccel, Vec<String>> {
    let mut encoders: BTreeMap<HwAccel, Vec<String>> = BTreeMap::new();
    for line in output.lines() {
        let mut fields = line.split_whitespace();
        let (Some(flags), Some(name)) = (fields.next(), fields.next()) else {
            continue;
        };
        // Listing rows start with a six character flag field, `V` for video
        if flags.len() != 6 || !flags.starts_with('V') || name == "=" {
            continue;
        }
        if let Some(method) = encoder_method(name) {
            encoders.entry(method).or_default().push(name.to_string());
        }
    }
    encoders
}

/// Parse `-hwaccels` output into the known backends.
pub fn parse_hwaccels(output: &str) -> BTreeSet<HwAccel> {
    output
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.contains(':'))
        .filter_map(|l| l.parse::<HwAccel>().ok())
        .filter(|m| !matches!(m, HwAccel::Auto | HwAccel::None))
        .collect()
}

/// Parse `index, name` CSV rows from the GPU query tool.
pub fn parse_gpu_list(output: &str) -> Vec<HwDevice> {
    output
        .lines()
        .filter_map(|line| {
            let (index, name) = line.split_once(',')?;
            let index = index.trim();
            index.parse::<u32>().ok()?;
            Some(HwDevice {
                id: index.to_string(),
                name: name.trim().to_string(),
            })
        })
        .collect()
}

/// Render nodes (`renderD*`) in `dri_dir`, sorted by name.
pub fn list_render_nodes(dri_dir: &Path) -> Vec<HwDevice> {
    let Ok(entries) = std::fs::read_dir(dri_dir) else {
        return Vec::new();
    };
    let mut nodes: Vec<HwDevice> = entries
        .filter_map(|e| e.ok())
        .filter_map(|e| {
            let name = e.file_name().to_string_lossy().to_string();
            name.starts_with("renderD").then(|| HwDevice {
                id: e.path().to_string_lossy().to_string(),
                name,
            })
        })
        .collect();
    nodes.sort_by(|a, b| a.name.cmp(&b.name));
    nodes
}

/// Run a tool and return its stdout, or `None` if it could not run or failed.
async fn tool_output(program: &Path, args: &[&str]) -> Option<String> {
    match Command::new(program).args(args).kill_on_drop(true).output().await {
        Ok(output) if output.status.success() => {
            Some(String::from_utf8_lossy(&output.stdout).to_string())
        }
        Ok(output) => {
            log::debug!("{} {:?} exited with {}", program.display(), args, output.status);
            None
        }
        Err(e) => {
            log::debug!("Could not run {}: {}", program.display(), e);
            None
        }
    }
}

/// Probes the encoder and host for hardware acceleration support.
#[derive(Debug, Clone)]
pub struct CapabilityDetector {
    encoder_path: PathBuf,
    dri_dir: PathBuf,
    gpu_query_tool: PathBuf,
}

impl CapabilityDetector {
    pub fn new(encoder_path: impl Into<PathBuf>) -> Self {
        Self {
            encoder_path: encoder_path.into(),
            dri_dir: PathBuf::from(DEFAULT_DRI_DIR),
            gpu_query_tool: PathBuf::from(DEFAULT_GPU_QUERY_TOOL),
        }
    }

    pub fn with_dri_dir(mut self, dri_dir: impl Into<PathBuf>) -> Self {
        self.dri_dir = dri_dir.into();
        self
    }

    pub fn with_gpu_query_tool(mut self, tool: impl Into<PathBuf>) -> Self {
        self.gpu_query_tool = tool.into();
        self
    }

    /// Build a fresh capability snapshot.
    pub async fn detect(&self) -> CapabilitySnapshot {
        let encoders = tool_output(&self.encoder_path, &["-hide_banner", "-encoders"])
            .await
            .map(|out| parse_encoders(&out))
            .unwrap_or_default();
        let hwaccels = tool_output(&self.encoder_path, &["-hide_banner", "-hwaccels"])
            .await
            .map(|out| parse_hwaccels(&out))
            .unwrap_or_default();

        let render_nodes = if hwaccels.contains(&HwAccel::Vaapi) || hwaccels.contains(&HwAccel::Qsv) {
            let dri_dir = self.dri_dir.clone();
            tokio::task::spawn_blocking(move || list_render_nodes(&dri_dir))
                .await
                .unwrap_or_else(|e| {
                    log::warn!("Render node scan failed: {}", e);
                    Vec::new()
                })
        } else {
            Vec::new()
        };
        let gpus = if hwaccels.contains(&HwAccel::Cuda) {
            tool_output(
                &self.gpu_query_tool,
                &["--query-gpu=index,name", "--format=csv,noheader"],
            )
            .await
            .map(|out| parse_gpu_list(&out))
            .unwrap_or_default()
        } else {
            Vec::new()
        };

        let snapshot = CapabilitySnapshot::from_parts(encoders, hwaccels, render_nodes, gpus);
        match &snapshot.recommended {
            Some(accel) => log::info!(
                "Detected hardware acceleration: {:?}, recommended {} ({})",
                snapshot.methods,
                accel.method,
                accel.device.as_deref().unwrap_or("default device")
            ),
            None => log::info!("No usable hardware acceleration detected; encoding in software"),
        }
        snapshot
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ENCODERS: &str = "Encoders:
 V..... = Video
 A..... = Audio
 ------
 V....D libx264              libx264 H.264 / AVC / MPEG-4 AVC (codec h264)
 V....D h264_nvenc           NVIDIA NVENC H.264 encoder (codec h264)
 V....D hevc_nvenc           NVIDIA NVENC hevc encoder (codec hevc)
 V....D h264_vaapi           H.264/AVC (VAAPI) (codec h264)
 V....D hevc_vaapi           H.265/HEVC (VAAPI) (codec hevc)
 V..... h264_qsv             H.264 / AVC (Intel Quick Sync Video acceleration) (codec h264)
 A....D aac                  AAC (Advanced Audio Coding)
";

    const HWACCELS: &str = "Hardware acceleration methods:
vdpau
cuda
vaapi
qsv
drm
opencl
vulkan
";

    fn render_node() -> HwDevice {
        HwDevice {
            id: "/dev/dri/renderD128".to_string(),
            name: "renderD128".to_string(),
        }
    }

    #[test]
    fn test_parse_encoders() {
        let encoders = parse_encoders(ENCODERS);
        assert_eq!(encoders[&HwAccel::Vaapi], vec!["h264_vaapi", "hevc_vaapi"]);
        assert_eq!(encoders[&HwAccel::Cuda], vec!["h264_nvenc", "hevc_nvenc"]);
        assert_eq!(encoders[&HwAccel::Qsv], vec!["h264_qsv"]);
        assert!(!encoders.contains_key(&HwAccel::Videotoolbox));
    }

    #[test]
    fn test_parse_hwaccels_ignores_unknown_backends() {
        let methods = parse_hwaccels(HWACCELS);
        assert_eq!(
            methods.into_iter().collect::<Vec<_>>(),
            vec![HwAccel::Vaapi, HwAccel::Cuda, HwAccel::Qsv]
        );
    }

    #[test]
    fn test_parse_gpu_list() {
        let gpus = parse_gpu_list("0, NVIDIA GeForce RTX 3080\n1, Tesla T4\nNo devices were found\n");
        assert_eq!(gpus.len(), 2);
        assert_eq!(gpus[1].id, "1");
        assert_eq!(gpus[1].name, "Tesla T4");
    }

    #[test]
    fn test_render_node_backend_is_recommended_first() {
        let snapshot = CapabilitySnapshot::from_parts(
            parse_encoders(ENCODERS),
            parse_hwaccels(HWACCELS),
            vec![render_node()],
            parse_gpu_list("0, RTX\n"),
        );
        assert_eq!(snapshot.methods.len(), 3);
        assert_eq!(
            snapshot.recommended,
            Some(Acceleration {
                method: HwAccel::Vaapi,
                device: Some("/dev/dri/renderD128".to_string()),
            })
        );
    }

    #[test]
    fn test_gpu_backend_without_render_nodes() {
        let snapshot = CapabilitySnapshot::from_parts(
            parse_encoders(ENCODERS),
            parse_hwaccels(HWACCELS),
            Vec::new(),
            parse_gpu_list("0, RTX\n"),
        );
        assert!(!snapshot.methods.contains(&HwAccel::Vaapi));
        assert_eq!(
            snapshot.recommended,
            Some(Acceleration {
                method: HwAccel::Cuda,
                device: Some("0".to_string()),
            })
        );
    }

    #[test]
    fn test_os_native_backend_needs_no_device() {
        let encoders = parse_encoders(" V....D h264_videotoolbox    VideoToolbox H.264 Encoder (codec h264)\n");
        let hwaccels = parse_hwaccels("Hardware acceleration methods:\nvideotoolbox\n");
        let snapshot = CapabilitySnapshot::from_parts(encoders, hwaccels, Vec::new(), Vec::new());
        assert_eq!(
            snapshot.recommended,
            Some(Acceleration {
                method: HwAccel::Videotoolbox,
                device: None,
            })
        );
    }

    #[test]
    fn test_method_without_encoders_is_dropped() {
        let snapshot = CapabilitySnapshot::from_parts(
            BTreeMap::new(),
            parse_hwaccels(HWACCELS),
            vec![render_node()],
            Vec::new(),
        );
        assert!(!snapshot.has_hardware());
        assert_eq!(snapshot.recommended, None);
    }

    #[test]
    fn test_resolve() {
        let snapshot = CapabilitySnapshot::from_parts(
            parse_encoders(ENCODERS),
            parse_hwaccels(HWACCELS),
            vec![render_node()],
            parse_gpu_list("0, RTX\n1, RTX\n"),
        );

        assert_eq!(snapshot.resolve(HwAccel::None, None), None);
        assert_eq!(snapshot.resolve(HwAccel::Auto, None).unwrap().method, HwAccel::Vaapi);

        let cuda = snapshot.resolve(HwAccel::Cuda, Some("1")).unwrap();
        assert_eq!(cuda.device.as_deref(), Some("1"));

        assert_eq!(snapshot.resolve(HwAccel::Videotoolbox, None), None);
        assert_eq!(CapabilitySnapshot::default().resolve(HwAccel::Auto, None), None);
    }

    #[test]
    fn test_has_encoder() {
        let snapshot = CapabilitySnapshot::from_parts(
            parse_encoders(ENCODERS),
            parse_hwaccels(HWACCELS),
            vec![render_node()],
            Vec::new(),
        );
        assert!(snapshot.has_encoder(HwAccel::Vaapi, "hevc_vaapi"));
        assert!(!snapshot.has_encoder(HwAccel::Vaapi, "av1_vaapi"));
        assert!(snapshot.has_encoder(HwAccel::Videotoolbox, "h264_videotoolbox"));
    }

    #[test]
    fn test_list_render_nodes() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("renderD129"), b"").unwrap();
        std::fs::write(dir.path().join("renderD128"), b"").unwrap();
        std::fs::write(dir.path().join("card0"), b"").unwrap();

        let nodes = list_render_nodes(dir.path());
        let names: Vec<_> = nodes.iter().map(|n| n.name.as_str()).collect();
        assert_eq!(names, vec!["renderD128", "renderD129"]);
        assert!(list_render_nodes(&dir.path().join("missing")).is_empty());
    }

    #[tokio::test]
    async fn test_detect_with_missing_encoder_is_empty() {
        let snapshot = CapabilityDetector::new("/nonexistent/encoder")
            .with_gpu_query_tool("/nonexistent/gpu-tool")
            .detect()
            .await;
        assert_eq!(snapshot, CapabilitySnapshot::default());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_detect_lists_render_nodes_for_vaapi() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let encoder = dir.path().join("fake-encoder");
        std::fs::write(
            &encoder,
            "#!/bin/sh\n\
             case \"$*\" in\n\
               *-encoders*) echo ' V....D h264_vaapi           H.264/AVC (VAAPI) (codec h264)' ;;\n\
               *-hwaccels*) printf 'Hardware acceleration methods:\\nvaapi\\n' ;;\n\
             esac\n",
        )
        .unwrap();
        std::fs::set_permissions(&encoder, std::fs::Permissions::from_mode(0o755)).unwrap();
        let dri = dir.path().join("dri");
        std::fs::create_dir(&dri).unwrap();
        std::fs::write(dri.join("renderD128"), b"").unwrap();

        let snapshot = CapabilityDetector::new(&encoder)
            .with_dri_dir(&dri)
            .with_gpu_query_tool("/nonexistent/gpu-tool")
            .detect()
            .await;

        let accel = snapshot.recommended.expect("vaapi should be recommended");
        assert_eq!(accel.method, HwAccel::Vaapi);
        assert_eq!(
            accel.device.as_deref(),
            Some(dri.join("renderD128").to_string_lossy().as_ref())
        );
    }
}
