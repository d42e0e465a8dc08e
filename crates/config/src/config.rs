//! Core configuration structures and loading logic

use crate::preset::{default_presets, HwAccel, Preset};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

/// Error type for configuration operations
#[derive(Debug)]
pub enum ConfigError {
    /// IO error reading or writing the config file
    Io(std::io::Error),
    /// TOML parsing error
    Parse(toml::de::Error),
    /// TOML serialization error
    Serialize(toml::ser::Error),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "Failed to access config file: {}", e),
            ConfigError::Parse(e) => write!(f, "Failed to parse config: {}", e),
            ConfigError::Serialize(e) => write!(f, "Failed to serialize config: {}", e),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        ConfigError::Io(e)
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(e: toml::de::Error) -> Self {
        ConfigError::Parse(e)
    }
}

impl From<toml::ser::Error> for ConfigError {
    fn from(e: toml::ser::Error) -> Self {
        ConfigError::Serialize(e)
    }
}

/// Engine-level configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EngineConfig {
    /// Maximum concurrent jobs (0 = auto-derive from core count)
    #[serde(default = "default_max_concurrent_jobs")]
    pub max_concurrent_jobs: u32,
    /// Encoder binary
    #[serde(default = "default_encoder_path")]
    pub encoder_path: PathBuf,
    /// Media probe binary
    #[serde(default = "default_prober_path")]
    pub prober_path: PathBuf,
    /// Global hardware acceleration method
    #[serde(default)]
    pub hw_accel: HwAccel,
    /// Global hardware device (render node path or GPU index)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hw_device: Option<String>,
    /// Directory transcoded files are written to
    #[serde(default = "default_transcode_path")]
    pub transcode_path: PathBuf,
    /// Library roots scanned by the directory catalog
    #[serde(default)]
    pub media_paths: Vec<PathBuf>,
}

fn default_max_concurrent_jobs() -> u32 {
    1
}

fn default_encoder_path() -> PathBuf {
    PathBuf::from("ffmpeg")
}

fn default_prober_path() -> PathBuf {
    PathBuf::from("ffprobe")
}

fn default_transcode_path() -> PathBuf {
    PathBuf::from("./transcodes")
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_concurrent_jobs: default_max_concurrent_jobs(),
            encoder_path: default_encoder_path(),
            prober_path: default_prober_path(),
            hw_accel: HwAccel::default(),
            hw_device: None,
            transcode_path: default_transcode_path(),
            media_paths: Vec::new(),
        }
    }
}

/// Process supervision tuning
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SupervisionConfig {
    /// Bounded wait per monitoring iteration
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Polls without encoded-time progress before the process state is inspected
    #[serde(default = "default_stall_threshold_polls")]
    pub stall_threshold_polls: u32,
    /// Polls without progress after which a process with a static output file is killed
    #[serde(default = "default_hard_stall_threshold_polls")]
    pub hard_stall_threshold_polls: u32,
    /// Time allowed between the terminate signal and a forced kill
    #[serde(default = "default_terminate_grace_ms")]
    pub terminate_grace_ms: u64,
    /// Minimum spacing of progress notifications per job
    #[serde(default = "default_event_interval_ms")]
    pub event_interval_ms: u64,
    /// Lines retained in each job's log ring buffer
    #[serde(default = "default_log_capacity")]
    pub log_capacity: usize,
}

fn default_poll_interval_ms() -> u64 {
    500
}

fn default_stall_threshold_polls() -> u32 {
    60
}

fn default_hard_stall_threshold_polls() -> u32 {
    600
}

fn default_terminate_grace_ms() -> u64 {
    5000
}

fn default_event_interval_ms() -> u64 {
    2000
}

fn default_log_capacity() -> usize {
    1000
}

impl Default for SupervisionConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            stall_threshold_polls: default_stall_threshold_polls(),
            hard_stall_threshold_polls: default_hard_stall_threshold_polls(),
            terminate_grace_ms: default_terminate_grace_ms(),
            event_interval_ms: default_event_interval_ms(),
            log_capacity: default_log_capacity(),
        }
    }
}

/// Prefix rewrites from paths as the catalog reports them to paths as this host sees them
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(transparent)]
pub struct PathMappings(pub BTreeMap<String, String>);

impl PathMappings {
    /// Rewrite `path` using the longest matching source prefix.
    ///
    /// A prefix only matches on a component boundary, so `/media` does not
    /// rewrite `/media2/film.mkv`.
    pub fn apply(&self, path: &Path) -> PathBuf {
        let best = self
            .0
            .iter()
            .filter(|(source, _)| path.starts_with(Path::new(source.as_str())))
            .max_by_key(|(source, _)| source.len());

        match best {
            Some((source, target)) => match path.strip_prefix(Path::new(source.as_str())) {
                Ok(rest) if rest.as_os_str().is_empty() => PathBuf::from(target),
                Ok(rest) => Path::new(target.as_str()).join(rest),
                Err(_) => path.to_path_buf(),
            },
            None => path.to_path_buf(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub supervision: SupervisionConfig,
    #[serde(default)]
    pub path_mappings: PathMappings,
    #[serde(default = "default_presets")]
    pub presets: Vec<Preset>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            engine: EngineConfig::default(),
            supervision: SupervisionConfig::default(),
            path_mappings: PathMappings::default(),
            presets: default_presets(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file
    ///
    /// Missing sections and fields fall back to their defaults.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        Self::parse_toml(&content)
    }

    /// Parse configuration from a TOML string
    pub fn parse_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        Ok(config)
    }

    /// Write the configuration back out as TOML
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let content = toml::to_string_pretty(self)?;
        if let Some(parent) = path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        fs::write(path, content)?;
        Ok(())
    }

    /// Look up a preset by name
    pub fn preset(&self, name: &str) -> Option<&Preset> {
        self.presets.iter().find(|p| p.name == name)
    }

    /// Apply environment variable overrides to the configuration
    ///
    /// Overrides the following values if environment variables are set:
    /// - HWT_MAX_CONCURRENT_JOBS -> engine.max_concurrent_jobs
    /// - HWT_ENCODER_PATH -> engine.encoder_path
    /// - HWT_PROBER_PATH -> engine.prober_path
    /// - HWT_HW_ACCEL -> engine.hw_accel
    /// - HWT_HW_DEVICE -> engine.hw_device
    /// - HWT_TRANSCODE_PATH -> engine.transcode_path
    pub fn apply_env_overrides(&mut self) {
        if let Ok(val) = env::var("HWT_MAX_CONCURRENT_JOBS") {
            if let Ok(jobs) = val.parse::<u32>() {
                self.engine.max_concurrent_jobs = jobs;
            }
        }

        if let Ok(val) = env::var("HWT_ENCODER_PATH") {
            if !val.is_empty() {
                self.engine.encoder_path = PathBuf::from(val);
            }
        }

        if let Ok(val) = env::var("HWT_PROBER_PATH") {
            if !val.is_empty() {
                self.engine.prober_path = PathBuf::from(val);
            }
        }

        if let Ok(val) = env::var("HWT_HW_ACCEL") {
            // Unknown method names keep the existing value
            if let Ok(method) = val.parse::<HwAccel>() {
                self.engine.hw_accel = method;
            }
        }

        if let Ok(val) = env::var("HWT_HW_DEVICE") {
            self.engine.hw_device = if val.is_empty() { None } else { Some(val) };
        }

        if let Ok(val) = env::var("HWT_TRANSCODE_PATH") {
            if !val.is_empty() {
                self.engine.transcode_path = PathBuf::from(val);
            }
        }
    }

    /// Load configuration from file and apply environment overrides
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut config = Self::load_from_file(path)?;
        config.apply_env_overrides();
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::preset::{Container, Quality, VideoCodec};
    use proptest::prelude::*;
    use std::sync::Mutex;

    // Mutex to ensure env var tests don't interfere with each other
    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    /// Helper to clear all config-related env vars
    fn clear_env_vars() {
        env::remove_var("HWT_MAX_CONCURRENT_JOBS");
        env::remove_var("HWT_ENCODER_PATH");
        env::remove_var("HWT_PROBER_PATH");
        env::remove_var("HWT_HW_ACCEL");
        env::remove_var("HWT_HW_DEVICE");
        env::remove_var("HWT_TRANSCODE_PATH");
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn prop_config_parses_engine_section(
            max_jobs in 0u32..16,
            poll_ms in 10u64..5000,
            stall in 1u32..1000,
            device in proptest::option::of("/dev/dri/renderD12[89]"),
        ) {
            let toml_str = format!(
                r#"
[engine]
max_concurrent_jobs = {}
encoder_path = "/usr/bin/ffmpeg"
hw_accel = "vaapi"
{}

[supervision]
poll_interval_ms = {}
stall_threshold_polls = {}
"#,
                max_jobs,
                device.as_ref().map(|d| format!("hw_device = \"{}\"", d)).unwrap_or_default(),
                poll_ms,
                stall,
            );

            let config = Config::parse_toml(&toml_str).expect("Valid TOML should parse");

            prop_assert_eq!(config.engine.max_concurrent_jobs, max_jobs);
            prop_assert_eq!(config.engine.encoder_path, PathBuf::from("/usr/bin/ffmpeg"));
            prop_assert_eq!(config.engine.hw_accel, HwAccel::Vaapi);
            prop_assert_eq!(config.engine.hw_device, device);
            prop_assert_eq!(config.supervision.poll_interval_ms, poll_ms);
            prop_assert_eq!(config.supervision.stall_threshold_polls, stall);
            // Untouched fields keep their defaults
            prop_assert_eq!(config.supervision.log_capacity, 1000);
        }

        #[test]
        fn prop_env_overrides_max_concurrent_jobs(
            initial_jobs in 0u32..8,
            override_jobs in 0u32..16,
        ) {
            let _guard = ENV_MUTEX.lock().unwrap();
            clear_env_vars();

            let toml_str = format!("[engine]\nmax_concurrent_jobs = {}\n", initial_jobs);
            let mut config = Config::parse_toml(&toml_str).expect("Valid TOML");

            env::set_var("HWT_MAX_CONCURRENT_JOBS", override_jobs.to_string());
            config.apply_env_overrides();
            clear_env_vars();

            prop_assert_eq!(config.engine.max_concurrent_jobs, override_jobs);
        }

        #[test]
        fn prop_path_mapping_preserves_suffix(
            name in "[a-zA-Z0-9 ]{1,20}",
        ) {
            let mut map = BTreeMap::new();
            map.insert("/remote/media".to_string(), "/mnt/media".to_string());
            let mappings = PathMappings(map);

            let input = PathBuf::from(format!("/remote/media/movies/{}.mkv", name));
            let mapped = mappings.apply(&input);
            prop_assert_eq!(mapped, PathBuf::from(format!("/mnt/media/movies/{}.mkv", name)));
        }
    }

    #[test]
    fn test_env_overrides_paths_and_accel() {
        let _guard = ENV_MUTEX.lock().unwrap();
        clear_env_vars();

        let mut config = Config::default();
        env::set_var("HWT_ENCODER_PATH", "/opt/ffmpeg/bin/ffmpeg");
        env::set_var("HWT_HW_ACCEL", "cuda");
        env::set_var("HWT_HW_DEVICE", "1");
        env::set_var("HWT_TRANSCODE_PATH", "/data/transcodes");
        config.apply_env_overrides();
        clear_env_vars();

        assert_eq!(config.engine.encoder_path, PathBuf::from("/opt/ffmpeg/bin/ffmpeg"));
        assert_eq!(config.engine.hw_accel, HwAccel::Cuda);
        assert_eq!(config.engine.hw_device.as_deref(), Some("1"));
        assert_eq!(config.engine.transcode_path, PathBuf::from("/data/transcodes"));
    }

    #[test]
    fn test_invalid_env_values_are_ignored() {
        let _guard = ENV_MUTEX.lock().unwrap();
        clear_env_vars();

        let mut config = Config::default();
        env::set_var("HWT_MAX_CONCURRENT_JOBS", "many");
        env::set_var("HWT_HW_ACCEL", "amf");
        config.apply_env_overrides();
        clear_env_vars();

        assert_eq!(config.engine.max_concurrent_jobs, 1);
        assert_eq!(config.engine.hw_accel, HwAccel::Auto);
    }

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = Config::parse_toml("").expect("Empty TOML should parse");

        assert_eq!(config.engine.max_concurrent_jobs, 1);
        assert_eq!(config.engine.encoder_path, PathBuf::from("ffmpeg"));
        assert_eq!(config.engine.prober_path, PathBuf::from("ffprobe"));
        assert_eq!(config.engine.hw_accel, HwAccel::Auto);
        assert_eq!(config.supervision.poll_interval_ms, 500);
        assert!(config.path_mappings.is_empty());
        assert!(config.preset("high").is_some());
    }

    #[test]
    fn test_presets_and_mappings_parse() {
        let toml_str = r#"
[path_mappings]
"/jellyfin/media" = "/srv/media"

[[presets]]
name = "phone"
scale = "480p"
codec = "hevc"
container = "mkv"
quality = "low"
bitrate = "800k"
hw_accel = "none"
allow_hw_failover = false
"#;
        let config = Config::parse_toml(toml_str).expect("TOML should parse");

        assert_eq!(config.presets.len(), 1);
        let preset = config.preset("phone").expect("preset should exist");
        assert_eq!(preset.codec, VideoCodec::Hevc);
        assert_eq!(preset.container, Container::Mkv);
        assert_eq!(preset.quality, Quality::Low);
        assert_eq!(preset.bitrate.as_deref(), Some("800k"));
        assert_eq!(preset.hw_accel, Some(HwAccel::None));
        assert!(!preset.allow_hw_failover);
        assert_eq!(
            config.path_mappings.apply(Path::new("/jellyfin/media/a.mkv")),
            PathBuf::from("/srv/media/a.mkv")
        );
    }

    #[test]
    fn test_path_mapping_prefers_longest_prefix() {
        let mut map = BTreeMap::new();
        map.insert("/media".to_string(), "/a".to_string());
        map.insert("/media/tv".to_string(), "/b".to_string());
        let mappings = PathMappings(map);

        assert_eq!(mappings.apply(Path::new("/media/tv/show.mkv")), PathBuf::from("/b/show.mkv"));
        assert_eq!(mappings.apply(Path::new("/media/film.mkv")), PathBuf::from("/a/film.mkv"));
        assert_eq!(mappings.apply(Path::new("/media2/film.mkv")), PathBuf::from("/media2/film.mkv"));
        assert_eq!(mappings.apply(Path::new("/media")), PathBuf::from("/a"));
    }

    #[test]
    fn test_save_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("conf").join("config.toml");

        let mut config = Config::default();
        config.engine.max_concurrent_jobs = 3;
        config.engine.hw_device = Some("/dev/dri/renderD128".to_string());
        config.save(&path).unwrap();

        let reloaded = Config::load_from_file(&path).unwrap();
        assert_eq!(reloaded, config);
    }
}
