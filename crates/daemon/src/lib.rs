//! Hardware-aware transcoding engine
//!
//! Queues transcode jobs, runs the encoder with hardware acceleration when the
//! host supports it, falls back tier by tier down to software encoding, and
//! exposes job control over HTTP.

pub mod api;
pub mod capabilities;
pub mod catalog;
pub mod concurrency;
pub mod encode;
pub mod engine;
pub mod fallback;
pub mod job_runner;
pub mod jobs;
pub mod metrics;
pub mod notify;
pub mod probe;
pub mod scheduler;
pub mod sidecar;
pub mod startup;

use std::sync::Arc;
use tokio::sync::RwLock;

pub use hwtranscode_config as config;
pub use hwtranscode_config::Config;

/// Configuration shared with the running engine; read fresh at each decision.
pub type SharedConfig = Arc<RwLock<Config>>;

pub use api::{create_router, default_bind_addr, run_server, ServerError};
pub use capabilities::{
    Acceleration, CapabilityDetector, CapabilitySnapshot, HwDevice, SharedCapabilities,
};
pub use catalog::{DirectoryCatalog, MediaCatalog, MediaItem, MediaKind, StaticCatalog};
pub use concurrency::{effective_max_jobs, ConcurrencyPlan};
pub use encode::{build_command, EncodeSettings, Tier};
pub use engine::{Engine, EngineError};
pub use fallback::{EscalationOutcome, TranscodeError};
pub use job_runner::{output_path, transcode_dir, TranscodeRunner};
pub use jobs::{Job, JobStatus, JobStore, StoreError};
pub use metrics::{collect_system_metrics, JobCounts, MetricsSnapshot, SystemMetrics};
pub use notify::{BroadcastBus, EventThrottle, JobEvent, NotificationBus, Notifier, NullBus};
pub use probe::{probe_duration, probe_media, MediaProbe, ProbeError};
pub use scheduler::{JobRunner, QueueEntry, Scheduler};
pub use sidecar::{
    delete_completed, format_file_size, list_completed, CompletedTranscode, SidecarError,
    SidecarRecord,
};
pub use startup::{
    check_encoder_available, check_prober_available, parse_ffmpeg_version, run_startup_checks,
    StartupError,
};
