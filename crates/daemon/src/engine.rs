//! Transcode engine
//!
//! Ties the job store, scheduler, runner, catalog, notification bus and
//! capability snapshot together behind the job-control operations used by
//! the HTTP surface and the CLI.

use crate::capabilities::{CapabilityDetector, CapabilitySnapshot, SharedCapabilities};
use crate::catalog::MediaCatalog;
use crate::concurrency::effective_max_jobs;
use crate::config::Config;
use crate::job_runner::{transcode_dir, TranscodeRunner};
use crate::jobs::{current_timestamp_ms, Job, JobStatus, JobStore, StoreError};
use crate::metrics::{collect_system_metrics, JobCounts, MetricsSnapshot};
use crate::notify::{BroadcastBus, JobEvent, Notifier, DEFAULT_EVENT_BUFFER};
use crate::scheduler::{JobRunner, Scheduler};
use crate::sidecar::{list_completed, CompletedTranscode, SidecarError};
use crate::SharedConfig;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, RwLock};

/// Error type for engine operations
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Media item not found: {0}")]
    MediaNotFound(String),

    #[error("Preset not found: {0}")]
    PresetNotFound(String),

    #[error("Job not found: {0}")]
    JobNotFound(String),

    #[error("Job store error: {0}")]
    Store(#[from] StoreError),
}

/// The job engine.
pub struct Engine {
    config: SharedConfig,
    store: Arc<JobStore>,
    scheduler: Arc<Scheduler>,
    catalog: Arc<dyn MediaCatalog>,
    bus: Arc<BroadcastBus>,
    capabilities: SharedCapabilities,
}

impl Engine {
    /// Build an engine that encodes with the configured encoder.
    pub fn new(
        config: Config,
        catalog: Arc<dyn MediaCatalog>,
        capabilities: CapabilitySnapshot,
    ) -> Arc<Self> {
        let store = Arc::new(JobStore::new(config.supervision.log_capacity));
        let bus = Arc::new(BroadcastBus::new(DEFAULT_EVENT_BUFFER));
        let notifier = Notifier::new(
            bus.clone(),
            Duration::from_millis(config.supervision.event_interval_ms),
        );
        let config: SharedConfig = Arc::new(RwLock::new(config));
        let capabilities: SharedCapabilities = Arc::new(RwLock::new(capabilities));
        let runner = Arc::new(TranscodeRunner::new(
            store.clone(),
            config.clone(),
            capabilities.clone(),
            notifier.clone(),
        ));
        Self::with_parts(config, store, catalog, capabilities, bus, runner, notifier)
    }

    /// Build an engine from already constructed parts.
    ///
    /// `runner` must drive jobs held in `store`.
    pub fn with_parts(
        config: SharedConfig,
        store: Arc<JobStore>,
        catalog: Arc<dyn MediaCatalog>,
        capabilities: SharedCapabilities,
        bus: Arc<BroadcastBus>,
        runner: Arc<dyn JobRunner>,
        notifier: Notifier,
    ) -> Arc<Self> {
        let scheduler = Scheduler::new(
            store.clone(),
            config.clone(),
            catalog.clone(),
            runner,
            notifier,
        );
        Arc::new(Self {
            config,
            store,
            scheduler,
            catalog,
            bus,
            capabilities,
        })
    }

    /// Submit `media_id` for transcoding with `preset_name`.
    ///
    /// Returns the new job id. The job starts immediately when a slot is
    /// free, otherwise it is queued.
    pub async fn submit(&self, media_id: &str, preset_name: &str) -> Result<String, EngineError> {
        let media = self
            .catalog
            .get_media(media_id)
            .ok_or_else(|| EngineError::MediaNotFound(media_id.to_string()))?;
        let (preset, output_dir) = {
            let cfg = self.config.read().await;
            let preset = cfg
                .preset(preset_name)
                .cloned()
                .ok_or_else(|| EngineError::PresetNotFound(preset_name.to_string()))?;
            (preset, transcode_dir(&cfg))
        };

        let job = self.scheduler.submit(media, preset, output_dir).await;
        Ok(job.id)
    }

    pub async fn get_status(&self, job_id: &str) -> Option<Job> {
        self.store.get(job_id).await
    }

    /// Like [`Engine::get_status`], but a missing job is an error.
    pub async fn job(&self, job_id: &str) -> Result<Job, EngineError> {
        self.get_status(job_id)
            .await
            .ok_or_else(|| EngineError::JobNotFound(job_id.to_string()))
    }

    pub async fn cancel(&self, job_id: &str) -> bool {
        self.scheduler.cancel(job_id).await
    }

    /// Drop a finished job from the store. Active jobs are kept.
    pub async fn remove(&self, job_id: &str) -> bool {
        let removed = self.store.remove(job_id).await;
        if removed {
            log::info!("Job {}: removed", job_id);
        }
        removed
    }

    /// All jobs, oldest first.
    pub async fn list_jobs(&self) -> Vec<Job> {
        self.store.list().await
    }

    /// Change the concurrency limit; queued jobs are admitted if it was raised.
    pub async fn set_max_concurrent_jobs(&self, max: u32) {
        self.scheduler.set_max_concurrent_jobs(max).await;
    }

    /// The limit currently in force, with 0 resolved against the core count.
    pub async fn max_concurrent_jobs(&self) -> usize {
        effective_max_jobs(&*self.config.read().await)
    }

    pub async fn capabilities(&self) -> CapabilitySnapshot {
        self.capabilities.read().await.clone()
    }

    /// Re-run hardware detection against the configured encoder and store the
    /// result for future jobs. Running jobs keep the plan they started with.
    pub async fn refresh_capabilities(&self) -> CapabilitySnapshot {
        let encoder_path = self.config.read().await.engine.encoder_path.clone();
        let snapshot = CapabilityDetector::new(encoder_path).detect().await;
        log::info!(
            "Capabilities refreshed: {} method(s), recommended {:?}",
            snapshot.methods.len(),
            snapshot.recommended
        );
        *self.capabilities.write().await = snapshot.clone();
        snapshot
    }

    /// Receive every job event published from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.bus.subscribe()
    }

    pub async fn config(&self) -> Config {
        self.config.read().await.clone()
    }

    /// Finished transcodes found in the transcode directory, newest first.
    pub async fn completed(&self) -> Result<Vec<CompletedTranscode>, SidecarError> {
        let dir = transcode_dir(&*self.config.read().await);
        tokio::task::spawn_blocking(move || list_completed(&dir))
            .await
            .unwrap_or_else(|e| Err(SidecarError::Io(std::io::Error::other(e))))
    }

    /// Current queue, job and host metrics.
    pub async fn metrics(&self) -> MetricsSnapshot {
        let jobs = JobCounts {
            pending: self.store.count_status(JobStatus::Pending).await,
            processing: self.store.count_status(JobStatus::Processing).await,
            completed: self.store.count_status(JobStatus::Completed).await,
            failed: self.store.count_status(JobStatus::Failed).await,
            cancelled: self.store.count_status(JobStatus::Cancelled).await,
        };
        let system = tokio::task::spawn_blocking(collect_system_metrics)
            .await
            .unwrap_or_default();

        MetricsSnapshot {
            timestamp_unix_ms: current_timestamp_ms(),
            queue_len: self.scheduler.queue_len().await,
            running_jobs: self.scheduler.running_count().await,
            max_concurrent_jobs: self.max_concurrent_jobs().await,
            jobs,
            system,
        }
    }
}
