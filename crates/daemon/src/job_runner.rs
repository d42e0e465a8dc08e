//! Job execution
//!
//! [`TranscodeRunner`] carries one admitted job from `processing` to a terminal
//! state: input and preset checks, duration probe, tier escalation over the
//! command builder and process supervisor, then output bookkeeping.

use crate::capabilities::{Acceleration, SharedCapabilities};
use crate::catalog::MediaItem;
use crate::config::{Config, Preset};
use crate::encode::{
    build_command, command_line, validate_preset, AttemptResult, BuildError, EncodeSettings,
    ProcessSupervisor, SupervisorError, SupervisorSettings, Tier,
};
use crate::fallback::{run_tiers, tier_plan, EscalationOutcome, TranscodeError};
use crate::jobs::{JobStatus, JobStore};
use crate::notify::Notifier;
use crate::probe::probe_duration;
use crate::scheduler::{JobRunner, QueueEntry};
use crate::sidecar::{format_file_size, write_sidecar, SidecarRecord};
use crate::SharedConfig;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Directory transcodes are written to, after path mapping.
pub fn transcode_dir(cfg: &Config) -> PathBuf {
    cfg.path_mappings.apply(&cfg.engine.transcode_path)
}

/// Output file for `media` encoded with `preset`:
/// `<dir>/<source stem> (<preset name>).<container extension>`.
pub fn output_path(dir: &Path, media: &MediaItem, preset: &Preset) -> PathBuf {
    let stem = media
        .path
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| media.title.clone());
    let stem = stem.replace(['/', '\\'], "_");
    dir.join(format!(
        "{} ({}).{}",
        stem,
        preset.name,
        preset.container.extension()
    ))
}

/// Runs jobs through the encoder.
#[derive(Clone)]
pub struct TranscodeRunner {
    store: Arc<JobStore>,
    config: SharedConfig,
    capabilities: SharedCapabilities,
    notifier: Notifier,
}

impl JobRunner for TranscodeRunner {
    fn run(
        &self,
        entry: QueueEntry,
        cancel: CancellationToken,
    ) -> Pin<Box<dyn Future<Output = ()> + Send + 'static>> {
        let runner = self.clone();
        Box::pin(async move { runner.execute(entry, cancel).await })
    }
}

/// Where a successful transcode ended up.
struct Finished {
    output_path: PathBuf,
    tier: Tier,
}

impl TranscodeRunner {
    pub fn new(
        store: Arc<JobStore>,
        config: SharedConfig,
        capabilities: SharedCapabilities,
        notifier: Notifier,
    ) -> Self {
        Self {
            store,
            config,
            capabilities,
            notifier,
        }
    }

    async fn publish(&self, job_id: &str) {
        if let Some(job) = self.store.get(job_id).await {
            self.notifier.publish(&job);
        }
    }

    async fn engine_log(&self, job_id: &str, message: String) {
        self.store
            .update_logs(job_id, [format!("ENGINE: {}", message)])
            .await
            .ok();
    }

    async fn execute(&self, entry: QueueEntry, cancel: CancellationToken) {
        let job_id = entry.job_id.as_str();
        match self.transcode(&entry, &cancel).await {
            Ok(Some(finished)) => self.finish_success(&entry, finished).await,
            Ok(None) => {
                // Cancelling through the scheduler already recorded the status
                if self.store.status(job_id).await == Some(JobStatus::Processing) {
                    self.store.update_status(job_id, JobStatus::Cancelled).await.ok();
                }
                log::info!("Job {}: cancelled", job_id);
            }
            Err(e) => {
                log::error!("Job {}: failed: {}", job_id, e);
                self.engine_log(job_id, format!("Failed: {}", e)).await;
                if let Err(store_err) = self.store.fail(job_id, &e.to_string()).await {
                    log::debug!("Job {}: failure not recorded: {}", job_id, store_err);
                }
            }
        }
        self.publish(job_id).await;
    }

    /// Run the job. `Ok(None)` means it was cancelled.
    async fn transcode(
        &self,
        entry: &QueueEntry,
        cancel: &CancellationToken,
    ) -> Result<Option<Finished>, TranscodeError> {
        let job_id = entry.job_id.as_str();
        let cfg = self.config.read().await.clone();

        let input = cfg.path_mappings.apply(&entry.media.path);
        if !tokio::fs::try_exists(&input).await.unwrap_or(false) {
            return Err(TranscodeError::InputNotFound(input));
        }
        let settings = validate_preset(&entry.preset).map_err(preset_error)?;

        match probe_duration(&cfg.engine.prober_path, &input).await {
            Ok(duration) => {
                self.store.update_duration(job_id, duration).await.ok();
            }
            Err(e) => {
                log::warn!("Job {}: duration probe failed: {}", job_id, e);
                self.engine_log(job_id, format!("Duration probe failed: {}", e)).await;
            }
        }

        tokio::fs::create_dir_all(&entry.output_dir).await?;
        if cancel.is_cancelled() {
            return Ok(None);
        }
        let output = output_path(&entry.output_dir, &entry.media, &entry.preset);

        let snapshot = self.capabilities.read().await.clone();
        let requested = entry.preset.hw_accel.unwrap_or(cfg.engine.hw_accel);
        let device = entry
            .preset
            .hw_device
            .as_deref()
            .or(cfg.engine.hw_device.as_deref());
        let accel = snapshot.resolve(requested, device);
        let plan = tier_plan(&snapshot, accel.as_ref(), entry.preset.codec);
        let plan_names: Vec<String> = plan.iter().map(|t| t.to_string()).collect();
        log::debug!("Job {}: tier plan [{}]", job_id, plan_names.join(", "));
        self.engine_log(job_id, format!("Tier plan: {}", plan_names.join(" -> ")))
            .await;

        let supervisor = ProcessSupervisor::new(
            self.store.clone(),
            self.notifier.clone(),
            SupervisorSettings::from(&cfg.supervision),
        );
        let attempt = Attempt {
            job_id,
            program: &cfg.engine.encoder_path,
            input: &input,
            output: &output,
            preset: &entry.preset,
            settings: &settings,
            accel: accel.as_ref(),
            cancel,
            supervisor: &supervisor,
            runner: self,
        };

        let outcome = run_tiers(job_id, &plan, entry.preset.allow_hw_failover, |tier| {
            attempt.run(tier)
        })
        .await;

        match outcome {
            EscalationOutcome::Completed { tier } => Ok(Some(Finished {
                output_path: output,
                tier,
            })),
            EscalationOutcome::Cancelled { tier } => {
                log::debug!("Job {}: cancelled during {} attempt", job_id, tier);
                remove_partial(&output).await;
                Ok(None)
            }
            EscalationOutcome::Failed { tier, error } => {
                log::debug!("Job {}: gave up on {} attempt", job_id, tier);
                remove_partial(&output).await;
                Err(error)
            }
        }
    }

    async fn finish_success(&self, entry: &QueueEntry, finished: Finished) {
        let job_id = entry.job_id.as_str();
        let output_size = tokio::fs::metadata(&finished.output_path)
            .await
            .ok()
            .map(|m| format_file_size(m.len()));

        if let Err(e) = self
            .store
            .complete(job_id, finished.output_path.clone(), output_size.clone())
            .await
        {
            log::warn!("Job {}: completion not recorded: {}", job_id, e);
            return;
        }
        log::info!(
            "Job {}: completed on {} tier -> {} ({})",
            job_id,
            finished.tier,
            finished.output_path.display(),
            output_size.as_deref().unwrap_or("unknown size")
        );

        let duration = self.store.get(job_id).await.and_then(|j| j.duration);
        let record = SidecarRecord::new(&entry.media, &entry.preset.name, output_size, duration);
        let output_path = finished.output_path;
        match tokio::task::spawn_blocking(move || write_sidecar(&output_path, &record)).await {
            Ok(Ok(path)) => log::debug!("Job {}: wrote sidecar {}", job_id, path.display()),
            Ok(Err(e)) => log::warn!("Job {}: failed to write sidecar: {}", job_id, e),
            Err(e) => log::warn!("Job {}: sidecar task failed: {}", job_id, e),
        }
    }
}

fn preset_error(e: BuildError) -> TranscodeError {
    match e {
        BuildError::InvalidPresetParameter(message) => TranscodeError::InvalidPresetParameter(message),
        other => TranscodeError::InvalidPresetParameter(other.to_string()),
    }
}

async fn remove_partial(output: &Path) {
    match tokio::fs::remove_file(output).await {
        Ok(()) => log::debug!("Removed partial output {}", output.display()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => log::warn!("Could not remove partial output {}: {}", output.display(), e),
    }
}

/// Inputs shared by every tier attempt of one job.
struct Attempt<'a> {
    job_id: &'a str,
    program: &'a Path,
    input: &'a Path,
    output: &'a Path,
    preset: &'a Preset,
    settings: &'a EncodeSettings,
    accel: Option<&'a Acceleration>,
    cancel: &'a CancellationToken,
    supervisor: &'a ProcessSupervisor,
    runner: &'a TranscodeRunner,
}

impl Attempt<'_> {
    async fn run(&self, tier: Tier) -> Result<AttemptResult, TranscodeError> {
        let args = build_command(
            self.input,
            self.output,
            self.preset,
            self.settings,
            tier,
            self.accel,
        )
        .map_err(preset_error)?;

        let command = command_line(self.program, &args);
        log::debug!("Job {}: {}", self.job_id, command);
        let store = &self.runner.store;
        store
            .begin_attempt(self.job_id, tier, command, self.output.to_path_buf())
            .await
            .ok();
        self.runner.publish(self.job_id).await;

        let result = self
            .supervisor
            .run(self.job_id, self.program, &args, self.output, self.cancel)
            .await
            .map_err(|e| match e {
                SupervisorError::Spawn(io) | SupervisorError::Io(io) => TranscodeError::Io(io),
                other => TranscodeError::Io(std::io::Error::other(other.to_string())),
            })?;

        if let Some(signature) = result.hw_signature {
            self.runner
                .engine_log(
                    self.job_id,
                    format!("Hardware error on {} tier: {}", tier, signature),
                )
                .await;
        }
        Ok(result)
    }
}
