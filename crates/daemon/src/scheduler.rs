//! Job admission and queueing.
//!
//! A job starts immediately when fewer than `max_concurrent_jobs` jobs are
//! running, otherwise it waits in a FIFO queue. Every finished job, and every
//! change to the limit, drains the queue. The limit is read from the shared
//! config at each decision.
//!
//! Lock order: scheduler state, then the job store.

use crate::catalog::{MediaCatalog, MediaItem};
use crate::concurrency::effective_max_jobs;
use crate::config::Preset;
use crate::job_runner::transcode_dir;
use crate::jobs::{Job, JobStatus, JobStore};
use crate::notify::Notifier;
use crate::SharedConfig;
use std::collections::{HashSet, VecDeque};
use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

/// Everything needed to start a job once a slot frees up.
#[derive(Debug, Clone)]
pub struct QueueEntry {
    pub job_id: String,
    pub media: MediaItem,
    pub preset: Preset,
    pub output_dir: PathBuf,
}

/// Executes an admitted job to a terminal state.
///
/// The returned future must leave the job terminal (or observe that it already
/// is) before completing; the scheduler frees the slot when it resolves.
pub trait JobRunner: Send + Sync + 'static {
    fn run(
        &self,
        entry: QueueEntry,
        cancel: CancellationToken,
    ) -> Pin<Box<dyn Future<Output = ()> + Send + 'static>>;
}

#[derive(Default)]
struct SchedulerState {
    queue: VecDeque<QueueEntry>,
    running: HashSet<String>,
}

/// FIFO scheduler over a [`JobRunner`].
pub struct Scheduler {
    store: Arc<JobStore>,
    config: SharedConfig,
    catalog: Arc<dyn MediaCatalog>,
    runner: Arc<dyn JobRunner>,
    notifier: Notifier,
    state: Mutex<SchedulerState>,
}

impl Scheduler {
    pub fn new(
        store: Arc<JobStore>,
        config: SharedConfig,
        catalog: Arc<dyn MediaCatalog>,
        runner: Arc<dyn JobRunner>,
        notifier: Notifier,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            config,
            catalog,
            runner,
            notifier,
            state: Mutex::new(SchedulerState::default()),
        })
    }

    async fn max_jobs(&self) -> usize {
        effective_max_jobs(&*self.config.read().await)
    }

    async fn publish(&self, job_id: &str) {
        if let Some(job) = self.store.get(job_id).await {
            self.notifier.publish(&job);
        }
    }

    /// Create a job and start or enqueue it.
    pub async fn submit(
        self: &Arc<Self>,
        media: MediaItem,
        preset: Preset,
        output_dir: PathBuf,
    ) -> Job {
        let mut state = self.state.lock().await;
        let job = self.store.create(&media, &preset.name).await;
        log::info!(
            "Job {}: submitted '{}' with preset '{}'",
            job.id,
            media.title,
            preset.name
        );
        self.notifier.publish(&job);

        let entry = QueueEntry {
            job_id: job.id.clone(),
            media,
            preset,
            output_dir,
        };
        let max = self.max_jobs().await;
        if state.running.len() < max {
            self.start(&mut state, entry).await;
        } else {
            log::info!(
                "Job {}: queued at position {} ({} running, limit {})",
                job.id,
                state.queue.len() + 1,
                state.running.len(),
                max
            );
            state.queue.push_back(entry);
        }
        drop(state);

        self.store.get(&job.id).await.unwrap_or(job)
    }

    /// Admit `entry`: mark it processing and spawn its runner.
    async fn start(self: &Arc<Self>, state: &mut SchedulerState, entry: QueueEntry) -> bool {
        let job_id = entry.job_id.clone();
        if let Err(e) = self.store.update_status(&job_id, JobStatus::Processing).await {
            log::debug!("Job {}: not started: {}", job_id, e);
            return false;
        }
        let cancel = self
            .store
            .cancel_token(&job_id)
            .await
            .unwrap_or_default();
        state.running.insert(job_id.clone());
        log::info!("Job {}: started ({} running)", job_id, state.running.len());
        self.publish(&job_id).await;

        let scheduler = Arc::clone(self);
        tokio::spawn(async move {
            let run = scheduler.runner.run(entry, cancel);
            if let Err(e) = tokio::spawn(run).await {
                log::error!("Job {}: runner aborted: {}", job_id, e);
                let message = format!("Internal error: {}", e);
                if scheduler.store.fail(&job_id, &message).await.is_ok() {
                    scheduler.publish(&job_id).await;
                }
            }
            scheduler.release(job_id).await;
        });
        true
    }

    /// Boxed to break the type cycle between `start` and `on_job_finished`.
    fn release(self: Arc<Self>, job_id: String) -> Pin<Box<dyn Future<Output = ()> + Send>> {
        Box::pin(async move { self.on_job_finished(&job_id).await })
    }

    /// Release the slot held by `job_id` and admit more work.
    pub async fn on_job_finished(self: &Arc<Self>, job_id: &str) {
        let mut state = self.state.lock().await;
        if state.running.remove(job_id) {
            log::debug!("Job {}: slot released", job_id);
        }
        self.drain_locked(&mut state).await;
    }

    /// Start queued jobs while slots are free.
    pub async fn drain(self: &Arc<Self>) {
        let mut state = self.state.lock().await;
        self.drain_locked(&mut state).await;
    }

    async fn drain_locked(self: &Arc<Self>, state: &mut SchedulerState) {
        let max = self.max_jobs().await;
        while state.running.len() < max {
            let Some(entry) = state.queue.pop_front() else {
                break;
            };
            match self.store.status(&entry.job_id).await {
                Some(JobStatus::Pending) => {
                    self.start(state, entry).await;
                }
                status => log::debug!(
                    "Job {}: dropped from queue ({:?})",
                    entry.job_id,
                    status
                ),
            }
        }

        if state.running.len() < max && state.queue.is_empty() {
            self.reconcile(state, max).await;
        }
    }

    /// Start pending jobs that have no queue entry.
    ///
    /// Submission creates and enqueues under one lock, so this only finds work
    /// if that pairing is ever broken.
    async fn reconcile(self: &Arc<Self>, state: &mut SchedulerState, max: usize) {
        for job in self.store.list_pending().await {
            if state.running.len() >= max {
                break;
            }
            if state.running.contains(&job.id) || state.queue.iter().any(|e| e.job_id == job.id) {
                continue;
            }
            log::warn!("Job {}: pending without a queue entry, reconciling", job.id);

            let media = self.catalog.get_media(&job.media_id);
            let (preset, output_dir) = {
                let cfg = self.config.read().await;
                (cfg.preset(&job.preset_name).cloned(), transcode_dir(&cfg))
            };
            match (media, preset) {
                (Some(media), Some(preset)) => {
                    let entry = QueueEntry {
                        job_id: job.id.clone(),
                        media,
                        preset,
                        output_dir,
                    };
                    self.start(state, entry).await;
                }
                _ => {
                    let message = "Media item or preset no longer available";
                    if self.store.fail(&job.id, message).await.is_ok() {
                        log::warn!("Job {}: {}", job.id, message);
                        self.publish(&job.id).await;
                    }
                }
            }
        }
    }

    /// Cancel a job. Queued jobs are removed from the queue without ever
    /// starting; running jobs have their token cancelled.
    pub async fn cancel(&self, job_id: &str) -> bool {
        let mut state = self.state.lock().await;
        let cancelled = match self.store.status(job_id).await {
            Some(JobStatus::Pending) => {
                state.queue.retain(|e| e.job_id != job_id);
                self.store
                    .update_status(job_id, JobStatus::Cancelled)
                    .await
                    .is_ok()
            }
            Some(JobStatus::Processing) => {
                let ok = self
                    .store
                    .update_status(job_id, JobStatus::Cancelled)
                    .await
                    .is_ok();
                if let Some(token) = self.store.cancel_token(job_id).await {
                    token.cancel();
                }
                ok
            }
            _ => false,
        };
        drop(state);

        if cancelled {
            log::info!("Job {}: cancelled", job_id);
            self.publish(job_id).await;
        }
        cancelled
    }

    /// Change the concurrency limit and admit queued work if it was raised.
    pub async fn set_max_concurrent_jobs(self: &Arc<Self>, max: u32) {
        self.config.write().await.engine.max_concurrent_jobs = max;
        log::info!("Concurrency limit set to {}", max);
        self.drain().await;
    }

    pub async fn queue_len(&self) -> usize {
        self.state.lock().await.queue.len()
    }

    pub async fn running_count(&self) -> usize {
        self.state.lock().await.running.len()
    }

    /// Job ids waiting for a slot, oldest first.
    pub async fn queued_ids(&self) -> Vec<String> {
        self.state
            .lock()
            .await
            .queue
            .iter()
            .map(|e| e.job_id.clone())
            .collect()
    }
}
