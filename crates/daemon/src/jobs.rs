//! Job store: the authoritative in-memory table of transcode jobs.
//!
//! Every job lives behind its own lock inside a [`JobStore`]. Callers never get a
//! reference to the table or to a job; they go through the accessor methods, which
//! take the job's lock, mutate, and release without performing I/O in between.

use crate::catalog::MediaItem;
use crate::encode::Tier;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Progress is held below this value until the encoder exits successfully.
pub const MAX_RUNNING_PROGRESS: f64 = 0.99;

/// Error type for job store operations
#[derive(Debug, Error, PartialEq)]
pub enum StoreError {
    #[error("Job not found: {0}")]
    NotFound(String),

    #[error("Invalid status transition: {from} -> {to}")]
    InvalidTransition { from: JobStatus, to: JobStatus },
}

/// Status of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Job is waiting for a concurrency slot.
    Pending,
    /// Job has been admitted and its encoder is running.
    Processing,
    /// Job produced its output file.
    Completed,
    /// Job failed; `error_message` says why.
    Failed,
    /// Job was cancelled by the user.
    Cancelled,
}

impl Default for JobStatus {
    fn default() -> Self {
        Self::Pending
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobStatus::Pending => write!(f, "pending"),
            JobStatus::Processing => write!(f, "processing"),
            JobStatus::Completed => write!(f, "completed"),
            JobStatus::Failed => write!(f, "failed"),
            JobStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

impl JobStatus {
    /// Check if the status is terminal (completed, failed, or cancelled).
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    /// Whether a job may move from `self` to `next`.
    ///
    /// Transitions only move forward. `pending -> cancelled` covers a job dropped
    /// from the queue before it ever started.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (self, next),
            (Pending, Processing)
                | (Pending, Cancelled)
                | (Pending, Failed)
                | (Processing, Completed)
                | (Processing, Failed)
                | (Processing, Cancelled)
        )
    }
}

/// A transcode job as seen by readers of the store.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Job {
    /// Unique job identifier (UUID).
    pub id: String,
    pub media_id: String,
    /// Title of the media item, for display.
    pub title: String,
    pub preset_name: String,
    pub status: JobStatus,
    /// Fraction complete in `[0.0, 1.0]`.
    pub progress: f64,
    /// Seconds of output encoded so far in the current attempt.
    pub current_time: f64,
    /// Source duration in seconds, once probed.
    pub duration: Option<f64>,
    pub output_path: Option<PathBuf>,
    /// Human-readable output file size.
    pub output_size: Option<String>,
    pub error_message: Option<String>,
    pub encoder_pid: Option<u32>,
    /// The full encoder invocation of the current attempt.
    pub encoder_command: Option<String>,
    /// Acceleration tier of the current attempt.
    pub tier: Option<Tier>,
    /// Most recent encoder and engine log lines, oldest first.
    pub logs: VecDeque<String>,
    /// Unix timestamp (milliseconds) when job was created.
    pub created_at: i64,
    /// Unix timestamp (milliseconds) when job was last updated.
    pub updated_at: i64,
}

impl Job {
    fn new(media: &MediaItem, preset_name: &str) -> Self {
        let now = current_timestamp_ms();
        Self {
            id: Uuid::new_v4().to_string(),
            media_id: media.id.clone(),
            title: media.title.clone(),
            preset_name: preset_name.to_string(),
            status: JobStatus::Pending,
            progress: 0.0,
            current_time: 0.0,
            duration: None,
            output_path: None,
            output_size: None,
            error_message: None,
            encoder_pid: None,
            encoder_command: None,
            tier: None,
            logs: VecDeque::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Update the job's updated_at timestamp to now.
    pub fn touch(&mut self) {
        self.updated_at = current_timestamp_ms();
    }

    /// Move to `next` if the transition is allowed.
    pub fn transition(&mut self, next: JobStatus) -> Result<(), StoreError> {
        if !self.status.can_transition_to(next) {
            return Err(StoreError::InvalidTransition {
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        if next.is_terminal() {
            self.encoder_pid = None;
        }
        self.touch();
        Ok(())
    }

    /// Record encoded time reported by the encoder.
    ///
    /// Time and progress never move backwards within an attempt, and progress stays
    /// at or below [`MAX_RUNNING_PROGRESS`] until completion.
    pub fn record_time(&mut self, current_time: f64) {
        if !current_time.is_finite() || current_time <= self.current_time {
            return;
        }
        self.current_time = current_time;
        if let Some(duration) = self.duration.filter(|d| *d > 0.0) {
            let progress = (current_time / duration).min(MAX_RUNNING_PROGRESS);
            if progress > self.progress {
                self.progress = progress;
            }
        }
        self.touch();
    }

    /// Append lines to the ring buffer, evicting the oldest beyond `capacity`.
    pub fn push_logs<I>(&mut self, lines: I, capacity: usize)
    where
        I: IntoIterator<Item = String>,
    {
        self.logs.extend(lines);
        while self.logs.len() > capacity {
            self.logs.pop_front();
        }
    }

    /// Check if the job is in a terminal state.
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

/// Get current timestamp in milliseconds since Unix epoch.
pub(crate) fn current_timestamp_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

struct JobEntry {
    seq: u64,
    job: RwLock<Job>,
    cancel: CancellationToken,
}

/// In-memory table of jobs with per-job synchronization.
pub struct JobStore {
    jobs: RwLock<HashMap<String, Arc<JobEntry>>>,
    next_seq: AtomicU64,
    log_capacity: usize,
}

impl JobStore {
    pub fn new(log_capacity: usize) -> Self {
        Self {
            jobs: RwLock::new(HashMap::new()),
            next_seq: AtomicU64::new(0),
            log_capacity: log_capacity.max(1),
        }
    }

    async fn entry(&self, id: &str) -> Option<Arc<JobEntry>> {
        self.jobs.read().await.get(id).cloned()
    }

    /// Entries in creation order.
    async fn entries(&self) -> Vec<Arc<JobEntry>> {
        let mut entries: Vec<_> = self.jobs.read().await.values().cloned().collect();
        entries.sort_by_key(|e| e.seq);
        entries
    }

    /// Create a pending job for `media` and return a snapshot of it.
    pub async fn create(&self, media: &MediaItem, preset_name: &str) -> Job {
        let job = Job::new(media, preset_name);
        let entry = Arc::new(JobEntry {
            seq: self.next_seq.fetch_add(1, Ordering::Relaxed),
            job: RwLock::new(job.clone()),
            cancel: CancellationToken::new(),
        });
        self.jobs.write().await.insert(job.id.clone(), entry);
        job
    }

    /// Snapshot of a single job.
    pub async fn get(&self, id: &str) -> Option<Job> {
        let entry = self.entry(id).await?;
        let job = entry.job.read().await.clone();
        Some(job)
    }

    pub async fn status(&self, id: &str) -> Option<JobStatus> {
        let entry = self.entry(id).await?;
        let status = entry.job.read().await.status;
        Some(status)
    }

    /// Snapshots of all jobs in creation order.
    pub async fn list(&self) -> Vec<Job> {
        let mut jobs = Vec::new();
        for entry in self.entries().await {
            jobs.push(entry.job.read().await.clone());
        }
        jobs
    }

    /// Pending jobs in creation order.
    pub async fn list_pending(&self) -> Vec<Job> {
        let mut jobs = Vec::new();
        for entry in self.entries().await {
            let job = entry.job.read().await;
            if job.status == JobStatus::Pending {
                jobs.push(job.clone());
            }
        }
        jobs
    }

    pub async fn count_processing(&self) -> usize {
        self.count_status(JobStatus::Processing).await
    }

    pub async fn count_status(&self, status: JobStatus) -> usize {
        let mut count = 0;
        for entry in self.entries().await {
            if entry.job.read().await.status == status {
                count += 1;
            }
        }
        count
    }

    /// Token the job's supervisor watches for cancellation.
    pub async fn cancel_token(&self, id: &str) -> Option<CancellationToken> {
        self.entry(id).await.map(|e| e.cancel.clone())
    }

    /// Apply `f` to the job under its write lock.
    async fn with_job<T>(&self, id: &str, f: impl FnOnce(&mut Job) -> T) -> Result<T, StoreError> {
        let entry = self
            .entry(id)
            .await
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        let mut job = entry.job.write().await;
        Ok(f(&mut job))
    }

    pub async fn update_status(&self, id: &str, status: JobStatus) -> Result<(), StoreError> {
        self.with_job(id, |job| job.transition(status)).await?
    }

    /// Mark the job failed with `message`.
    pub async fn fail(&self, id: &str, message: &str) -> Result<(), StoreError> {
        self.with_job(id, |job| {
            job.transition(JobStatus::Failed)?;
            job.error_message = Some(message.to_string());
            Ok(())
        })
        .await?
    }

    /// Mark the job completed, forcing progress to 1.0.
    pub async fn complete(
        &self,
        id: &str,
        output_path: PathBuf,
        output_size: Option<String>,
    ) -> Result<(), StoreError> {
        self.with_job(id, |job| {
            job.transition(JobStatus::Completed)?;
            job.progress = 1.0;
            job.output_path = Some(output_path);
            if output_size.is_some() {
                job.output_size = output_size;
            }
            Ok(())
        })
        .await?
    }

    /// Reset per-attempt state before a tier is launched.
    pub async fn begin_attempt(
        &self,
        id: &str,
        tier: Tier,
        command: String,
        output_path: PathBuf,
    ) -> Result<(), StoreError> {
        let capacity = self.log_capacity;
        self.with_job(id, |job| {
            job.tier = Some(tier);
            job.progress = 0.0;
            job.current_time = 0.0;
            job.encoder_pid = None;
            job.output_path = Some(output_path);
            job.push_logs([format!("COMMAND: {}", command)], capacity);
            job.encoder_command = Some(command);
            job.touch();
        })
        .await
    }

    /// Record the running encoder's pid, or clear it once the process is gone.
    pub async fn update_pid(&self, id: &str, pid: Option<u32>) -> Result<(), StoreError> {
        self.with_job(id, |job| {
            job.encoder_pid = if job.status == JobStatus::Processing { pid } else { None };
        })
        .await
    }

    /// Record encoded time. Ignored once the job has left `processing`.
    pub async fn update_progress(&self, id: &str, current_time: f64) -> Result<(), StoreError> {
        self.with_job(id, |job| {
            if job.status == JobStatus::Processing {
                job.record_time(current_time);
            }
        })
        .await
    }

    pub async fn update_duration(&self, id: &str, duration: f64) -> Result<(), StoreError> {
        self.with_job(id, |job| {
            if duration.is_finite() && duration > 0.0 {
                job.duration = Some(duration);
                job.touch();
            }
        })
        .await
    }

    pub async fn update_logs<I>(&self, id: &str, lines: I) -> Result<(), StoreError>
    where
        I: IntoIterator<Item = String>,
    {
        let capacity = self.log_capacity;
        self.with_job(id, |job| job.push_logs(lines, capacity)).await
    }

    pub async fn update_output_size(&self, id: &str, size: String) -> Result<(), StoreError> {
        self.with_job(id, |job| {
            job.output_size = Some(size);
            job.touch();
        })
        .await
    }

    /// Remove a job. Only terminal jobs can be removed.
    pub async fn remove(&self, id: &str) -> bool {
        let mut jobs = self.jobs.write().await;
        let terminal = match jobs.get(id) {
            Some(entry) => entry.job.read().await.is_terminal(),
            None => return false,
        };
        if terminal {
            jobs.remove(id);
        }
        terminal
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::test_media as make_media;
    use proptest::prelude::*;

    fn status_strategy() -> impl Strategy<Value = JobStatus> {
        prop_oneof![
            Just(JobStatus::Pending),
            Just(JobStatus::Processing),
            Just(JobStatus::Completed),
            Just(JobStatus::Failed),
            Just(JobStatus::Cancelled),
        ]
    }

    fn rank(status: JobStatus) -> u8 {
        match status {
            JobStatus::Pending => 0,
            JobStatus::Processing => 1,
            _ => 2,
        }
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        /// Whatever sequence of transitions is attempted, status only moves forward
        /// and a terminal status is final.
        #[test]
        fn prop_status_only_moves_forward(
            attempts in proptest::collection::vec(status_strategy(), 0..12),
        ) {
            let mut job = Job::new(&make_media("m"), "p");
            for next in attempts {
                let before = job.status;
                let result = job.transition(next);
                if before.is_terminal() {
                    prop_assert!(result.is_err());
                    prop_assert_eq!(job.status, before);
                }
                if result.is_ok() {
                    prop_assert!(rank(job.status) > rank(before));
                } else {
                    prop_assert_eq!(job.status, before);
                }
            }
        }

        /// Progress never decreases and never reaches 1.0 from time reports alone.
        #[test]
        fn prop_progress_monotonic_and_clamped(
            duration in 1.0f64..10_000.0,
            times in proptest::collection::vec(0.0f64..20_000.0, 1..50),
        ) {
            let mut job = Job::new(&make_media("m"), "p");
            job.duration = Some(duration);
            let mut last = 0.0;
            for t in times {
                job.record_time(t);
                prop_assert!(job.progress >= last);
                prop_assert!(job.progress <= MAX_RUNNING_PROGRESS);
                last = job.progress;
            }
        }

        #[test]
        fn prop_logs_are_bounded(
            capacity in 1usize..50,
            count in 0usize..200,
        ) {
            let mut job = Job::new(&make_media("m"), "p");
            job.push_logs((0..count).map(|i| format!("line {}", i)), capacity);
            prop_assert_eq!(job.logs.len(), count.min(capacity));
            if count > 0 {
                let expected_last = format!("line {}", count - 1);
                prop_assert_eq!(job.logs.back().map(String::as_str), Some(expected_last.as_str()));
            }
        }
    }

    #[test]
    fn test_record_time_without_duration_leaves_progress() {
        let mut job = Job::new(&make_media("m"), "p");
        job.record_time(12.5);
        assert_eq!(job.current_time, 12.5);
        assert_eq!(job.progress, 0.0);
    }

    #[tokio::test]
    async fn test_create_and_get() {
        let store = JobStore::new(1000);
        let job = store.create(&make_media("movie-1"), "high").await;

        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.media_id, "movie-1");
        assert_eq!(job.preset_name, "high");
        assert!(Uuid::parse_str(&job.id).is_ok());

        let fetched = store.get(&job.id).await.expect("job should exist");
        assert_eq!(fetched, job);
        assert!(store.get("missing").await.is_none());
    }

    #[tokio::test]
    async fn test_list_preserves_creation_order() {
        let store = JobStore::new(1000);
        let a = store.create(&make_media("a"), "p").await;
        let b = store.create(&make_media("b"), "p").await;
        let c = store.create(&make_media("c"), "p").await;
        store.update_status(&b.id, JobStatus::Processing).await.unwrap();

        let ids: Vec<_> = store.list().await.into_iter().map(|j| j.id).collect();
        assert_eq!(ids, vec![a.id.clone(), b.id.clone(), c.id.clone()]);

        let pending: Vec<_> = store.list_pending().await.into_iter().map(|j| j.id).collect();
        assert_eq!(pending, vec![a.id, c.id]);
        assert_eq!(store.count_processing().await, 1);
    }

    #[tokio::test]
    async fn test_remove_requires_terminal_status() {
        let store = JobStore::new(1000);
        let job = store.create(&make_media("a"), "p").await;

        assert!(!store.remove(&job.id).await);
        store.update_status(&job.id, JobStatus::Processing).await.unwrap();
        assert!(!store.remove(&job.id).await);

        store.fail(&job.id, "encoder exited with code 1").await.unwrap();
        assert!(store.remove(&job.id).await);
        assert!(store.get(&job.id).await.is_none());
        assert!(!store.remove(&job.id).await);
    }

    #[tokio::test]
    async fn test_complete_forces_full_progress() {
        let store = JobStore::new(1000);
        let job = store.create(&make_media("a"), "p").await;
        store.update_status(&job.id, JobStatus::Processing).await.unwrap();
        store.update_duration(&job.id, 100.0).await.unwrap();
        store.update_progress(&job.id, 100.0).await.unwrap();
        assert_eq!(store.get(&job.id).await.unwrap().progress, MAX_RUNNING_PROGRESS);

        store
            .complete(&job.id, PathBuf::from("/out/a.mp4"), Some("1.5 MB".to_string()))
            .await
            .unwrap();
        let done = store.get(&job.id).await.unwrap();
        assert_eq!(done.status, JobStatus::Completed);
        assert_eq!(done.progress, 1.0);
        assert_eq!(done.output_size.as_deref(), Some("1.5 MB"));
    }

    #[tokio::test]
    async fn test_cancelled_job_ignores_late_updates() {
        let store = JobStore::new(1000);
        let job = store.create(&make_media("a"), "p").await;
        store.update_status(&job.id, JobStatus::Processing).await.unwrap();
        store.update_pid(&job.id, Some(4242)).await.unwrap();
        store.update_status(&job.id, JobStatus::Cancelled).await.unwrap();

        store.update_progress(&job.id, 50.0).await.unwrap();
        let err = store
            .complete(&job.id, PathBuf::from("/out/a.mp4"), None)
            .await
            .unwrap_err();
        assert_eq!(
            err,
            StoreError::InvalidTransition {
                from: JobStatus::Cancelled,
                to: JobStatus::Completed
            }
        );

        let snapshot = store.get(&job.id).await.unwrap();
        assert_eq!(snapshot.status, JobStatus::Cancelled);
        assert_eq!(snapshot.current_time, 0.0);
        assert_eq!(snapshot.encoder_pid, None);
    }

    #[tokio::test]
    async fn test_begin_attempt_resets_progress_and_logs_command() {
        let store = JobStore::new(2);
        let job = store.create(&make_media("a"), "p").await;
        store.update_status(&job.id, JobStatus::Processing).await.unwrap();
        store.update_duration(&job.id, 10.0).await.unwrap();
        store.update_progress(&job.id, 5.0).await.unwrap();

        store
            .begin_attempt(&job.id, Tier::Software, "ffmpeg -i in out".to_string(), PathBuf::from("/out"))
            .await
            .unwrap();
        store
            .update_logs(&job.id, vec!["STDERR: a".to_string(), "STDERR: b".to_string()])
            .await
            .unwrap();

        let snapshot = store.get(&job.id).await.unwrap();
        assert_eq!(snapshot.progress, 0.0);
        assert_eq!(snapshot.current_time, 0.0);
        assert_eq!(snapshot.tier, Some(Tier::Software));
        assert_eq!(snapshot.encoder_command.as_deref(), Some("ffmpeg -i in out"));
        // Capacity of two evicts the COMMAND line
        assert_eq!(snapshot.logs, VecDeque::from(vec!["STDERR: a".to_string(), "STDERR: b".to_string()]));
    }

    #[tokio::test]
    async fn test_updates_to_missing_job_report_not_found() {
        let store = JobStore::new(10);
        assert_eq!(
            store.update_output_size("nope", "1 kB".to_string()).await,
            Err(StoreError::NotFound("nope".to_string()))
        );
    }
}
