//! Encoder process supervision
//!
//! [`ProcessSupervisor::run`] spawns one encoder attempt and watches it until it
//! exits, is cancelled, or is judged stalled. Both output streams are drained
//! concurrently with a periodic poll tick, so a silent stream never holds up
//! progress parsing, cancellation or stall checks.

use super::progress::{parse_duration_banner, parse_progress_line, ProgressField};
use crate::config::SupervisionConfig;
use crate::jobs::JobStore;
use crate::notify::Notifier;
use crate::sidecar::format_file_size;
use std::collections::VecDeque;
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use sysinfo::{Pid, ProcessStatus, ProcessesToUpdate, Signal, System};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::time::{interval, timeout, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// Stderr substrings that identify a failure of the hardware path rather than
/// of the encode itself.
pub const HW_ERROR_SIGNATURES: &[&str] = &[
    "device creation failed",
    "failed to initialise vaapi connection",
    "no va display found",
    "failed to open the drm device",
    "cannot load libcuda",
    "no nvenc capable devices found",
    "openencodesessionex failed",
    "no usable encoding profile found",
    "no support for codec",
    "failed to create surface pool",
    "failed to create frames context",
    "failed to initialise hardware frames context",
    "failed to allocate hw frames",
    "impossible to convert between the formats supported by the filter",
    "error reinitializing filters",
    "hwaccel initialisation returned error",
    "failed setup for format",
];

/// Lines of stderr kept for the failure message.
const STDERR_TAIL_LINES: usize = 40;

/// Buffered log lines are flushed to the store at every poll tick or once
/// this many have accumulated.
const LOG_FLUSH_LINES: usize = 64;

/// Error type for process supervision
#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("Failed to spawn encoder: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("Encoder {0} was not captured")]
    MissingStream(&'static str),

    #[error("IO error while waiting for encoder: {0}")]
    Io(#[from] std::io::Error),
}

/// Return the hardware-failure signature present in `text`, if any.
pub fn hw_error_signature(text: &str) -> Option<&'static str> {
    let lower = text.to_lowercase();
    HW_ERROR_SIGNATURES
        .iter()
        .copied()
        .find(|signature| lower.contains(signature))
}

/// Timing knobs for one supervised run.
#[derive(Debug, Clone)]
pub struct SupervisorSettings {
    pub poll_interval: Duration,
    pub stall_threshold_polls: u32,
    pub hard_stall_threshold_polls: u32,
    pub terminate_grace: Duration,
}

impl From<&SupervisionConfig> for SupervisorSettings {
    fn from(cfg: &SupervisionConfig) -> Self {
        Self {
            poll_interval: Duration::from_millis(cfg.poll_interval_ms.max(1)),
            stall_threshold_polls: cfg.stall_threshold_polls.max(1),
            hard_stall_threshold_polls: cfg
                .hard_stall_threshold_polls
                .max(cfg.stall_threshold_polls.max(1)),
            terminate_grace: Duration::from_millis(cfg.terminate_grace_ms),
        }
    }
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self::from(&SupervisionConfig::default())
    }
}

/// How an attempt ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptExit {
    Success,
    /// Non-zero exit; `None` when terminated by a signal
    Failed(Option<i32>),
    Cancelled,
    /// Killed by stall detection
    Stalled,
}

/// Outcome of one supervised encoder run.
#[derive(Debug, Clone)]
pub struct AttemptResult {
    pub exit: AttemptExit,
    /// First hardware-failure signature seen on stderr
    pub hw_signature: Option<&'static str>,
    /// Trailing stderr lines, for the job's error message
    pub stderr_tail: String,
}

impl AttemptResult {
    pub fn hw_error_detected(&self) -> bool {
        self.hw_signature.is_some()
    }
}

/// Why stall detection killed a process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KillReason {
    Zombie,
    NoProgress,
}

impl std::fmt::Display for KillReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            KillReason::Zombie => write!(f, "process is a zombie"),
            KillReason::NoProgress => write!(f, "no progress and output not growing"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StallVerdict {
    Healthy,
    /// Encoded time has not moved for a while; not yet conclusive
    Suspect,
    Kill(KillReason),
}

/// Per-attempt monitoring state.
#[derive(Debug, Clone, Default)]
pub struct SupervisionState {
    pub current_time: f64,
    time_at_last_poll: f64,
    pub polls_without_progress: u32,
    pub last_output_size: u64,
    pub polls_without_growth: u32,
    pub reached_end: bool,
    stall_reported: bool,
}

impl SupervisionState {
    /// Record encoded time from the progress stream. Never moves backwards.
    pub fn record_time(&mut self, t: f64) -> bool {
        if t > self.current_time {
            self.current_time = t;
            true
        } else {
            false
        }
    }

    /// Advance the poll counters. `output_size` is `None` while the output
    /// file does not exist yet.
    pub fn poll(&mut self, output_size: Option<u64>) {
        if self.current_time > self.time_at_last_poll {
            self.time_at_last_poll = self.current_time;
            self.polls_without_progress = 0;
            self.stall_reported = false;
        } else {
            self.polls_without_progress = self.polls_without_progress.saturating_add(1);
        }

        match output_size {
            Some(size) if size > self.last_output_size => {
                self.last_output_size = size;
                self.polls_without_growth = 0;
            }
            _ => self.polls_without_growth = self.polls_without_growth.saturating_add(1),
        }
    }

    pub fn is_suspect(&self, settings: &SupervisorSettings) -> bool {
        self.polls_without_progress >= settings.stall_threshold_polls
    }

    pub fn verdict(&self, settings: &SupervisorSettings, is_zombie: bool) -> StallVerdict {
        if !self.is_suspect(settings) {
            return StallVerdict::Healthy;
        }
        if is_zombie {
            return StallVerdict::Kill(KillReason::Zombie);
        }
        if self.polls_without_progress >= settings.hard_stall_threshold_polls
            && self.polls_without_growth >= settings.stall_threshold_polls
        {
            return StallVerdict::Kill(KillReason::NoProgress);
        }
        StallVerdict::Suspect
    }
}

/// OS state of `pid`, or `None` once it is gone.
fn process_status(pid: u32) -> Option<ProcessStatus> {
    let pid = Pid::from_u32(pid);
    let mut sys = System::new();
    sys.refresh_processes(ProcessesToUpdate::Some(&[pid]));
    sys.process(pid).map(|p| p.status())
}

/// Ask `pid` to exit. Returns false if the signal could not be sent.
fn send_terminate(pid: u32) -> bool {
    let pid = Pid::from_u32(pid);
    let mut sys = System::new();
    sys.refresh_processes(ProcessesToUpdate::Some(&[pid]));
    sys.process(pid)
        .and_then(|p| p.kill_with(Signal::Term))
        .unwrap_or(false)
}

/// Runs encoder attempts and mirrors what it observes into the job store.
pub struct ProcessSupervisor {
    store: Arc<JobStore>,
    notifier: Notifier,
    settings: SupervisorSettings,
}

impl ProcessSupervisor {
    pub fn new(store: Arc<JobStore>, notifier: Notifier, settings: SupervisorSettings) -> Self {
        Self {
            store,
            notifier,
            settings,
        }
    }

    /// Run `program args` for `job_id` until it exits, is cancelled through
    /// `cancel`, or is killed as stalled.
    pub async fn run(
        &self,
        job_id: &str,
        program: &Path,
        args: &[String],
        output_path: &Path,
        cancel: &CancellationToken,
    ) -> Result<AttemptResult, SupervisorError> {
        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(SupervisorError::Spawn)?;

        let pid = child.id();
        log::debug!("Job {}: encoder started with pid {:?}", job_id, pid);
        self.store.update_pid(job_id, pid).await.ok();

        let stdout = child
            .stdout
            .take()
            .ok_or(SupervisorError::MissingStream("stdout"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or(SupervisorError::MissingStream("stderr"))?;
        let mut stdout = BufReader::new(stdout).split(b'\n');
        let mut stderr = BufReader::new(stderr).split(b'\n');
        let (mut stdout_open, mut stderr_open) = (true, true);

        let mut monitor = Monitor {
            job_id,
            store: &self.store,
            state: SupervisionState::default(),
            duration_known: self
                .store
                .get(job_id)
                .await
                .and_then(|j| j.duration)
                .is_some(),
            pending_logs: Vec::new(),
            stderr_tail: VecDeque::with_capacity(STDERR_TAIL_LINES),
            hw_signature: None,
        };
        let mut throttle = self.notifier.throttle();

        let mut ticker = interval(self.settings.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately
        ticker.tick().await;

        let status = loop {
            tokio::select! {
                // Cancel, then the poll tick, ahead of the streams: an encoder
                // that floods a pipe must not starve stall checks
                biased;

                _ = cancel.cancelled() => {
                    log::info!("Job {}: cancellation requested, terminating encoder", job_id);
                    monitor.push_log("ENGINE: Cancelled by user".to_string());
                    monitor.flush_logs().await;
                    self.terminate(job_id, &mut child).await;
                    self.store.update_pid(job_id, None).await.ok();
                    return Ok(monitor.finish(AttemptExit::Cancelled));
                }

                _ = ticker.tick() => {
                    monitor.flush_logs().await;
                    let size = monitor.sample_output(output_path).await;
                    monitor.state.poll(size);

                    if monitor.state.is_suspect(&self.settings) {
                        let zombie = child
                            .id()
                            .and_then(process_status)
                            .map(|s| s == ProcessStatus::Zombie)
                            .unwrap_or(false);
                        match monitor.state.verdict(&self.settings, zombie) {
                            StallVerdict::Kill(reason) => {
                                log::warn!(
                                    "Job {}: killing stalled encoder after {} polls ({})",
                                    job_id,
                                    monitor.state.polls_without_progress,
                                    reason
                                );
                                monitor.push_log(format!("ENGINE: Encoder stalled, killing ({})", reason));
                                monitor.flush_logs().await;
                                if let Err(e) = child.kill().await {
                                    log::warn!("Job {}: failed to kill stalled encoder: {}", job_id, e);
                                }
                                self.store.update_pid(job_id, None).await.ok();
                                return Ok(monitor.finish(AttemptExit::Stalled));
                            }
                            StallVerdict::Suspect if !monitor.state.stall_reported => {
                                monitor.state.stall_reported = true;
                                log::warn!(
                                    "Job {}: no progress for {} polls",
                                    job_id,
                                    monitor.state.polls_without_progress
                                );
                            }
                            _ => {}
                        }
                    }

                    if throttle.ready() {
                        if let Some(job) = self.store.get(job_id).await {
                            self.notifier.publish(&job);
                        }
                    }
                }

                segment = stdout.next_segment(), if stdout_open => match segment {
                    Ok(Some(bytes)) => monitor.on_stdout(decode_line(&bytes)).await,
                    Ok(None) => stdout_open = false,
                    Err(e) => {
                        log::warn!("Job {}: error reading encoder stdout: {}", job_id, e);
                        stdout_open = false;
                    }
                },

                segment = stderr.next_segment(), if stderr_open => match segment {
                    Ok(Some(bytes)) => monitor.on_stderr(decode_line(&bytes)).await,
                    Ok(None) => stderr_open = false,
                    Err(e) => {
                        log::warn!("Job {}: error reading encoder stderr: {}", job_id, e);
                        stderr_open = false;
                    }
                },

                status = child.wait(), if !stdout_open && !stderr_open => break status?,
            }
        };

        monitor.flush_logs().await;
        monitor.sample_output(output_path).await;
        self.store.update_pid(job_id, None).await.ok();

        let exit = if status.success() {
            AttemptExit::Success
        } else {
            AttemptExit::Failed(status.code())
        };
        log::debug!("Job {}: encoder exited with {}", job_id, status);
        Ok(monitor.finish(exit))
    }

    /// Graceful terminate, then kill once the grace period runs out.
    async fn terminate(&self, job_id: &str, child: &mut Child) {
        if let Some(pid) = child.id() {
            if send_terminate(pid) {
                match timeout(self.settings.terminate_grace, child.wait()).await {
                    Ok(_) => return,
                    Err(_) => log::warn!(
                        "Job {}: encoder ignored terminate for {:?}, killing",
                        job_id,
                        self.settings.terminate_grace
                    ),
                }
            }
        }
        if let Err(e) = child.kill().await {
            log::warn!("Job {}: failed to kill encoder: {}", job_id, e);
        }
    }
}

fn decode_line(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes)
        .trim_end_matches(['\r', '\n'])
        .to_string()
}

/// Stream handling for one run, split out of the select loop.
struct Monitor<'a> {
    job_id: &'a str,
    store: &'a JobStore,
    state: SupervisionState,
    duration_known: bool,
    pending_logs: Vec<String>,
    stderr_tail: VecDeque<String>,
    hw_signature: Option<&'static str>,
}

impl Monitor<'_> {
    fn push_log(&mut self, line: String) {
        self.pending_logs.push(line);
    }

    async fn flush_logs(&mut self) {
        if self.pending_logs.is_empty() {
            return;
        }
        let lines = std::mem::take(&mut self.pending_logs);
        self.store.update_logs(self.job_id, lines).await.ok();
    }

    async fn on_stdout(&mut self, line: String) {
        match parse_progress_line(&line) {
            Some(ProgressField::OutTime(t)) => {
                if self.state.record_time(t) {
                    self.store.update_progress(self.job_id, t).await.ok();
                }
            }
            Some(ProgressField::Progress { end: true }) => self.state.reached_end = true,
            _ => {}
        }
        self.push_log(format!("STDOUT: {}", line));
        if self.pending_logs.len() >= LOG_FLUSH_LINES {
            self.flush_logs().await;
        }
    }

    async fn on_stderr(&mut self, line: String) {
        if self.hw_signature.is_none() {
            self.hw_signature = hw_error_signature(&line);
            if let Some(signature) = self.hw_signature {
                log::debug!("Job {}: hardware error signature '{}'", self.job_id, signature);
            }
        }
        if !self.duration_known {
            if let Some(duration) = parse_duration_banner(&line) {
                self.duration_known = true;
                self.store.update_duration(self.job_id, duration).await.ok();
            }
        }
        if self.stderr_tail.len() == STDERR_TAIL_LINES {
            self.stderr_tail.pop_front();
        }
        self.stderr_tail.push_back(line.clone());
        self.push_log(format!("STDERR: {}", line));
        if self.pending_logs.len() >= LOG_FLUSH_LINES {
            self.flush_logs().await;
        }
    }

    /// Record the output size if it changed. Returns the size on disk.
    async fn sample_output(&mut self, output_path: &Path) -> Option<u64> {
        let size = tokio::fs::metadata(output_path).await.ok()?.len();
        if size != self.state.last_output_size {
            self.store
                .update_output_size(self.job_id, format_file_size(size))
                .await
                .ok();
        }
        Some(size)
    }

    fn finish(self, exit: AttemptExit) -> AttemptResult {
        AttemptResult {
            exit,
            hw_signature: self.hw_signature,
            stderr_tail: self.stderr_tail.into_iter().collect::<Vec<_>>().join("\n"),
        }
    }
}
