//! Job state notifications
//!
//! Every job state change, and throttled progress while an encoder runs, is
//! published as a [`JobEvent`] through a [`NotificationBus`]. Publishing never
//! blocks and never fails the job: a bus with no listeners drops the event.

use crate::encode::Tier;
use crate::jobs::{Job, JobStatus};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;

/// Default number of events a slow subscriber may lag behind before it
/// starts missing events.
pub const DEFAULT_EVENT_BUFFER: usize = 256;

/// Snapshot of a job published to subscribers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobEvent {
    pub job_id: String,
    pub media_id: String,
    pub status: JobStatus,
    pub progress: f64,
    pub current_time: f64,
    pub duration: Option<f64>,
    pub output_size: Option<String>,
    pub tier: Option<Tier>,
    pub error_message: Option<String>,
    pub timestamp: i64,
}

impl From<&Job> for JobEvent {
    fn from(job: &Job) -> Self {
        Self {
            job_id: job.id.clone(),
            media_id: job.media_id.clone(),
            status: job.status,
            progress: job.progress,
            current_time: job.current_time,
            duration: job.duration,
            output_size: job.output_size.clone(),
            tier: job.tier,
            error_message: job.error_message.clone(),
            timestamp: job.updated_at,
        }
    }
}

/// Sink for job events.
pub trait NotificationBus: Send + Sync {
    fn publish(&self, event: JobEvent);
}

/// In-process bus backed by a tokio broadcast channel.
#[derive(Debug, Clone)]
pub struct BroadcastBus {
    tx: broadcast::Sender<JobEvent>,
}

impl BroadcastBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.tx.subscribe()
    }
}

impl Default for BroadcastBus {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_BUFFER)
    }
}

impl NotificationBus for BroadcastBus {
    fn publish(&self, event: JobEvent) {
        // Err only means nobody is listening
        let _ = self.tx.send(event);
    }
}

/// Bus that discards everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullBus;

impl NotificationBus for NullBus {
    fn publish(&self, _event: JobEvent) {}
}

/// Publishing handle shared by the scheduler, runner and supervisor.
#[derive(Clone)]
pub struct Notifier {
    bus: Arc<dyn NotificationBus>,
    interval: Duration,
}

impl Notifier {
    pub fn new(bus: Arc<dyn NotificationBus>, interval: Duration) -> Self {
        Self { bus, interval }
    }

    /// A notifier that drops every event.
    pub fn null() -> Self {
        Self::new(Arc::new(NullBus), Duration::from_secs(2))
    }

    pub fn publish(&self, job: &Job) {
        log::trace!(
            "Publishing event for job {} ({}, {:.0}%)",
            job.id,
            job.status,
            job.progress * 100.0
        );
        self.bus.publish(JobEvent::from(job));
    }

    /// A fresh throttle for progress events of one encoder run.
    pub fn throttle(&self) -> EventThrottle {
        EventThrottle::new(self.interval)
    }
}

impl std::fmt::Debug for Notifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Notifier")
            .field("interval", &self.interval)
            .finish_non_exhaustive()
    }
}

/// Rate limiter for progress events.
///
/// The first call is always ready; afterwards at most one call per interval is.
#[derive(Debug, Clone)]
pub struct EventThrottle {
    interval: Duration,
    last: Option<Instant>,
}

impl EventThrottle {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last: None,
        }
    }

    pub fn ready(&mut self) -> bool {
        self.ready_at(Instant::now())
    }

    fn ready_at(&mut self, now: Instant) -> bool {
        match self.last {
            Some(last) if now.saturating_duration_since(last) < self.interval => false,
            _ => {
                self.last = Some(now);
                true
            }
        }
    }
}
