//! Engine metrics
//!
//! Point-in-time view of the queue, job counts by status and host load,
//! with JSON serialization support.

use serde::{Deserialize, Serialize};

/// Job counts by status
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct JobCounts {
    pub pending: usize,
    pub processing: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
}

/// System-level metrics for resource monitoring
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SystemMetrics {
    pub cpu_usage_percent: f32,
    pub mem_usage_percent: f32,
    pub load_avg_1: f32,
    pub load_avg_5: f32,
    pub load_avg_15: f32,
}

/// Complete metrics snapshot
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct MetricsSnapshot {
    pub timestamp_unix_ms: i64,
    pub queue_len: usize,
    pub running_jobs: usize,
    pub max_concurrent_jobs: usize,
    pub jobs: JobCounts,
    pub system: SystemMetrics,
}

/// Collects current system metrics using sysinfo
pub fn collect_system_metrics() -> SystemMetrics {
    use sysinfo::System;

    let mut sys = System::new();
    sys.refresh_cpu_usage();
    sys.refresh_memory();

    let total_memory = sys.total_memory();
    let mem_usage = if total_memory > 0 {
        (sys.used_memory() as f64 / total_memory as f64 * 100.0) as f32
    } else {
        0.0
    };
    let load_avg = System::load_average();

    SystemMetrics {
        cpu_usage_percent: sys.global_cpu_usage(),
        mem_usage_percent: mem_usage,
        load_avg_1: load_avg.one as f32,
        load_avg_5: load_avg.five as f32,
        load_avg_15: load_avg.fifteen as f32,
    }
}
