//! Concurrency limit derivation
//!
//! Resolves the effective job concurrency cap from configuration and CPU count.

use crate::config::Config;

/// Concurrency plan derived from configuration and system resources
#[derive(Debug, Clone, PartialEq)]
pub struct ConcurrencyPlan {
    /// Total logical CPU cores available
    pub total_cores: u32,
    /// Maximum number of jobs in `processing` at once
    pub max_concurrent_jobs: u32,
}

impl ConcurrencyPlan {
    /// Derive a concurrency plan from configuration
    ///
    /// An explicit `max_concurrent_jobs` wins; 0 derives the cap from the core
    /// count detected via num_cpus.
    pub fn derive(cfg: &Config) -> Self {
        Self::derive_with_cores(cfg, num_cpus::get() as u32)
    }

    fn derive_with_cores(cfg: &Config, total_cores: u32) -> Self {
        let max_concurrent_jobs = if cfg.engine.max_concurrent_jobs > 0 {
            cfg.engine.max_concurrent_jobs
        } else {
            derive_max_jobs(total_cores)
        };

        Self {
            total_cores,
            max_concurrent_jobs,
        }
    }
}

/// Derive max concurrent jobs based on core count
/// - 2 jobs for 16+ cores
/// - 1 job otherwise
fn derive_max_jobs(cores: u32) -> u32 {
    if cores >= 16 {
        2
    } else {
        1
    }
}

/// Effective concurrency cap for `cfg`, never below 1.
pub fn effective_max_jobs(cfg: &Config) -> usize {
    ConcurrencyPlan::derive(cfg).max_concurrent_jobs.max(1) as usize
}
