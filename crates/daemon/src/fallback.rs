//! Tier escalation.
//!
//! A job runs through an ordered plan of acceleration tiers. Each attempt is
//! handed to a caller-supplied closure (build the command, supervise the
//! process); this module only decides what the outcome of an attempt means for
//! the job: done, escalate, or fail.

use crate::capabilities::{Acceleration, CapabilitySnapshot};
use crate::config::VideoCodec;
use crate::encode::{hardware_encoder, AttemptExit, AttemptResult, Tier};
use std::future::Future;
use std::path::PathBuf;
use thiserror::Error;

/// Why a transcode failed.
#[derive(Debug, Error)]
pub enum TranscodeError {
    /// Source file is missing
    #[error("Input file not found: {0}")]
    InputNotFound(PathBuf),

    /// Malformed resolution, quality or bitrate in the preset
    #[error("Invalid preset parameter: {0}")]
    InvalidPresetParameter(String),

    /// Hardware path failed and could not be escalated
    #[error("Hardware acceleration failed on tier {tier}: {stderr}")]
    HardwareAccelerationFailure { tier: Tier, stderr: String },

    /// Encoder exited non-zero without a hardware signature
    #[error("Encoder failed ({}): {stderr}", exit_label(.code))]
    EncoderExitFailure { code: Option<i32>, stderr: String },

    /// Encoder stopped making progress and was killed
    #[error("Encoder stalled on tier {tier} and was killed")]
    StalledProcess { tier: Tier },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

fn exit_label(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!("exit code {}", code),
        None => "killed by signal".to_string(),
    }
}

/// How a job's escalation ended.
#[derive(Debug)]
pub enum EscalationOutcome {
    Completed { tier: Tier },
    Failed { tier: Tier, error: TranscodeError },
    Cancelled { tier: Tier },
}

/// Tiers to attempt, in order, for a job encoding `codec` with `accel`.
///
/// Without acceleration only software is tried. When the method has no
/// hardware encoder for the codec, hardware can still decode (hybrid).
pub fn tier_plan(
    snapshot: &CapabilitySnapshot,
    accel: Option<&Acceleration>,
    codec: VideoCodec,
) -> Vec<Tier> {
    let Some(accel) = accel else {
        return vec![Tier::Software];
    };
    match hardware_encoder(accel.method, codec) {
        Some(encoder) if snapshot.has_encoder(accel.method, encoder) => vec![
            Tier::PrimaryHw,
            Tier::AltHw,
            Tier::Hybrid,
            Tier::Software,
        ],
        _ => vec![Tier::Hybrid, Tier::Software],
    }
}

/// Run `attempt` for each tier of `plan` until one succeeds or the job fails.
///
/// A failed attempt escalates to the next tier only when it carried a hardware
/// error signature, `allow_failover` is set, and a later tier exists. An `Err`
/// from `attempt` is fatal.
pub async fn run_tiers<F, Fut>(
    job_id: &str,
    plan: &[Tier],
    allow_failover: bool,
    mut attempt: F,
) -> EscalationOutcome
where
    F: FnMut(Tier) -> Fut,
    Fut: Future<Output = Result<AttemptResult, TranscodeError>>,
{
    let plan = if plan.is_empty() {
        &[Tier::Software][..]
    } else {
        plan
    };

    for (index, &tier) in plan.iter().enumerate() {
        log::info!("Job {}: starting {} attempt", job_id, tier);
        let result = match attempt(tier).await {
            Ok(result) => result,
            Err(error) => return EscalationOutcome::Failed { tier, error },
        };

        let code = match result.exit {
            AttemptExit::Success => return EscalationOutcome::Completed { tier },
            AttemptExit::Cancelled => return EscalationOutcome::Cancelled { tier },
            AttemptExit::Stalled => {
                return EscalationOutcome::Failed {
                    tier,
                    error: TranscodeError::StalledProcess { tier },
                }
            }
            AttemptExit::Failed(code) => code,
        };

        let next = plan.get(index + 1);
        match (result.hw_signature, next) {
            (Some(signature), Some(next)) if allow_failover => {
                log::warn!(
                    "Job {}: hardware failure on {} ('{}'), escalating to {}",
                    job_id,
                    tier,
                    signature,
                    next
                );
            }
            (Some(_), _) if tier != Tier::Software => {
                return EscalationOutcome::Failed {
                    tier,
                    error: TranscodeError::HardwareAccelerationFailure {
                        tier,
                        stderr: result.stderr_tail,
                    },
                };
            }
            _ => {
                return EscalationOutcome::Failed {
                    tier,
                    error: TranscodeError::EncoderExitFailure {
                        code,
                        stderr: result.stderr_tail,
                    },
                };
            }
        }
    }

    // Unreachable: the last tier always returns above
    let tier = plan[plan.len() - 1];
    EscalationOutcome::Failed {
        tier,
        error: TranscodeError::EncoderExitFailure {
            code: None,
            stderr: String::new(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capabilities::HwDevice;
    use crate::config::HwAccel;
    use std::collections::{BTreeMap, BTreeSet};

    const FULL: [Tier; 4] = [Tier::PrimaryHw, Tier::AltHw, Tier::Hybrid, Tier::Software];

    fn ok() -> AttemptResult {
        AttemptResult {
            exit: AttemptExit::Success,
            hw_signature: None,
            stderr_tail: String::new(),
        }
    }

    fn hw_failure() -> AttemptResult {
        AttemptResult {
            exit: AttemptExit::Failed(Some(1)),
            hw_signature: Some("device creation failed"),
            stderr_tail: "Device creation failed: -22.".to_string(),
        }
    }

    fn plain_failure() -> AttemptResult {
        AttemptResult {
            exit: AttemptExit::Failed(Some(1)),
            hw_signature: None,
            stderr_tail: "Invalid data found when processing input".to_string(),
        }
    }

    /// Run the escalation against scripted attempt results, returning the
    /// outcome and the tiers that were attempted.
    async fn escalate(
        plan: &[Tier],
        allow_failover: bool,
        results: Vec<AttemptResult>,
    ) -> (EscalationOutcome, Vec<Tier>) {
        let mut results = results.into_iter();
        let mut attempted = Vec::new();
        let outcome = run_tiers("job", plan, allow_failover, |tier| {
            attempted.push(tier);
            let result = results.next().expect("more attempts than scripted");
            async move { Ok(result) }
        })
        .await;
        (outcome, attempted)
    }

    #[tokio::test]
    async fn test_escalates_in_order_until_success() {
        let (outcome, attempted) =
            escalate(&FULL, true, vec![hw_failure(), hw_failure(), ok()]).await;
        assert_eq!(attempted, vec![Tier::PrimaryHw, Tier::AltHw, Tier::Hybrid]);
        assert!(matches!(outcome, EscalationOutcome::Completed { tier: Tier::Hybrid }));
    }

    #[tokio::test]
    async fn test_software_is_last_resort() {
        let (outcome, attempted) = escalate(
            &FULL,
            true,
            vec![hw_failure(), hw_failure(), hw_failure(), hw_failure()],
        )
        .await;
        assert_eq!(attempted, FULL.to_vec());
        match outcome {
            EscalationOutcome::Failed { tier, error } => {
                assert_eq!(tier, Tier::Software);
                assert!(matches!(error, TranscodeError::EncoderExitFailure { code: Some(1), .. }));
            }
            other => panic!("unexpected outcome {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_failover_disallowed_fails_on_first_tier() {
        let (outcome, attempted) = escalate(&FULL, false, vec![hw_failure()]).await;
        assert_eq!(attempted, vec![Tier::PrimaryHw]);
        match outcome {
            EscalationOutcome::Failed { error, .. } => {
                assert!(matches!(
                    error,
                    TranscodeError::HardwareAccelerationFailure { tier: Tier::PrimaryHw, .. }
                ));
                assert!(error.to_string().contains("Device creation failed"));
            }
            other => panic!("unexpected outcome {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_non_hardware_failure_is_fatal() {
        let (outcome, attempted) = escalate(&FULL, true, vec![plain_failure()]).await;
        assert_eq!(attempted, vec![Tier::PrimaryHw]);
        assert!(matches!(
            outcome,
            EscalationOutcome::Failed {
                error: TranscodeError::EncoderExitFailure { .. },
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_stall_and_cancel_stop_escalation() {
        let stalled = AttemptResult {
            exit: AttemptExit::Stalled,
            ..ok()
        };
        let (outcome, attempted) = escalate(&FULL, true, vec![stalled]).await;
        assert_eq!(attempted.len(), 1);
        assert!(matches!(
            outcome,
            EscalationOutcome::Failed {
                error: TranscodeError::StalledProcess { tier: Tier::PrimaryHw },
                ..
            }
        ));

        let cancelled = AttemptResult {
            exit: AttemptExit::Cancelled,
            ..ok()
        };
        let (outcome, _) = escalate(&FULL, true, vec![hw_failure(), cancelled]).await;
        assert!(matches!(outcome, EscalationOutcome::Cancelled { tier: Tier::AltHw }));
    }

    #[tokio::test]
    async fn test_attempt_error_is_fatal() {
        let outcome = run_tiers("job", &FULL, true, |_| async {
            Err(TranscodeError::InputNotFound(PathBuf::from("/gone.mkv")))
        })
        .await;
        assert!(matches!(
            outcome,
            EscalationOutcome::Failed {
                tier: Tier::PrimaryHw,
                error: TranscodeError::InputNotFound(_)
            }
        ));
    }

    fn snapshot() -> CapabilitySnapshot {
        let mut encoders = BTreeMap::new();
        encoders.insert(HwAccel::Vaapi, vec!["h264_vaapi".to_string(), "hevc_vaapi".to_string()]);
        CapabilitySnapshot::from_parts(
            encoders,
            BTreeSet::from([HwAccel::Vaapi]),
            vec![HwDevice {
                id: "/dev/dri/renderD128".to_string(),
                name: "renderD128".to_string(),
            }],
            Vec::new(),
        )
    }

    #[test]
    fn test_tier_plan() {
        let snapshot = snapshot();
        let accel = snapshot.resolve(HwAccel::Auto, None);

        assert_eq!(tier_plan(&snapshot, accel.as_ref(), VideoCodec::H264), FULL.to_vec());
        // Reported encoders lack av1_vaapi
        assert_eq!(
            tier_plan(&snapshot, accel.as_ref(), VideoCodec::Av1),
            vec![Tier::Hybrid, Tier::Software]
        );
        assert_eq!(tier_plan(&snapshot, None, VideoCodec::H264), vec![Tier::Software]);
    }
}
