//! Retry controller: decides requeue-with-backoff versus terminal failure.
//!
//! Stateless; all logic is in associated functions taking the stage's retry
//! settings as parameters. The default policy retries every handler error
//! identically up to the attempt ceiling -- error kinds are not consulted.
//! Per-stage overrides live on the stage's capability row, which is the
//! extension point for stricter policies.

use std::time::Duration;

use bookmarch_types::stage::RetrySettings;

/// Outcome of a retry decision for a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Re-enqueue the stage after the given backoff delay.
    Retry { delay: Duration },
    /// The attempt ceiling is exhausted; fail the stage and the task.
    Terminal,
}

/// Stateless retry decision logic.
pub struct RetryController;

impl RetryController {
    /// Decide what to do after `failed_attempt` (1-based) has failed.
    ///
    /// Retries while `failed_attempt < max_attempts`; the delay doubles per
    /// attempt from `base_delay_ms`, capped at `max_delay_ms`.
    pub fn decide(settings: &RetrySettings, failed_attempt: u32) -> RetryDecision {
        if failed_attempt < settings.max_attempts {
            RetryDecision::Retry {
                delay: Self::backoff_delay(settings, failed_attempt),
            }
        } else {
            RetryDecision::Terminal
        }
    }

    /// Exponential backoff: `base * 2^(failed_attempt - 1)`, capped.
    pub fn backoff_delay(settings: &RetrySettings, failed_attempt: u32) -> Duration {
        let exponent = failed_attempt.saturating_sub(1).min(32);
        let raw = settings
            .base_delay_ms
            .saturating_mul(1u64 << exponent)
            .min(settings.max_delay_ms);
        Duration::from_millis(raw)
    }
}
