use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JitterMode {
    #[default]
    None,
    /// Uniform in `[0, delay]`; can yield immediate restarts.
    Full,
}

/// Exponential restart delay keyed on a 1-based attempt number.
///
/// The policy holds no attempt counter of its own: callers pass the attempt,
/// so the same policy can be shared across every managed script.
#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    base_delay: Duration,
    max_delay: Duration,
    multiplier: f64,
    jitter: JitterMode,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(1000),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            jitter: JitterMode::None,
        }
    }
}

impl BackoffPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier;
        self
    }

    pub fn with_jitter(mut self, jitter: JitterMode) -> Self {
        self.jitter = jitter;
        self
    }

    pub fn base_delay(&self) -> Duration {
        self.base_delay
    }

    pub fn jitter(&self) -> JitterMode {
        self.jitter
    }

    /// Delay before restart attempt `attempt` using this policy's base.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.delay_with_base(attempt, self.base_delay)
    }

    /// Same as [`delay_for`](Self::delay_for) but with a per-script base.
    pub fn delay_with_base(&self, attempt: u32, base: Duration) -> Duration {
        let raw = compute_delay(attempt, base, self.multiplier, self.max_delay);
        match self.jitter {
            JitterMode::None => raw,
            JitterMode::Full => full_jitter(raw),
        }
    }
}

/// Deterministic part of the backoff curve:
/// `min(cap, floor(base * factor^(attempt - 1)))`.
///
/// Inputs are clamped: `base >= 1ms`, `factor >= 1`, `cap >= base`.
/// An attempt of 0 is treated as the first attempt.
pub fn compute_delay(attempt: u32, base: Duration, factor: f64, cap: Duration) -> Duration {
    let base_ms = (base.as_millis() as u64).max(1);
    let factor = if factor.is_finite() { factor.max(1.0) } else { 1.0 };
    let cap_ms = (cap.as_millis() as u64).max(base_ms);

    let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
    let raw = (base_ms as f64 * factor.powi(exponent)).floor();

    let delay_ms = if !raw.is_finite() || raw >= cap_ms as f64 {
        cap_ms
    } else {
        raw as u64
    };
    Duration::from_millis(delay_ms)
}

/// Uniform integer milliseconds in `[0, delay]`.
pub fn full_jitter(delay: Duration) -> Duration {
    let max_ms = delay.as_millis() as u64;
    let mut rng = rand::rng();
    Duration::from_millis(rng.random_range(0..=max_ms))
}

/// Sleeps for `delay` unless `cancel` fires first.
///
/// Returns [`Error::Canceled`](crate::Error::Canceled) immediately when the
/// token is already cancelled. The timer is dropped on cancellation.
pub async fn wait_for(delay: Duration, cancel: &CancellationToken) -> crate::Result<()> {
    if cancel.is_cancelled() {
        return Err(crate::Error::Canceled);
    }

    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(crate::Error::Canceled),
        _ = tokio::time::sleep(delay) => Ok(()),
    }
}
