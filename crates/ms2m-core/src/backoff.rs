//! ---
//! ms2m_section: "01-core-functionality"
//! ms2m_subsection: "module"
//! ms2m_type: "source"
//! ms2m_scope: "code"
//! ms2m_description: "Exponential retry backoff with jitter for transient failures."
//! ms2m_version: "v0.0.0-prealpha"
//! ms2m_owner: "tbd"
//! ---
use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Delay schedule for requeuing a migration after a transient error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Upper bound of the random extra delay; zero disables jitter.
    pub jitter: Duration,
}

impl RetryPolicy {
    pub fn new(base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            base_delay,
            max_delay: max_delay.max(base_delay),
            jitter: base_delay / 2,
        }
    }

    pub fn without_jitter(mut self) -> Self {
        self.jitter = Duration::ZERO;
        self
    }
}

#[derive(Debug)]
pub struct RetryBackoff {
    policy: RetryPolicy,
    rng: StdRng,
}

impl RetryBackoff {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            rng: StdRng::from_entropy(),
        }
    }

    /// Seed the internal RNG for deterministic testing.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng = StdRng::seed_from_u64(seed);
        self
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Delay before retry `attempt` (1-indexed), never above `max_delay`.
    pub fn delay(&mut self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(8);
        let base = self.policy.base_delay.mul_f64(2u32.pow(exponent) as f64);
        let delay = if self.policy.jitter.is_zero() {
            base
        } else {
            let jitter_ms = self
                .rng
                .gen_range(0..=self.policy.jitter.as_millis().max(1)) as u64;
            base + Duration::from_millis(jitter_ms)
        };
        delay.min(self.policy.max_delay)
    }
}
