//! Retry and refresh delays.
//!
//! Failed syncs back off exponentially (`base * 2^(failures - 1)`, capped at
//! `max`) with optional per-family overrides. Successful syncs wait the
//! steady-state refresh interval plus a configured jitter percentage.

use chrono::Duration;
use rand::Rng;

use crate::config::{BackoffPolicyConfig, MAX_DELAY_SECONDS, SchedulerConfig};
use crate::types::Family;

/// No computed delay exceeds this, whatever the configuration says.
const DELAY_CEILING_SECONDS: u64 = 2 * MAX_DELAY_SECONDS;

/// Delay computation shared by the scheduler for both outcome paths.
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    backoff: BackoffPolicyConfig,
    refresh_interval_seconds: u64,
    jitter_pct_min: f64,
    jitter_pct_max: f64,
}

impl BackoffPolicy {
    pub fn new(backoff: BackoffPolicyConfig, scheduler: &SchedulerConfig) -> Self {
        Self {
            backoff,
            refresh_interval_seconds: scheduler.refresh_interval_seconds,
            jitter_pct_min: scheduler.jitter_pct_min,
            jitter_pct_max: scheduler.jitter_pct_max,
        }
    }

    /// Effective `(base, max)` bounds in seconds for a family.
    pub fn bounds(&self, family: Family) -> (u64, u64) {
        let policy = self.backoff.family_overrides.get(&family);

        let base_seconds = policy
            .and_then(|p| p.base_seconds)
            .unwrap_or(self.backoff.base_seconds);
        let max_seconds = policy
            .and_then(|p| p.max_seconds)
            .unwrap_or(self.backoff.max_seconds);

        (base_seconds, max_seconds.max(base_seconds))
    }

    /// Delay before retrying after `consecutive_failures` failures in a row.
    ///
    /// Zero failures means there is nothing to back off from.
    pub fn failure_delay(&self, family: Family, consecutive_failures: u32) -> Duration {
        if consecutive_failures == 0 {
            return Duration::zero();
        }

        let (base_seconds, max_seconds) = self.bounds(family);
        let exponent = (consecutive_failures - 1).min(62);
        let seconds = base_seconds
            .checked_mul(1_u64 << exponent)
            .unwrap_or(u64::MAX)
            .min(max_seconds);

        clamped_seconds(seconds)
    }

    /// Steady-state delay after a success, jitter included.
    pub fn refresh_delay<R: Rng + ?Sized>(&self, rng: &mut R) -> Duration {
        let jitter = compute_jitter_seconds(
            self.jitter_pct_min,
            self.jitter_pct_max,
            self.refresh_interval_seconds,
            rng,
        );
        clamped_seconds(self.refresh_interval_seconds.saturating_add(jitter))
    }
}

fn clamped_seconds(seconds: u64) -> Duration {
    Duration::seconds(seconds.min(DELAY_CEILING_SECONDS) as i64)
}

fn compute_jitter_seconds<R: Rng + ?Sized>(
    pct_min: f64,
    pct_max: f64,
    base_interval_seconds: u64,
    rng: &mut R,
) -> u64 {
    let min = pct_min.max(0.0);
    let max = pct_max.max(min);

    if min == 0.0 && max == 0.0 {
        return 0;
    }

    let jitter_pct = if (max - min).abs() < f64::EPSILON {
        min
    } else {
        rng.gen_range(min..=max)
    };

    (base_interval_seconds as f64 * jitter_pct).round() as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BackoffFamilyOverride;
    use rand::{SeedableRng, rngs::mock::StepRng};
    use std::collections::BTreeMap;

    fn policy() -> BackoffPolicy {
        let scheduler = SchedulerConfig {
            refresh_interval_seconds: 900,
            jitter_pct_min: 0.0,
            jitter_pct_max: 0.2,
            ..SchedulerConfig::default()
        };
        BackoffPolicy::new(
            BackoffPolicyConfig {
                base_seconds: 30,
                max_seconds: 3600,
                family_overrides: BTreeMap::new(),
            },
            &scheduler,
        )
    }

    #[test]
    fn first_failure_uses_base() {
        assert_eq!(policy().failure_delay(Family::Git, 1), Duration::seconds(30));
        assert_eq!(policy().failure_delay(Family::Git, 2), Duration::seconds(60));
        assert_eq!(policy().failure_delay(Family::Git, 3), Duration::seconds(120));
    }

    #[test]
    fn failure_delay_is_monotonic_and_capped() {
        let policy = policy();
        let mut previous = Duration::zero();
        for failures in 1..=200 {
            let delay = policy.failure_delay(Family::Git, failures);
            assert!(delay >= previous, "delay shrank at {failures} failures");
            assert!(delay <= Duration::seconds(3600));
            previous = delay;
        }
        assert_eq!(previous, Duration::seconds(3600));
    }

    #[test]
    fn zero_failures_means_no_backoff() {
        assert_eq!(policy().failure_delay(Family::Npm, 0), Duration::zero());
    }

    #[test]
    fn family_override_applies() {
        let mut family_overrides = BTreeMap::new();
        family_overrides.insert(
            Family::Npm,
            BackoffFamilyOverride {
                base_seconds: Some(120),
                max_seconds: Some(600),
            },
        );
        let policy = BackoffPolicy::new(
            BackoffPolicyConfig {
                base_seconds: 30,
                max_seconds: 3600,
                family_overrides,
            },
            &SchedulerConfig::default(),
        );

        assert_eq!(policy.failure_delay(Family::Npm, 1), Duration::seconds(120));
        assert_eq!(policy.failure_delay(Family::Npm, 10), Duration::seconds(600));
        assert_eq!(policy.failure_delay(Family::Git, 1), Duration::seconds(30));
    }

    #[test]
    fn refresh_jitter_respects_bounds() {
        let policy = policy();
        let mut rng = rand::rngs::StdRng::seed_from_u64(42);

        for _ in 0..100 {
            let delay = policy.refresh_delay(&mut rng);
            assert!(delay >= Duration::seconds(900));
            assert!(delay <= Duration::seconds(1080));
        }
    }

    #[test]
    fn out_of_range_bounds_are_clamped() {
        let scheduler = SchedulerConfig {
            refresh_interval_seconds: u64::MAX,
            jitter_pct_min: 0.5,
            jitter_pct_max: 0.5,
            ..SchedulerConfig::default()
        };
        let policy = BackoffPolicy::new(
            BackoffPolicyConfig {
                base_seconds: 30,
                max_seconds: u64::MAX / 2,
                family_overrides: BTreeMap::new(),
            },
            &scheduler,
        );
        let ceiling = Duration::seconds(DELAY_CEILING_SECONDS as i64);

        assert_eq!(policy.failure_delay(Family::Git, 64), ceiling);
        assert_eq!(policy.failure_delay(Family::Git, u32::MAX), ceiling);
        assert_eq!(policy.refresh_delay(&mut StepRng::new(0, 1)), ceiling);
    }

    #[test]
    fn jitter_zero_when_bounds_zero() {
        let mut rng = StepRng::new(0, 1);
        assert_eq!(compute_jitter_seconds(0.0, 0.0, 600, &mut rng), 0);
    }
}
