//! Idle-connection health checks (spec.md §4.7 "Health-check loop").
//!
//! Grounded on `sqlx-core::pool::options`'s lifetime/idle-timeout fields;
//! the jitter calculation has no direct analogue in the retrieved
//! `sqlx-core` pool (it applies jitter inline in its reaper) and is written
//! fresh using `rand`, already a dependency for SCRAM nonce generation.

use std::time::{Duration, Instant};

use rand::Rng;

use super::options::PoolOptions;

/// `age > MaxConnLifetime + jitter` (spec.md §4.7).
pub fn is_past_lifetime(created_at: Instant, options: &PoolOptions) -> bool {
    let Some(max_lifetime) = options.max_lifetime else {
        return false;
    };
    let jitter = random_jitter(options.max_lifetime_jitter);
    created_at.elapsed() > max_lifetime + jitter
}

/// `idleness > MaxConnIdleTime` (spec.md §4.7).
pub fn is_past_idle_timeout(last_used_at: Instant, options: &PoolOptions) -> bool {
    match options.idle_timeout {
        Some(idle_timeout) => last_used_at.elapsed() > idle_timeout,
        None => false,
    }
}

fn random_jitter(bound: Duration) -> Duration {
    if bound.is_zero() {
        return Duration::ZERO;
    }
    let millis = bound.as_millis().min(u128::from(u64::MAX)) as u64;
    Duration::from_millis(rand::thread_rng().gen_range(0..=millis))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_jitter_is_always_zero() {
        for _ in 0..8 {
            assert_eq!(random_jitter(Duration::ZERO), Duration::ZERO);
        }
    }

    #[test]
    fn jitter_never_exceeds_bound() {
        let bound = Duration::from_millis(50);
        for _ in 0..32 {
            assert!(random_jitter(bound) <= bound);
        }
    }

    #[test]
    fn no_lifetime_limit_never_expires() {
        let mut options = PoolOptions::new();
        options.max_lifetime = None;
        assert!(!is_past_lifetime(Instant::now(), &options));
    }

    #[test]
    fn no_idle_limit_never_expires() {
        let mut options = PoolOptions::new();
        options.idle_timeout = None;
        assert!(!is_past_idle_timeout(Instant::now(), &options));
    }
}
