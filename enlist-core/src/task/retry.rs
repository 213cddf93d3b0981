use std::time::Duration;

use rand::Rng;

use crate::config::EngineSection;

/// Backoff schedule for transient failures: `base * 2^retry_count`, capped,
/// plus uniform jitter so retries against one site do not align.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    max_retries: u32,
    base_delay: Duration,
    max_delay: Duration,
    jitter: Duration,
}

impl RetryPolicy {
    pub fn new(config: &EngineSection) -> Self {
        Self {
            max_retries: config.max_retries,
            base_delay: Duration::from_millis(config.base_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms.max(config.base_delay_ms)),
            jitter: Duration::from_millis(config.retry_jitter_ms),
        }
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    pub fn allows(&self, retry_count: u32) -> bool {
        retry_count < self.max_retries
    }

    pub fn delay_for(&self, retry_count: u32) -> Duration {
        let shift = retry_count.min(20);
        let scaled = self.base_delay.saturating_mul(1u32 << shift);
        let capped = scaled.min(self.max_delay);
        if self.jitter.is_zero() {
            capped
        } else {
            let jitter_ms = rand::thread_rng().gen_range(0..=self.jitter.as_millis() as u64);
            capped + Duration::from_millis(jitter_ms)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(base_ms: u64, max_ms: u64, jitter_ms: u64) -> RetryPolicy {
        RetryPolicy::new(&EngineSection {
            max_retries: 3,
            base_delay_ms: base_ms,
            max_delay_ms: max_ms,
            retry_jitter_ms: jitter_ms,
            ..EngineSection::default()
        })
    }

    #[test]
    fn delay_doubles_until_the_cap() {
        let policy = policy(1_000, 10_000, 0);
        assert_eq!(policy.delay_for(1), Duration::from_millis(2_000));
        assert_eq!(policy.delay_for(2), Duration::from_millis(4_000));
        assert_eq!(policy.delay_for(3), Duration::from_millis(8_000));
        assert_eq!(policy.delay_for(4), Duration::from_millis(10_000));
        assert_eq!(policy.delay_for(30), Duration::from_millis(10_000));
    }

    #[test]
    fn jitter_stays_within_its_bound() {
        let policy = policy(1_000, 60_000, 500);
        for retry in 1..=3 {
            let base = Duration::from_millis(1_000 * (1 << retry));
            let delay = policy.delay_for(retry);
            assert!(delay >= base);
            assert!(delay <= base + Duration::from_millis(500));
        }
    }

    #[test]
    fn allows_stops_at_max_retries() {
        let policy = policy(1_000, 10_000, 0);
        assert!(policy.allows(0));
        assert!(policy.allows(2));
        assert!(!policy.allows(3));
        assert!(!policy.allows(7));
    }
}
