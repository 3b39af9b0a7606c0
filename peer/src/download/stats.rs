//! Per-origin bookkeeping for one download (spec.md §3 `OriginStats`).
//! Mutated only by the scheduler task (spec.md §5's ordering guarantee);
//! chunk-fetch tasks report their outcome and never touch this directly.

use std::net::Ipv4Addr;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct OriginKey {
    pub client_id: String,
    pub ip: Ipv4Addr,
    pub port: u16,
}

#[derive(Debug, Clone)]
pub struct OriginStats {
    pub forward: Duration,
    pub backward: Duration,
    pub score: Option<(Duration, u32)>,
    pub in_flight: u32,
    pub consecutive_failures: u32,
}

impl OriginStats {
    pub fn new(forward: Duration, backward: Duration) -> Self {
        Self {
            forward,
            backward,
            score: None,
            in_flight: 0,
            consecutive_failures: 0,
        }
    }

    /// Tier B ranking key: `forward/2 + backward`.
    pub fn weighted_one_way_rtt(&self) -> Duration {
        self.forward / 2 + self.backward
    }

    pub fn record_success(&mut self, elapsed: Duration) {
        self.consecutive_failures = 0;
        self.score = Some(match self.score {
            None => (elapsed, 1),
            Some((mean, samples)) => {
                let samples_f = samples as f64;
                let new_mean =
                    mean.as_secs_f64() + (elapsed.as_secs_f64() - mean.as_secs_f64()) / (samples_f + 1.0);
                (Duration::from_secs_f64(new_mean.max(0.0)), samples + 1)
            }
        });
    }

    pub fn record_failure(&mut self) {
        self.consecutive_failures += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn running_mean_folds_samples() {
        let mut stats = OriginStats::new(Duration::from_millis(10), Duration::from_millis(10));
        stats.record_success(Duration::from_secs(2));
        assert_eq!(stats.score, Some((Duration::from_secs(2), 1)));
        stats.record_success(Duration::from_secs(4));
        let (mean, samples) = stats.score.unwrap();
        assert_eq!(samples, 2);
        assert_eq!(mean, Duration::from_secs(3));
    }

    #[test]
    fn failure_resets_on_next_success() {
        let mut stats = OriginStats::new(Duration::ZERO, Duration::ZERO);
        stats.record_failure();
        stats.record_failure();
        assert_eq!(stats.consecutive_failures, 2);
        stats.record_success(Duration::from_millis(5));
        assert_eq!(stats.consecutive_failures, 0);
    }
}
