//! Derived confidence for reusing a cached template
//!
//! `confidence = similarity × (successes + α) / (successes + failures + α + β)`
//!
//! The second factor is the smoothed historical accuracy of the template. With
//! α = β = 1 (Laplace) a cold entry scores half its similarity, and every
//! recorded success at equal similarity strictly raises the score.

use crate::config::CacheConfig;
use crate::schema::EntryStats;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ConfidenceModel {
    /// Pseudo-successes (α)
    pub prior_successes: f64,
    /// Pseudo-failures (β)
    pub prior_failures: f64,
}

impl Default for ConfidenceModel {
    fn default() -> Self {
        Self {
            prior_successes: 1.0,
            prior_failures: 1.0,
        }
    }
}

impl ConfidenceModel {
    pub fn from_config(config: &CacheConfig) -> Self {
        Self {
            prior_successes: config.prior_successes,
            prior_failures: config.prior_failures,
        }
    }

    /// Smoothed historical accuracy in (0, 1)
    pub fn accuracy(&self, successes: u64, failures: u64) -> f64 {
        let s = successes as f64;
        let f = failures as f64;
        (s + self.prior_successes) / (s + f + self.prior_successes + self.prior_failures)
    }

    /// Confidence of reusing an entry found at `similarity`.
    ///
    /// Negative similarities score zero.
    pub fn confidence(&self, similarity: f32, stats: &EntryStats) -> f64 {
        let similarity = f64::from(similarity).clamp(0.0, 1.0);
        similarity * self.accuracy(stats.success_count, stats.failure_count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stats(success_count: u64, failure_count: u64) -> EntryStats {
        EntryStats {
            success_count,
            failure_count,
            avg_execution_time_ms: 0.0,
        }
    }

    #[test]
    fn test_cold_entry_is_conservative_but_nonzero() {
        let model = ConfidenceModel::default();
        let c = model.confidence(1.0, &stats(0, 0));
        assert!(c > 0.0);
        assert!((c - 0.5).abs() < 1e-12);
    }

    #[test]
    fn test_successes_raise_confidence() {
        let model = ConfidenceModel::default();
        assert!(model.confidence(1.0, &stats(0, 0)) < model.confidence(1.0, &stats(10, 0)));

        let mut previous = model.confidence(0.9, &stats(0, 3));
        for successes in 1..50 {
            let current = model.confidence(0.9, &stats(successes, 3));
            assert!(current > previous, "strictly monotone in successes");
            previous = current;
        }
    }

    #[test]
    fn test_failures_lower_confidence() {
        let model = ConfidenceModel::default();
        assert!(model.confidence(1.0, &stats(5, 5)) < model.confidence(1.0, &stats(5, 0)));
    }

    #[test]
    fn test_strong_history_approaches_similarity() {
        let model = ConfidenceModel::default();
        let c = model.confidence(0.98, &stats(10_000, 0));
        assert!(c > 0.97 && c < 0.98);
    }

    #[test]
    fn test_custom_priors_still_monotone() {
        for (alpha, beta) in [(0.5, 0.5), (1.0, 3.0), (2.0, 1.0)] {
            let model = ConfidenceModel {
                prior_successes: alpha,
                prior_failures: beta,
            };
            assert!(model.confidence(1.0, &stats(0, 0)) < model.confidence(1.0, &stats(1, 0)));
        }
    }

    #[test]
    fn test_negative_similarity_scores_zero() {
        let model = ConfidenceModel::default();
        assert_eq!(model.confidence(-0.4, &stats(100, 0)), 0.0);
    }
}
