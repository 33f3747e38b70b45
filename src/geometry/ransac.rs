//! Shared RANSAC plumbing: seeded sampling and adaptive iteration counts.

use rand::seq::index::sample;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};

/// Parameters of a RANSAC loop.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RansacConfig {
    /// Upper bound on hypotheses.
    pub max_iterations: usize,
    /// Inlier threshold in pixels.
    pub threshold_px: f64,
    /// Probability of drawing at least one outlier-free sample.
    pub confidence: f64,
    /// Seed of the sampler; a fixed seed makes the estimate reproducible.
    pub seed: u64,
}

impl Default for RansacConfig {
    fn default() -> Self {
        Self {
            max_iterations: 500,
            threshold_px: 1.0,
            confidence: 0.999,
            seed: 42,
        }
    }
}

impl RansacConfig {
    /// A fresh sampler. Each call to an estimator starts from the same seed.
    pub fn rng(&self) -> ChaCha8Rng {
        ChaCha8Rng::seed_from_u64(self.seed)
    }
}

/// Draw `k` distinct indices out of `0..n`.
pub fn sample_indices(rng: &mut ChaCha8Rng, n: usize, k: usize) -> Vec<usize> {
    sample(rng, n, k.min(n)).into_vec()
}

/// Number of iterations needed to hit an all-inlier sample with the requested
/// confidence, given the current inlier ratio.
pub fn adaptive_iterations(inlier_ratio: f64, confidence: f64, sample_size: usize) -> usize {
    if inlier_ratio <= 0.0 {
        return usize::MAX;
    }
    if inlier_ratio >= 1.0 {
        return 1;
    }
    let p_good_sample = inlier_ratio.powi(sample_size as i32);
    if p_good_sample <= f64::EPSILON {
        return usize::MAX;
    }
    let denom = (1.0 - p_good_sample).ln();
    if denom >= 0.0 {
        return usize::MAX;
    }
    let n = (1.0 - confidence).ln() / denom;
    n.ceil().max(1.0) as usize
}

/// Running best hypothesis of a RANSAC loop.
///
/// Ties keep the earlier hypothesis, so the outcome only depends on the seed.
#[derive(Debug, Clone)]
pub(crate) struct Consensus<M> {
    pub model: M,
    pub inliers: Vec<bool>,
    pub num_inliers: usize,
    pub score: f64,
}

impl<M> Consensus<M> {
    /// Replace the current best if `(num_inliers, -score)` is better.
    pub fn offer(best: &mut Option<Self>, model: M, inliers: Vec<bool>, score: f64) -> bool {
        let num_inliers = inliers.iter().filter(|&&b| b).count();
        let better = match best {
            None => num_inliers > 0,
            Some(current) => {
                num_inliers > current.num_inliers
                    || (num_inliers == current.num_inliers && score < current.score)
            }
        };
        if better {
            *best = Some(Self {
                model,
                inliers,
                num_inliers,
                score,
            });
        }
        better
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_adaptive_iterations_monotonic() {
        let high = adaptive_iterations(0.9, 0.99, 6);
        let low = adaptive_iterations(0.5, 0.99, 6);

        assert!(high < low);
        assert_eq!(adaptive_iterations(1.0, 0.99, 6), 1);
        assert_eq!(adaptive_iterations(0.0, 0.99, 6), usize::MAX);
    }

    #[test]
    fn test_adaptive_iterations_known_value() {
        // 50% inliers, 8-point samples, 99% confidence -> 1177 iterations.
        assert_eq!(adaptive_iterations(0.5, 0.99, 8), 1177);
    }

    #[test]
    fn test_sample_indices_distinct_and_reproducible() {
        let config = RansacConfig::default();
        let a = sample_indices(&mut config.rng(), 100, 8);
        let b = sample_indices(&mut config.rng(), 100, 8);

        assert_eq!(a, b);
        let mut sorted = a.clone();
        sorted.sort_unstable();
        sorted.dedup();
        assert_eq!(sorted.len(), 8);
        assert!(a.iter().all(|&i| i < 100));
    }

    #[test]
    fn test_consensus_prefers_more_inliers_then_lower_score() {
        let mut best: Option<Consensus<u32>> = None;
        assert!(Consensus::offer(&mut best, 1, vec![true, false, false], 0.5));
        assert!(Consensus::offer(&mut best, 2, vec![true, true, false], 0.9));
        assert!(!Consensus::offer(&mut best, 3, vec![true, false, true], 1.0));
        assert!(Consensus::offer(&mut best, 4, vec![false, true, true], 0.1));

        let best = best.unwrap();
        assert_eq!(best.model, 4);
        assert_eq!(best.num_inliers, 2);
    }
}
