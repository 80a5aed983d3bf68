//! Sampling distributions with closed-form log-probabilities
//!
//! Each distribution pairs a sampling operation with an exact log-probability
//! and analytic gradients of that log-probability with respect to the
//! distribution's (constrained-space) parameters. The fitting loop consumes
//! the gradients; samplers take any `Rng` so call sites can thread a seeded
//! ChaCha stream through the whole expansion.

use rand::Rng;
use rand_distr::{Distribution, Normal};

/// Probability floor used inside logs so that zero-weight outcomes score a
/// very negative (but finite) log-probability instead of poisoning
/// downstream sums with -inf * 0 products.
const PROB_FLOOR: f64 = 1e-12;

const LN_2PI: f64 = 1.8378770664093453;

/// Categorical distribution over explicit probability weights
#[derive(Debug, Clone)]
pub struct Categorical {
    probs: Vec<f64>,
}

impl Categorical {
    /// Weights are normalized at construction; they must be non-negative
    /// with a positive sum.
    pub fn new(weights: &[f64]) -> Self {
        assert!(!weights.is_empty(), "categorical needs at least one weight");
        let total: f64 = weights.iter().sum();
        assert!(
            total > 0.0 && weights.iter().all(|&w| w >= 0.0),
            "categorical weights must be non-negative with positive sum"
        );
        Self {
            probs: weights.iter().map(|w| w / total).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.probs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.probs.is_empty()
    }

    pub fn probs(&self) -> &[f64] {
        &self.probs
    }

    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> usize {
        let u: f64 = rng.gen();
        let mut acc = 0.0;
        for (i, &p) in self.probs.iter().enumerate() {
            acc += p;
            if u < acc {
                return i;
            }
        }
        self.probs.len() - 1
    }

    pub fn log_prob(&self, index: usize) -> f64 {
        self.probs[index].max(PROB_FLOOR).ln()
    }

    /// d log_prob(index) / d probs: e_index / probs[index]
    pub fn log_prob_grad(&self, index: usize) -> Vec<f64> {
        let mut grad = vec![0.0; self.probs.len()];
        grad[index] = 1.0 / self.probs[index].max(PROB_FLOOR);
        grad
    }
}

/// One independent Bernoulli per slot
#[derive(Debug, Clone)]
pub struct BernoulliSet {
    probs: Vec<f64>,
}

impl BernoulliSet {
    pub fn new(probs: &[f64]) -> Self {
        assert!(
            probs.iter().all(|&p| (0.0..=1.0).contains(&p)),
            "bernoulli probabilities must lie in [0, 1]"
        );
        Self {
            probs: probs.to_vec(),
        }
    }

    pub fn len(&self) -> usize {
        self.probs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.probs.is_empty()
    }

    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> Vec<bool> {
        self.probs.iter().map(|&p| rng.gen::<f64>() < p).collect()
    }

    /// Sum of per-slot Bernoulli log-probs for the given activation mask
    pub fn log_prob(&self, mask: &[bool]) -> f64 {
        assert_eq!(mask.len(), self.probs.len());
        self.probs
            .iter()
            .zip(mask)
            .map(|(&p, &on)| {
                if on {
                    p.max(PROB_FLOOR).ln()
                } else {
                    (1.0 - p).max(PROB_FLOOR).ln()
                }
            })
            .sum()
    }

    /// d log_prob(mask) / d probs: 1/p for active slots, -1/(1-p) otherwise
    pub fn log_prob_grad(&self, mask: &[bool]) -> Vec<f64> {
        self.probs
            .iter()
            .zip(mask)
            .map(|(&p, &on)| {
                if on {
                    1.0 / p.max(PROB_FLOOR)
                } else {
                    -1.0 / (1.0 - p).max(PROB_FLOOR)
                }
            })
            .collect()
    }
}

/// Independent per-coordinate Normal (diagonal covariance)
#[derive(Debug, Clone)]
pub struct DiagonalNormal {
    pub mean: Vec<f64>,
    pub scale: Vec<f64>,
}

impl DiagonalNormal {
    pub fn new(mean: Vec<f64>, scale: Vec<f64>) -> Self {
        assert_eq!(mean.len(), scale.len());
        assert!(scale.iter().all(|&s| s > 0.0), "scales must be positive");
        Self { mean, scale }
    }

    pub fn len(&self) -> usize {
        self.mean.len()
    }

    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> Vec<f64> {
        self.mean
            .iter()
            .zip(&self.scale)
            .map(|(&m, &s)| Normal::new(m, s).unwrap().sample(rng))
            .collect()
    }

    /// Log-density summed over coordinates
    pub fn log_prob(&self, x: &[f64]) -> f64 {
        assert_eq!(x.len(), self.mean.len());
        x.iter()
            .zip(self.mean.iter().zip(&self.scale))
            .map(|(&xi, (&m, &s))| {
                let z = (xi - m) / s;
                -0.5 * z * z - s.ln() - 0.5 * LN_2PI
            })
            .sum()
    }

    /// Gradients of [`log_prob`](Self::log_prob) with respect to mean and scale
    ///
    /// Returns (d/d mean, d/d scale) per coordinate.
    pub fn log_prob_grad(&self, x: &[f64]) -> (Vec<f64>, Vec<f64>) {
        let mut d_mean = Vec::with_capacity(x.len());
        let mut d_scale = Vec::with_capacity(x.len());
        for (&xi, (&m, &s)) in x.iter().zip(self.mean.iter().zip(&self.scale)) {
            let diff = xi - m;
            d_mean.push(diff / (s * s));
            d_scale.push(diff * diff / (s * s * s) - 1.0 / s);
        }
        (d_mean, d_scale)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    #[test]
    fn test_categorical_normalizes() {
        let c = Categorical::new(&[2.0, 6.0]);
        assert_abs_diff_eq!(c.probs()[0], 0.25, epsilon = 1e-12);
        assert_abs_diff_eq!(c.probs()[1], 0.75, epsilon = 1e-12);
        assert_abs_diff_eq!(c.probs().iter().sum::<f64>(), 1.0, epsilon = 1e-12);
    }

    #[test]
    fn test_categorical_sample_frequencies() {
        let c = Categorical::new(&[1.0, 3.0]);
        let mut rng = ChaCha8Rng::seed_from_u64(7);
        let n = 20_000;
        let hits = (0..n).filter(|_| c.sample(&mut rng) == 1).count();
        let freq = hits as f64 / n as f64;
        assert!((freq - 0.75).abs() < 0.02, "freq = {}", freq);
    }

    #[test]
    fn test_categorical_log_prob_matches_closed_form() {
        let c = Categorical::new(&[1.0, 1.0, 2.0]);
        assert_abs_diff_eq!(c.log_prob(2), (0.5f64).ln(), epsilon = 1e-12);
        let grad = c.log_prob_grad(2);
        assert_abs_diff_eq!(grad[2], 2.0, epsilon = 1e-12); // 1/0.5
        assert_eq!(grad[0], 0.0);
    }

    #[test]
    fn test_bernoulli_set_log_prob() {
        let b = BernoulliSet::new(&[0.5, 0.25]);
        let lp = b.log_prob(&[true, false]);
        assert_abs_diff_eq!(lp, (0.5f64).ln() + (0.75f64).ln(), epsilon = 1e-12);

        let grad = b.log_prob_grad(&[true, false]);
        assert_abs_diff_eq!(grad[0], 2.0, epsilon = 1e-12);
        assert_abs_diff_eq!(grad[1], -1.0 / 0.75, epsilon = 1e-12);
    }

    #[test]
    fn test_normal_log_prob_standard() {
        // Standard normal at 0: -0.5 * ln(2*pi)
        let d = DiagonalNormal::new(vec![0.0], vec![1.0]);
        assert_abs_diff_eq!(d.log_prob(&[0.0]), -0.5 * LN_2PI, epsilon = 1e-12);
    }

    #[test]
    fn test_normal_grad_matches_finite_difference() {
        let d = DiagonalNormal::new(vec![0.3, -0.1], vec![0.5, 2.0]);
        let x = [0.7, 0.4];
        let (d_mean, d_scale) = d.log_prob_grad(&x);

        let eps = 1e-7;
        for i in 0..2 {
            let mut shifted = d.clone();
            shifted.mean[i] += eps;
            let fd = (shifted.log_prob(&x) - d.log_prob(&x)) / eps;
            assert_abs_diff_eq!(d_mean[i], fd, epsilon = 1e-5);

            let mut shifted = d.clone();
            shifted.scale[i] += eps;
            let fd = (shifted.log_prob(&x) - d.log_prob(&x)) / eps;
            assert_abs_diff_eq!(d_scale[i], fd, epsilon = 1e-5);
        }
    }

    #[test]
    fn test_normal_sample_statistics() {
        let d = DiagonalNormal::new(vec![1.5], vec![0.1]);
        let mut rng = ChaCha8Rng::seed_from_u64(3);
        let n = 10_000;
        let mean: f64 = (0..n).map(|_| d.sample(&mut rng)[0]).sum::<f64>() / n as f64;
        assert!((mean - 1.5).abs() < 0.01, "mean = {}", mean);
    }
}
