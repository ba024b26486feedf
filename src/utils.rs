use rand::{Rng, RngCore};

/// Picks an index by walking the cumulative distribution with a uniform draw
/// `p` in [0, 1): each probability is subtracted in order until `p` goes
/// negative. If rounding leaves `p` non-negative after the last entry, the last
/// index is returned. `None` only for an empty distribution.
///
/// ```
/// assert_eq!(rnng::utils::sample_index([0.2, 0.5, 0.3], 0.1), Some(0));
/// assert_eq!(rnng::utils::sample_index([0.2, 0.5, 0.3], 0.65), Some(1));
/// assert_eq!(rnng::utils::sample_index([0.2, 0.5, 0.29], 0.999), Some(2));
/// assert_eq!(rnng::utils::sample_index(Vec::<f64>::new(), 0.5), None);
/// ```
pub fn sample_index<I>(probs: I, mut p: f64) -> Option<usize>
where
  I: IntoIterator<Item = f64>,
{
  let mut last = None;
  for (idx, prob) in probs.into_iter().enumerate() {
    p -= prob;
    if p < 0.0 {
      return Some(idx);
    }
    last = Some(idx);
  }
  last
}

/// Samples an index from log-probabilities
pub fn sample_log_probs(log_probs: &[f32], rng: &mut dyn RngCore) -> Option<usize> {
  let p: f64 = rng.gen_range(0.0..1.0);
  sample_index(log_probs.iter().map(|&lp| (lp as f64).exp()), p)
}

/// `exp(nll / count)`, or 1 when nothing was counted
pub fn perplexity(nll: f64, count: usize) -> f64 {
  if count == 0 { 1.0 } else { (nll / count as f64).exp() }
}

#[cfg(test)]
mod tests {
  use super::*;
  use rand::SeedableRng;
  use rand::rngs::StdRng;

  #[test]
  fn test_sampling_matches_distribution() {
    let probs = [0.1f32, 0.6, 0.3];
    let log_probs = probs.iter().map(|p| p.ln()).collect::<Vec<_>>();
    let mut rng = StdRng::seed_from_u64(7);

    let draws = 20_000;
    let mut counts = [0usize; 3];
    for _ in 0..draws {
      counts[sample_log_probs(&log_probs, &mut rng).unwrap()] += 1;
    }

    for (count, expected) in counts.iter().zip(probs.iter()) {
      let freq = *count as f64 / draws as f64;
      assert!((freq - *expected as f64).abs() < 0.02, "{:?}", counts);
    }
  }

  #[test]
  fn test_floor_at_last() {
    // probabilities that sum a bit under 1
    assert_eq!(sample_index([0.3, 0.3, 0.3999], 0.99995), Some(2));
    assert_eq!(sample_index([1.0], 0.0), Some(0));
  }

  #[test]
  fn test_perplexity() {
    assert_eq!(perplexity(0.0, 10), 1.0);
    assert_eq!(perplexity(5.0, 0), 1.0);
    assert!((perplexity(2.0f64.ln() * 4.0, 4) - 2.0).abs() < 1e-9);
  }
}
