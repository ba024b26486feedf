use candle_core::{D, Tensor};
use candle_nn::{Linear, Module, VarBuilder, ops::log_softmax};
use rand::RngCore;

use crate::dict::ActionId;
use crate::error::{Error, Result};
use crate::utils::sample_log_probs;

/// Feed-forward scorer from the three encoder summaries to a distribution over
/// the legal actions.
#[derive(Debug, Clone)]
pub struct ActionScorer {
  /// `[stack; action; term] -> hidden`, i.e. `S s + A a + T t + b` in one matrix
  state: Linear,
  out: Linear,
}

impl ActionScorer {
  pub fn new(hidden_dim: usize, n_actions: usize, vb: VarBuilder) -> Result<Self> {
    Ok(Self {
      state: candle_nn::linear(3 * hidden_dim, hidden_dim, vb.pp("state"))?,
      out: candle_nn::linear(hidden_dim, n_actions, vb.pp("out"))?,
    })
  }

  /// Scores the next action. Illegal actions get no probability mass at all:
  /// the softmax only runs over `legal`.
  pub fn score(
    &self,
    stack: &Tensor,
    action: &Tensor,
    term: &Tensor,
    legal: &[ActionId],
  ) -> Result<ActionDistribution> {
    if legal.is_empty() {
      return Err(Error::Malformed("scored a configuration with no legal actions".to_string()));
    }

    let summaries = Tensor::cat(&[stack, action, term], 1)?;
    let hidden = self.state.forward(&summaries)?.relu()?;
    let logits = self.out.forward(&hidden)?;

    let ids = legal.iter().map(|&a| a as u32).collect::<Vec<_>>();
    let ids = Tensor::from_vec(ids, legal.len(), logits.device())?;
    let log_probs = log_softmax(&logits.index_select(&ids, 1)?, D::Minus1)?.squeeze(0)?;

    Ok(ActionDistribution {
      hidden,
      legal: legal.to_vec(),
      log_probs,
    })
  }
}

/// Log-probabilities over the legal actions of one configuration, plus the
/// hidden state they came from (word prediction reuses it)
#[derive(Debug, Clone)]
pub struct ActionDistribution {
  pub hidden: Tensor,
  legal: Vec<ActionId>,
  /// shape `(legal.len(),)`, in the order of `legal`
  log_probs: Tensor,
}

impl ActionDistribution {
  pub fn legal(&self) -> &[ActionId] {
    &self.legal
  }

  pub fn is_legal(&self, action: ActionId) -> bool {
    self.legal.contains(&action)
  }

  /// Scalar log-probability of `action`; asking for an illegal action means the
  /// reference derivation disagrees with the transition system
  pub fn log_prob(&self, action: ActionId) -> Result<Tensor> {
    let pos = self
      .legal
      .iter()
      .position(|&a| a == action)
      .ok_or_else(|| Error::Derivation(format!("action {} is not legal here", action)))?;
    Ok(self.log_probs.get(pos)?)
  }

  pub fn probabilities(&self) -> Result<Vec<(ActionId, f32)>> {
    let lps = self.log_probs.to_vec1::<f32>()?;
    Ok(self.legal.iter().copied().zip(lps.into_iter().map(f32::exp)).collect())
  }

  /// Cumulative-probability sampling over the legal actions in id order
  pub fn sample(&self, rng: &mut dyn RngCore) -> Result<ActionId> {
    let lps = self.log_probs.to_vec1::<f32>()?;
    sample_log_probs(&lps, rng)
      .map(|pos| self.legal[pos])
      .ok_or_else(|| Error::Malformed("sampled from an empty distribution".to_string()))
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use candle_core::{DType, Device};
  use candle_nn::VarMap;
  use rand::SeedableRng;
  use rand::rngs::StdRng;

  fn summaries() -> (Tensor, Tensor, Tensor) {
    let t = |v: &[f32]| Tensor::new(v, &Device::Cpu).unwrap().unsqueeze(0).unwrap();
    (t(&[0.5, -0.5, 1.0]), t(&[1.0, 0.0, 0.25]), t(&[-1.0, 2.0, 0.0]))
  }

  #[test]
  fn test_restricted_distribution() {
    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
    let scorer = ActionScorer::new(3, 5, vb).unwrap();
    let (s, a, t) = summaries();

    let dist = scorer.score(&s, &a, &t, &[1, 3, 4]).unwrap();
    assert_eq!(dist.hidden.dims(), &[1, 3]);

    let probs = dist.probabilities().unwrap();
    assert_eq!(probs.iter().map(|(id, _)| *id).collect::<Vec<_>>(), vec![1, 3, 4]);
    let total: f32 = probs.iter().map(|(_, p)| p).sum();
    assert!((total - 1.0).abs() < 1e-5);

    assert!(dist.log_prob(3).unwrap().to_scalar::<f32>().unwrap() <= 0.0);
    assert!(matches!(dist.log_prob(0), Err(Error::Derivation(_))));
    assert!(!dist.is_legal(2));

    let mut rng = StdRng::seed_from_u64(11);
    for _ in 0..20 {
      assert!(dist.is_legal(dist.sample(&mut rng).unwrap()));
    }
  }

  #[test]
  fn test_single_legal_action_is_certain() {
    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
    let scorer = ActionScorer::new(3, 4, vb).unwrap();
    let (s, a, t) = summaries();

    let dist = scorer.score(&s, &a, &t, &[2]).unwrap();
    assert!(dist.log_prob(2).unwrap().to_scalar::<f32>().unwrap().abs() < 1e-6);
    assert!(scorer.score(&s, &a, &t, &[]).is_err());
  }
}
