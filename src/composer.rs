use std::iter;

use candle_core::Tensor;
use candle_nn::{Linear, Module, VarBuilder};

use crate::encoder::StackedLstm;
use crate::error::{Error, Result};

/// Reduces a completed constituent (label plus ordered children) to a single
/// embedding with a bidirectional one-layer LSTM.
#[derive(Debug, Clone)]
pub struct TreeComposer {
  fwd: StackedLstm,
  rev: StackedLstm,
  out: Linear,
}

impl TreeComposer {
  /// All of label, child and output embeddings have size `dim`
  pub fn new(dim: usize, vb: VarBuilder) -> Result<Self> {
    Ok(Self {
      fwd: StackedLstm::new(1, dim, dim, vb.pp("fwd"))?,
      rev: StackedLstm::new(1, dim, dim, vb.pp("rev"))?,
      out: candle_nn::linear(2 * dim, dim, vb.pp("out"))?,
    })
  }

  /// `relu(W [fwd(label, c1..cn); rev(label, cn..c1)] + b)`
  pub fn compose(&self, label: &Tensor, children: &[Tensor], dropout: Option<f32>) -> Result<Tensor> {
    if children.is_empty() {
      return Err(Error::Malformed("cannot compose a constituent without children".to_string()));
    }

    let mut cfwd = self.fwd.run(iter::once(label).chain(children.iter()))?;
    let mut crev = self.rev.run(iter::once(label).chain(children.iter().rev()))?;
    if let Some(p) = dropout.filter(|&p| p > 0.0) {
      cfwd = candle_nn::ops::dropout(&cfwd, p)?;
      crev = candle_nn::ops::dropout(&crev, p)?;
    }

    let c = Tensor::cat(&[cfwd, crev], 1)?;
    Ok(self.out.forward(&c)?.relu()?)
  }
}
