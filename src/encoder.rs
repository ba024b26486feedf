use candle_core::Tensor;
use candle_nn::rnn::LSTMState;
use candle_nn::{LSTM, LSTMConfig, RNN, VarBuilder};

use crate::error::{Error, Result};

/// Parameters of a multi-layer LSTM. Running state lives in `SequenceEncoder`,
/// so one set of parameters serves any number of parses.
#[derive(Debug, Clone)]
pub struct StackedLstm {
  layers: Vec<LSTM>,
}

impl StackedLstm {
  pub fn new(layers: usize, input_dim: usize, hidden_dim: usize, vb: VarBuilder) -> Result<Self> {
    if layers == 0 {
      return Err(Error::Config("an LSTM needs at least one layer".to_string()));
    }
    let layers = (0..layers)
      .map(|l| {
        let in_dim = if l == 0 { input_dim } else { hidden_dim };
        candle_nn::lstm(in_dim, hidden_dim, LSTMConfig::default(), vb.pp(format!("layer{}", l)))
      })
      .collect::<candle_core::Result<Vec<_>>>()?;
    Ok(Self { layers })
  }

  fn zero_state(&self) -> Result<Vec<LSTMState>> {
    Ok(
      self
        .layers
        .iter()
        .map(|l| l.zero_state(1))
        .collect::<candle_core::Result<Vec<_>>>()?,
    )
  }

  /// Feeds `input` (shape `(1, input_dim)`) through every layer
  fn step(&self, input: &Tensor, prev: &[LSTMState]) -> Result<Vec<LSTMState>> {
    let mut next = Vec::with_capacity(self.layers.len());
    let mut x = input.clone();
    for (layer, state) in self.layers.iter().zip(prev) {
      let s = layer.step(&x, state)?;
      x = s.h().clone();
      next.push(s);
    }
    Ok(next)
  }

  /// Starts a fresh encoder. `dropout` is applied to every summary read.
  pub fn encoder(&self, dropout: Option<f32>) -> Result<SequenceEncoder<'_>> {
    Ok(SequenceEncoder {
      lstm: self,
      states: vec![self.zero_state()?],
      dropout,
    })
  }

  /// Runs a whole sequence from the zero state and returns the final top-layer
  /// hidden state
  pub fn run<'a, I>(&self, inputs: I) -> Result<Tensor>
  where
    I: IntoIterator<Item = &'a Tensor>,
  {
    let mut state = self.zero_state()?;
    for input in inputs {
      state = self.step(input, &state)?;
    }
    top_hidden(&state)
  }
}

fn top_hidden(state: &[LSTMState]) -> Result<Tensor> {
  state
    .last()
    .map(|s| s.h().clone())
    .ok_or_else(|| Error::Config("an LSTM needs at least one layer".to_string()))
}

/// Running summary of a sequence that can be extended and rewound.
///
/// Every push keeps its own snapshot of all layer states, so `pop` is a
/// truncation back to the previous snapshot.
#[derive(Debug)]
pub struct SequenceEncoder<'a> {
  lstm: &'a StackedLstm,
  /// `states[0]` is the zero state, `states[i]` the state after `i` pushes
  states: Vec<Vec<LSTMState>>,
  dropout: Option<f32>,
}

impl SequenceEncoder<'_> {
  pub fn push(&mut self, input: &Tensor) -> Result<()> {
    let prev = self.states.last().ok_or(Error::EncoderUnderflow)?;
    let next = self.lstm.step(input, prev)?;
    self.states.push(next);
    Ok(())
  }

  pub fn pop(&mut self) -> Result<()> {
    if self.states.len() <= 1 {
      return Err(Error::EncoderUnderflow);
    }
    self.states.pop();
    Ok(())
  }

  /// Top-layer hidden state after the most recent push
  pub fn summary(&self) -> Result<Tensor> {
    let last = self.states.last().ok_or(Error::EncoderUnderflow)?;
    let h = top_hidden(last)?;
    match self.dropout {
      Some(p) if p > 0.0 => Ok(candle_nn::ops::dropout(&h, p)?),
      _ => Ok(h),
    }
  }

  /// Number of pushes not yet popped
  pub fn len(&self) -> usize {
    self.states.len() - 1
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use candle_core::{DType, Device};
  use candle_nn::VarMap;

  fn row(values: &[f32]) -> Tensor {
    Tensor::new(values, &Device::Cpu).unwrap().unsqueeze(0).unwrap()
  }

  #[test]
  fn test_pop_restores_summary() {
    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
    let lstm = StackedLstm::new(2, 3, 4, vb).unwrap();
    let mut enc = lstm.encoder(None).unwrap();

    enc.push(&row(&[1.0, 0.0, -1.0])).unwrap();
    let after_one = enc.summary().unwrap().to_vec2::<f32>().unwrap();
    assert_eq!(after_one[0].len(), 4);

    enc.push(&row(&[0.5, 0.5, 0.5])).unwrap();
    assert_ne!(enc.summary().unwrap().to_vec2::<f32>().unwrap(), after_one);
    assert_eq!(enc.len(), 2);

    enc.pop().unwrap();
    assert_eq!(enc.summary().unwrap().to_vec2::<f32>().unwrap(), after_one);

    enc.pop().unwrap();
    assert!(enc.is_empty());
    assert!(matches!(enc.pop(), Err(Error::EncoderUnderflow)));
  }

  #[test]
  fn test_run_matches_pushes() {
    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
    let lstm = StackedLstm::new(1, 2, 3, vb).unwrap();
    let xs = [row(&[1.0, 2.0]), row(&[-1.0, 0.5])];

    let mut enc = lstm.encoder(None).unwrap();
    for x in xs.iter() {
      enc.push(x).unwrap();
    }
    assert_eq!(
      enc.summary().unwrap().to_vec2::<f32>().unwrap(),
      lstm.run(xs.iter()).unwrap().to_vec2::<f32>().unwrap()
    );
  }

  #[test]
  fn test_zero_layers_rejected() {
    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
    assert!(StackedLstm::new(0, 2, 3, vb).is_err());
  }
}
