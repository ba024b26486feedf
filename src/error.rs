use std::path::PathBuf;

use thiserror::Error;

/// Everything that can go wrong while building vocabularies, reading oracles,
/// running derivations or training.
///
/// None of these are transient: a caller that gets one back should stop the
/// run rather than retry.
#[derive(Debug, Error)]
pub enum Error {
  /// Missing or contradictory options, unknown model variants.
  #[error("configuration error: {0}")]
  Config(String),

  #[error("vocabulary error: {0}")]
  Vocab(String),

  #[error("{}:{line}: {msg}", path.display())]
  Input {
    path: PathBuf,
    line: usize,
    msg: String,
  },

  /// The reference action sequence does not agree with the transition system.
  #[error("derivation inconsistency: {0}")]
  Derivation(String),

  #[error("no legal actions (stack size {stack_size}, {open} open constituents)")]
  NoLegalActions { stack_size: usize, open: usize },

  #[error("malformed configuration: {0}")]
  Malformed(String),

  /// A sampled derivation hit its action budget before the tree was complete.
  #[error("generation gave up after {actions} actions without completing a tree")]
  GenerationLimit { actions: usize },

  #[error("tried to rewind an encoder past its initial state")]
  EncoderUnderflow,

  #[error("negative loss {loss} on sentence {sentence}")]
  NegativeLoss { sentence: usize, loss: f64 },

  #[error(transparent)]
  Tensor(#[from] candle_core::Error),

  #[error(transparent)]
  Io(#[from] std::io::Error),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
