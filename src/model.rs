use std::path::Path;

use candle_core::{DType, Device, Tensor, Var};
use candle_nn::{Embedding, Init, Module, VarBuilder, VarMap};
use tracing::info;

use crate::composer::TreeComposer;
use crate::dict::{ActionId, NtId, Vocabularies, WordId};
use crate::encoder::StackedLstm;
use crate::error::{Error, Result};
use crate::scorer::ActionScorer;
use crate::words::{CharModelKind, ClassFactoredSoftmax, ClusterMap, WordComposer, WordScorer};

/// Model hyperparameters
#[derive(Debug, Clone, PartialEq)]
pub struct ModelConfig {
  /// layers of the stack, action and terminal LSTMs
  pub layers: usize,
  /// size of word, nonterminal and composed constituent embeddings
  pub input_dim: usize,
  pub hidden_dim: usize,
  pub action_dim: usize,
  /// 0 disables dropout
  pub dropout: f32,
  pub char_model: CharModelKind,
}

impl Default for ModelConfig {
  fn default() -> Self {
    Self {
      layers: 2,
      input_dim: 32,
      hidden_dim: 64,
      action_dim: 16,
      dropout: 0.0,
      char_model: CharModelKind::Addition,
    }
  }
}

impl ModelConfig {
  pub fn validate(&self) -> Result<()> {
    if self.layers == 0 || self.input_dim == 0 || self.hidden_dim == 0 || self.action_dim == 0 {
      return Err(Error::Config("layer count and dimensions must be positive".to_string()));
    }
    if !(0.0..1.0).contains(&self.dropout) {
      return Err(Error::Config(format!("dropout {} is not in [0, 1)", self.dropout)));
    }
    Ok(())
  }

  /// File name checkpoints of this configuration are written to
  pub fn checkpoint_name(&self, pid: u32) -> String {
    format!(
      "ntparse_gen_D{}_{}_{}_{}_{}-pid{}.safetensors",
      self.dropout, self.layers, self.input_dim, self.hidden_dim, self.action_dim, pid
    )
  }
}

/// Every parameter of the generative parser. Parameters live in one `VarMap`,
/// which is what checkpoints save and load.
pub struct ParserModel {
  config: ModelConfig,
  varmap: VarMap,
  pub(crate) stack_lstm: StackedLstm,
  pub(crate) term_lstm: StackedLstm,
  pub(crate) action_lstm: StackedLstm,
  pub(crate) composer: TreeComposer,
  pub(crate) scorer: ActionScorer,
  nt_embeddings: Embedding,
  /// nonterminal embeddings used when composing a closed constituent
  ntup_embeddings: Embedding,
  action_embeddings: Embedding,
  stack_guard: Tensor,
  action_start: Tensor,
  term_start: Tensor,
  word_composer: Box<dyn WordComposer>,
  word_scorer: Box<dyn WordScorer>,
}

impl ParserModel {
  /// Builds freshly initialized parameters for `vocab`. `clusters` must cover
  /// every term that can be scored.
  pub fn new(config: ModelConfig, vocab: &Vocabularies, clusters: &ClusterMap) -> Result<Self> {
    config.validate()?;
    let device = Device::Cpu;
    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);

    let n_nts = vocab.nonterminals().len().max(1);
    let n_actions = vocab.actions().len();
    let init = Init::Uniform { lo: -0.1, up: 0.1 };

    let model = Self {
      stack_lstm: StackedLstm::new(config.layers, config.input_dim, config.hidden_dim, vb.pp("stack_lstm"))?,
      term_lstm: StackedLstm::new(config.layers, config.input_dim, config.hidden_dim, vb.pp("term_lstm"))?,
      action_lstm: StackedLstm::new(config.layers, config.action_dim, config.hidden_dim, vb.pp("action_lstm"))?,
      composer: TreeComposer::new(config.input_dim, vb.pp("composer"))?,
      scorer: ActionScorer::new(config.hidden_dim, n_actions, vb.pp("scorer"))?,
      nt_embeddings: candle_nn::embedding(n_nts, config.input_dim, vb.pp("nt"))?,
      ntup_embeddings: candle_nn::embedding(n_nts, config.input_dim, vb.pp("ntup"))?,
      action_embeddings: candle_nn::embedding(n_actions, config.action_dim, vb.pp("actions"))?,
      stack_guard: vb.get_with_hints((1, config.input_dim), "stack_guard", init)?,
      action_start: vb.get_with_hints((1, config.action_dim), "action_start", init)?,
      term_start: vb.get_with_hints((1, config.input_dim), "term_start", init)?,
      word_composer: config
        .char_model
        .build(vocab.chars().len(), config.input_dim, vb.pp("char_model"))?,
      word_scorer: Box::new(ClassFactoredSoftmax::new(config.hidden_dim, clusters, vb.pp("cfsm"))?),
      config,
      varmap,
    };
    info!(
      "built model with {} parameter tensors for {}",
      model.varmap.all_vars().len(),
      vocab
    );
    Ok(model)
  }

  pub fn config(&self) -> &ModelConfig {
    &self.config
  }

  pub fn vars(&self) -> Vec<Var> {
    self.varmap.all_vars()
  }

  pub fn varmap(&self) -> &VarMap {
    &self.varmap
  }

  pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
    self.varmap.save(path)?;
    Ok(())
  }

  /// Overwrites the parameters with a checkpoint written by `save` for the same
  /// configuration and vocabularies
  pub fn load<P: AsRef<Path>>(&mut self, path: P) -> Result<()> {
    self.varmap.load(path)?;
    Ok(())
  }

  pub(crate) fn stack_guard(&self) -> &Tensor {
    &self.stack_guard
  }

  pub(crate) fn action_start(&self) -> &Tensor {
    &self.action_start
  }

  pub(crate) fn term_start(&self) -> &Tensor {
    &self.term_start
  }

  pub(crate) fn word_scorer(&self) -> &dyn WordScorer {
    self.word_scorer.as_ref()
  }

  pub(crate) fn nt_embedding(&self, nt: NtId) -> Result<Tensor> {
    lookup(&self.nt_embeddings, nt)
  }

  pub(crate) fn composed_label(&self, nt: NtId) -> Result<Tensor> {
    lookup(&self.ntup_embeddings, nt)
  }

  pub(crate) fn action_embedding(&self, action: ActionId) -> Result<Tensor> {
    lookup(&self.action_embeddings, action)
  }

  pub(crate) fn word_embedding(&self, vocab: &Vocabularies, word: WordId) -> Result<Tensor> {
    self.word_composer.embed(&vocab.chars_of(word)?)
  }
}

/// One embedding row, shape `(1, dim)`
fn lookup(table: &Embedding, id: usize) -> Result<Tensor> {
  let ids = Tensor::new(&[id as u32], table.embeddings().device())?;
  Ok(table.forward(&ids)?)
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::dict::{SymbolTable, VocabularyBuilder};

  fn tiny_vocab() -> Vocabularies {
    let mut b = VocabularyBuilder::new();
    b.term("the").unwrap();
    b.term("dog").unwrap();
    b.action("NT(NP)").unwrap();
    b.action("SHIFT").unwrap();
    b.action("REDUCE").unwrap();
    b.freeze().unwrap()
  }

  fn tiny_config() -> ModelConfig {
    ModelConfig {
      layers: 1,
      input_dim: 6,
      hidden_dim: 8,
      action_dim: 4,
      ..Default::default()
    }
  }

  #[test]
  fn test_checkpoint_round_trip() {
    let vocab = tiny_vocab();
    let clusters = ClusterMap::new().cover(&vocab);
    let model = ParserModel::new(tiny_config(), &vocab, &clusters).unwrap();
    let mut other = ParserModel::new(tiny_config(), &vocab, &clusters).unwrap();

    let guard = model.stack_guard().to_vec2::<f32>().unwrap();
    assert_ne!(guard, other.stack_guard().to_vec2::<f32>().unwrap());

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join(tiny_config().checkpoint_name(1));
    model.save(&path).unwrap();
    other.load(&path).unwrap();
    assert_eq!(guard, other.stack_guard().to_vec2::<f32>().unwrap());
  }

  #[test]
  fn test_config_validation() {
    assert!(ModelConfig::default().validate().is_ok());
    let bad = ModelConfig {
      dropout: 1.5,
      ..Default::default()
    };
    assert!(bad.validate().is_err());
    assert_eq!(
      ModelConfig::default().checkpoint_name(42),
      "ntparse_gen_D0_2_32_64_16-pid42.safetensors"
    );
  }

  #[test]
  fn test_embedding_shapes() {
    let vocab = tiny_vocab();
    let clusters = ClusterMap::new().cover(&vocab);
    let model = ParserModel::new(tiny_config(), &vocab, &clusters).unwrap();
    assert_eq!(model.nt_embedding(0).unwrap().dims(), &[1, 6]);
    assert_eq!(model.action_embedding(2).unwrap().dims(), &[1, 4]);
    assert_eq!(model.word_embedding(&vocab, 1).unwrap().dims(), &[1, 6]);
  }
}
