//! Word-level sub-models: composing a word embedding from its characters, and
//! scoring or sampling words from a parser hidden state with a class-factored
//! softmax.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::Path;
use std::str::FromStr;

use candle_core::{D, Tensor};
use candle_nn::{Embedding, Linear, Module, VarBuilder, ops::log_softmax};
use rand::RngCore;
use tracing::warn;

use crate::dict::{CharId, SymbolTable, VocabularyBuilder, Vocabularies, WordId};
use crate::error::{Error, Result};
use crate::utils::sample_log_probs;

/// Maps a word's characters to one embedding row of shape `(1, dim)`
pub trait WordComposer {
  fn embed(&self, chars: &[CharId]) -> Result<Tensor>;
}

/// The available word composition variants
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub enum CharModelKind {
  #[default]
  Addition,
}

impl CharModelKind {
  pub fn build(self, n_chars: usize, dim: usize, vb: VarBuilder) -> Result<Box<dyn WordComposer>> {
    match self {
      Self::Addition => Ok(Box::new(AdditionModel::new(n_chars, dim, vb)?)),
    }
  }
}

impl FromStr for CharModelKind {
  type Err = Error;

  fn from_str(s: &str) -> Result<Self> {
    match s {
      "addition" => Ok(Self::Addition),
      other => Err(Error::Config(format!(
        "char embeddings model of '{}' is not recognized",
        other
      ))),
    }
  }
}

/// Sums the embeddings of a word's characters
#[derive(Debug)]
pub struct AdditionModel {
  chars: Embedding,
}

impl AdditionModel {
  pub fn new(n_chars: usize, dim: usize, vb: VarBuilder) -> Result<Self> {
    Ok(Self {
      chars: candle_nn::embedding(n_chars, dim, vb.pp("chars"))?,
    })
  }
}

impl WordComposer for AdditionModel {
  fn embed(&self, chars: &[CharId]) -> Result<Tensor> {
    if chars.is_empty() {
      return Err(Error::Vocab("cannot compose an empty word".to_string()));
    }
    let ids = chars.iter().map(|&c| c as u32).collect::<Vec<_>>();
    let ids = Tensor::from_vec(ids, chars.len(), self.chars.embeddings().device())?;
    Ok(self.chars.forward(&ids)?.sum_keepdim(0)?)
  }
}

/// Scores words given the parser's hidden state
pub trait WordScorer {
  /// Negative log-probability of `word`, as a scalar tensor
  fn neg_log_prob(&self, hidden: &Tensor, word: WordId) -> Result<Tensor>;

  fn sample(&self, hidden: &Tensor, rng: &mut dyn RngCore) -> Result<WordId>;
}

/// Partition of the term vocabulary into word classes
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ClusterMap {
  names: Vec<String>,
  members: Vec<Vec<WordId>>,
}

impl ClusterMap {
  pub fn new() -> Self {
    Default::default()
  }

  /// Reads `cluster<TAB>word[<TAB>count]` lines, interning every word so that
  /// clustered words are in the vocabulary even if training never shows them.
  pub fn read_from_file<P: AsRef<Path>>(path: P, builder: &mut VocabularyBuilder) -> Result<Self> {
    let path = path.as_ref();
    let text = fs::read_to_string(path)?;

    let mut map = Self::new();
    let mut by_name: HashMap<String, usize> = HashMap::new();
    let mut seen: HashMap<WordId, usize> = HashMap::new();
    for (idx, line) in text.lines().enumerate() {
      if line.trim().is_empty() {
        continue;
      }
      let mut fields = line.split_whitespace();
      let (Some(name), Some(word)) = (fields.next(), fields.next()) else {
        return Err(Error::Input {
          path: path.to_path_buf(),
          line: idx + 1,
          msg: "expected cluster and word".to_string(),
        });
      };

      let word = builder.term(word)?;
      if let Some(prev) = seen.insert(word, idx + 1) {
        return Err(Error::Input {
          path: path.to_path_buf(),
          line: idx + 1,
          msg: format!("word already clustered on line {}", prev),
        });
      }
      let cluster = *by_name.entry(name.to_string()).or_insert_with(|| {
        map.names.push(name.to_string());
        map.members.push(Vec::new());
        map.names.len() - 1
      });
      map.members[cluster].push(word);
    }

    Ok(map)
  }

  /// Puts every term the clusters don't mention (other than `<s>`) into one
  /// extra cluster.
  pub fn cover(mut self, vocab: &Vocabularies) -> Self {
    let covered = self.members.iter().flatten().copied().collect::<HashSet<_>>();
    let missing = (1..vocab.terms().len())
      .filter(|w| !covered.contains(w))
      .collect::<Vec<_>>();
    if !missing.is_empty() {
      if !self.members.is_empty() {
        warn!("{} words have no cluster, adding a fallback cluster", missing.len());
      }
      self.names.push("<fallback>".to_string());
      self.members.push(missing);
    }
    self
  }

  pub fn len(&self) -> usize {
    self.members.len()
  }

  pub fn is_empty(&self) -> bool {
    self.members.is_empty()
  }

  pub fn members(&self, cluster: usize) -> &[WordId] {
    &self.members[cluster]
  }

  pub fn name(&self, cluster: usize) -> &str {
    &self.names[cluster]
  }
}

/// `p(w | h) = p(class(w) | h) * p(w | class(w), h)`. Singleton classes have
/// no word-level layer.
#[derive(Debug)]
pub struct ClassFactoredSoftmax {
  class_layer: Linear,
  word_layers: Vec<Option<Linear>>,
  clusters: Vec<Vec<WordId>>,
  /// word id -> (cluster, position in cluster)
  positions: HashMap<WordId, (usize, usize)>,
}

impl ClassFactoredSoftmax {
  pub fn new(hidden_dim: usize, clusters: &ClusterMap, vb: VarBuilder) -> Result<Self> {
    if clusters.is_empty() {
      return Err(Error::Config("word clusters are empty".to_string()));
    }

    let class_layer = candle_nn::linear(hidden_dim, clusters.len(), vb.pp("classes"))?;
    let mut word_layers = Vec::with_capacity(clusters.len());
    let mut positions = HashMap::new();
    for c in 0..clusters.len() {
      let members = clusters.members(c);
      for (pos, &w) in members.iter().enumerate() {
        positions.insert(w, (c, pos));
      }
      word_layers.push(if members.len() > 1 {
        Some(candle_nn::linear(hidden_dim, members.len(), vb.pp(format!("cluster{}", c)))?)
      } else {
        None
      });
    }

    Ok(Self {
      class_layer,
      word_layers,
      clusters: (0..clusters.len()).map(|c| clusters.members(c).to_vec()).collect(),
      positions,
    })
  }

  fn class_log_probs(&self, hidden: &Tensor) -> Result<Tensor> {
    Ok(log_softmax(&self.class_layer.forward(hidden)?, D::Minus1)?.squeeze(0)?)
  }

  fn word_log_probs(&self, cluster: usize, hidden: &Tensor) -> Result<Option<Tensor>> {
    match &self.word_layers[cluster] {
      Some(layer) => Ok(Some(log_softmax(&layer.forward(hidden)?, D::Minus1)?.squeeze(0)?)),
      None => Ok(None),
    }
  }
}

impl WordScorer for ClassFactoredSoftmax {
  fn neg_log_prob(&self, hidden: &Tensor, word: WordId) -> Result<Tensor> {
    let &(cluster, pos) = self
      .positions
      .get(&word)
      .ok_or_else(|| Error::Vocab(format!("word id {} belongs to no cluster", word)))?;

    let class_lp = self.class_log_probs(hidden)?.get(cluster)?;
    let lp = match self.word_log_probs(cluster, hidden)? {
      Some(word_lps) => (class_lp + word_lps.get(pos)?)?,
      None => class_lp,
    };
    Ok(lp.neg()?)
  }

  fn sample(&self, hidden: &Tensor, rng: &mut dyn RngCore) -> Result<WordId> {
    let class_lps = self.class_log_probs(hidden)?.to_vec1::<f32>()?;
    let cluster = sample_log_probs(&class_lps, rng)
      .ok_or_else(|| Error::Config("word clusters are empty".to_string()))?;

    let pos = match self.word_log_probs(cluster, hidden)? {
      Some(word_lps) => sample_log_probs(&word_lps.to_vec1::<f32>()?, rng).unwrap_or(0),
      None => 0,
    };
    Ok(self.clusters[cluster][pos])
  }
}
