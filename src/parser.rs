use candle_core::Tensor;
use rand::RngCore;
use tracing::trace;

use crate::actions::Action;
use crate::configuration::{Configuration, Tree};
use crate::dict::{ActionId, Vocabularies, WordId};
use crate::error::{Error, Result};
use crate::model::ParserModel;
use crate::oracle::Sentence;

/// Where the next action (and the next word) come from
enum Mode<'r> {
  /// Follow a reference derivation and accumulate its negative log-likelihood
  Forced {
    sentence: &'r Sentence,
    actions: &'r [ActionId],
  },
  /// Draw from the model, giving up after `max_actions` actions
  Sample {
    rng: &'r mut dyn RngCore,
    max_actions: usize,
  },
}

/// Result of one run of the parser
#[derive(Debug, Clone)]
pub struct ParseOutcome {
  /// every action taken, in order
  pub actions: Vec<ActionId>,
  /// every word generated, in order
  pub words: Vec<WordId>,
  pub tree: Tree,
  /// scalar joint negative log-likelihood of actions and words; only computed
  /// when following a reference derivation
  pub loss: Option<Tensor>,
}

impl ParseOutcome {
  pub fn nll(&self) -> Result<Option<f64>> {
    self
      .loss
      .as_ref()
      .map(|l| Ok(f64::from(l.to_scalar::<f32>()?)))
      .transpose()
  }
}

/// The transition-based generative parser, driving a `ParserModel` over one
/// sentence at a time. All per-sentence state lives inside a single call.
pub struct Parser<'a> {
  model: &'a ParserModel,
  vocab: &'a Vocabularies,
}

impl<'a> Parser<'a> {
  pub fn new(model: &'a ParserModel, vocab: &'a Vocabularies) -> Self {
    Self { model, vocab }
  }

  /// Forced decoding of `actions` over `sentence`. With `training`, dropout is
  /// applied at the configured rate.
  pub fn score(&self, sentence: &Sentence, actions: &[ActionId], training: bool) -> Result<ParseOutcome> {
    let p = self.model.config().dropout;
    let dropout = if training && p > 0.0 { Some(p) } else { None };
    self.run(Mode::Forced { sentence, actions }, dropout)
  }

  /// Samples a derivation, and with it a sentence, from the model. Fails with
  /// `Error::GenerationLimit` if the tree is not complete after `max_actions`
  /// actions.
  pub fn generate(&self, rng: &mut dyn RngCore, max_actions: usize) -> Result<ParseOutcome> {
    self.run(Mode::Sample { rng, max_actions }, None)
  }

  fn run(&self, mut mode: Mode<'_>, dropout: Option<f32>) -> Result<ParseOutcome> {
    let m = self.model;
    let set = self.vocab.actions();

    let mut stack_enc = m.stack_lstm.encoder(dropout)?;
    let mut action_enc = m.action_lstm.encoder(dropout)?;
    let mut term_enc = m.term_lstm.encoder(dropout)?;
    stack_enc.push(m.stack_guard())?;
    action_enc.push(m.action_start())?;
    term_enc.push(m.term_start())?;

    let mut config = Configuration::new(m.stack_guard().clone());
    let mut nll_terms: Vec<Tensor> = Vec::new();
    let mut words = Vec::new();
    let mut next_ref = 0;

    while !config.is_final() {
      if let Mode::Sample { max_actions, .. } = &mode
        && config.history().len() >= *max_actions
      {
        return Err(Error::GenerationLimit { actions: *max_actions });
      }
      let legal = config.legal_actions(set);
      if legal.is_empty() {
        return Err(Error::NoLegalActions {
          stack_size: config.stack_size(),
          open: config.open_count(),
        });
      }

      let dist = m.scorer.score(
        &stack_enc.summary()?,
        &action_enc.summary()?,
        &term_enc.summary()?,
        &legal,
      )?;
      let id = match &mut mode {
        Mode::Forced { actions, .. } => {
          let id = *actions.get(next_ref).ok_or_else(|| {
            Error::Derivation(format!(
              "reference ran out after {} actions, before the tree was complete",
              next_ref
            ))
          })?;
          next_ref += 1;
          nll_terms.push(dist.log_prob(id)?.neg()?);
          id
        }
        Mode::Sample { rng, .. } => dist.sample(&mut **rng)?,
      };
      let action = set
        .get(id)
        .ok_or_else(|| Error::Vocab(format!("action id {} is out of range", id)))?;
      trace!(
        "step {}: {} (stack {}, open {}, terminals {})",
        config.history().len(),
        self.vocab.action_name(id)?,
        config.stack_size(),
        config.open_count(),
        config.terminals()
      );

      action_enc.push(&m.action_embedding(id)?)?;
      match action {
        Action::Shift => {
          let (word, surface) = match &mut mode {
            Mode::Forced { sentence, .. } => {
              let t = config.terminals();
              let word = *sentence
                .raw
                .get(t)
                .ok_or_else(|| Error::Derivation(format!("SHIFT past the end of a {} word sentence", sentence.len())))?;
              nll_terms.push(m.word_scorer().neg_log_prob(&dist.hidden, word)?);
              let surface = match sentence.surface.get(t) {
                Some(s) => s.clone(),
                None => self.vocab.term(word)?.to_string(),
              };
              (word, surface)
            }
            Mode::Sample { rng, .. } => {
              let word = m.word_scorer().sample(&dist.hidden, &mut **rng)?;
              (word, self.vocab.term(word)?.to_string())
            }
          };
          let embedding = m.word_embedding(self.vocab, word)?;
          term_enc.push(&embedding)?;
          stack_enc.push(&embedding)?;
          config.shift(surface, embedding);
          words.push(word);
        }
        Action::Open(nt) => {
          let embedding = m.nt_embedding(nt)?;
          stack_enc.push(&embedding)?;
          config.open(nt, self.vocab.nonterminal(nt)?.to_string(), embedding);
        }
        Action::Reduce => {
          let popped = config.reduce(|nt, children| {
            m.composer.compose(&m.composed_label(nt)?, children, dropout)
          })?;
          for _ in 0..popped {
            stack_enc.pop()?;
          }
          let top = config
            .top()
            .map(|e| e.embedding.clone())
            .ok_or_else(|| Error::Malformed("empty stack after REDUCE".to_string()))?;
          stack_enc.push(&top)?;
        }
      }
      config.record(id, action);
    }

    let loss = match &mode {
      Mode::Forced { sentence, actions } => {
        if next_ref != actions.len() {
          return Err(Error::Derivation(format!(
            "tree complete with {} reference actions left over",
            actions.len() - next_ref
          )));
        }
        if config.terminals() != sentence.len() {
          return Err(Error::Derivation(format!(
            "tree complete after {} of {} words",
            config.terminals(),
            sentence.len()
          )));
        }
        Some(Tensor::stack(&nll_terms, 0)?.sum_all()?)
      }
      Mode::Sample { .. } => None,
    };

    let actions = config.history().to_vec();
    let tree = config
      .into_tree()
      .ok_or_else(|| Error::Malformed("final configuration is not a single rooted tree".to_string()))?;
    Ok(ParseOutcome {
      actions,
      words,
      tree,
      loss,
    })
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::dict::{SymbolTable, VocabularyBuilder};
  use crate::model::ModelConfig;
  use crate::words::ClusterMap;
  use candle_core::Device;
  use rand::SeedableRng;
  use rand::rngs::StdRng;

  fn setup() -> (Vocabularies, ParserModel) {
    let mut b = VocabularyBuilder::new();
    b.term("the").unwrap();
    b.term("dog").unwrap();
    b.action("NT(NP)").unwrap();
    b.action("SHIFT").unwrap();
    b.action("REDUCE").unwrap();
    let vocab = b.freeze().unwrap();
    let clusters = ClusterMap::new().cover(&vocab);
    let config = ModelConfig {
      layers: 1,
      input_dim: 8,
      hidden_dim: 8,
      action_dim: 4,
      ..Default::default()
    };
    let model = ParserModel::new(config, &vocab, &clusters).unwrap();
    (vocab, model)
  }

  fn the_dog(vocab: &Vocabularies) -> Sentence {
    Sentence::new(
      vec!["The".to_string(), "dog".to_string()],
      vec![vocab.term_id("the").unwrap(), vocab.term_id("dog").unwrap()],
    )
  }

  #[test]
  fn test_forced_decoding() {
    let (vocab, model) = setup();
    let parser = Parser::new(&model, &vocab);
    let sentence = the_dog(&vocab);
    // NT(NP) SHIFT SHIFT REDUCE
    let actions = [0, 1, 1, 2];

    let out = parser.score(&sentence, &actions, false).unwrap();
    let nll = out.nll().unwrap().unwrap();
    assert!(nll.is_finite() && nll >= 0.0);
    assert_eq!(out.actions, actions);
    assert_eq!(out.words, sentence.raw);
    assert_eq!(out.tree.to_string(), "(NP The dog)");

    // scoring is deterministic without dropout
    let again = parser.score(&sentence, &actions, false).unwrap();
    assert_eq!(again.nll().unwrap().unwrap(), nll);
  }

  #[test]
  fn test_bad_derivations() {
    let (vocab, model) = setup();
    let parser = Parser::new(&model, &vocab);
    let sentence = the_dog(&vocab);

    // stops before the tree is complete
    assert!(matches!(
      parser.score(&sentence, &[0, 1, 1], false),
      Err(Error::Derivation(_))
    ));
    // actions left over after the tree is complete
    assert!(matches!(
      parser.score(&sentence, &[0, 1, 1, 2, 1], false),
      Err(Error::Derivation(_))
    ));
    // more SHIFTs than words
    assert!(matches!(
      parser.score(&sentence, &[0, 1, 1, 1, 2], false),
      Err(Error::Derivation(_))
    ));
    // a word never generated
    assert!(matches!(
      parser.score(&sentence, &[0, 1, 2], false),
      Err(Error::Derivation(_))
    ));
    // REDUCE straight after NT is illegal
    assert!(matches!(
      parser.score(&sentence, &[0, 2], false),
      Err(Error::Derivation(_))
    ));
  }

  #[test]
  fn test_generation_follows_biased_scorer() {
    let (vocab, model) = setup();
    // strongly prefer REDUCE, then SHIFT, whenever they are legal
    let bias = Tensor::new(&[0f32, 10.0, 20.0], &Device::Cpu).unwrap();
    model.varmap().clone().set_one("scorer.out.bias", &bias).unwrap();

    let parser = Parser::new(&model, &vocab);
    let mut rng = StdRng::seed_from_u64(5);
    let out = parser.generate(&mut rng, 100).unwrap();

    assert_eq!(out.actions, vec![0, 1, 2]);
    assert_eq!(out.words.len(), 1);
    assert!(out.loss.is_none());
    assert_eq!(out.tree.span(), (0, 1));
    assert!(out.tree.to_string().starts_with("(NP "));
  }

  #[test]
  fn test_generation_stops_at_action_limit() {
    let (vocab, model) = setup();
    let parser = Parser::new(&model, &vocab);

    // no tree is complete in fewer than three actions
    let mut rng = StdRng::seed_from_u64(0);
    assert!(matches!(
      parser.generate(&mut rng, 2),
      Err(Error::GenerationLimit { actions: 2 })
    ));

    // an untrained model either finishes within the limit or gives up at it
    for seed in 0..5 {
      let mut rng = StdRng::seed_from_u64(seed);
      match parser.generate(&mut rng, 50) {
        Ok(out) => {
          assert!(out.actions.len() <= 50);
          assert_eq!(out.tree.span(), (0, out.words.len()));
        }
        Err(Error::GenerationLimit { actions }) => assert_eq!(actions, 50),
        Err(e) => panic!("unexpected error {}", e),
      }
    }
  }
}
