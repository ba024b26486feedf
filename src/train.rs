//! Training, dev evaluation with early stopping, and rescoring.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use candle_core::Var;
use candle_core::backprop::GradStore;
use candle_nn::{Optimizer, SGD};
use rand::RngCore;
use rand::seq::SliceRandom;
use tracing::{debug, info, warn};

use crate::dict::{ActionId, Vocabularies, WordId};
use crate::error::{Error, Result};
use crate::model::ParserModel;
use crate::oracle::Corpus;
use crate::parser::Parser;
use crate::utils::perplexity;

/// Set from outside (e.g. a signal handler) to ask training to stop after the
/// sentence in flight
pub type StopFlag = Arc<AtomicBool>;

#[derive(Debug, Clone, PartialEq)]
pub struct TrainConfig {
  /// sentences per status block
  pub status_every: usize,
  /// dev evaluation every this many blocks, 0 to disable
  pub report_every: usize,
  /// one sampled tree every this many blocks, 0 to disable
  pub generate_every: usize,
  /// sampled derivations longer than this are abandoned
  pub max_generate_actions: usize,
  /// consecutive dev evaluations without improvement before stopping
  pub patience: usize,
  pub eta0: f64,
  pub eta_decay: f64,
  pub start_epoch: usize,
  /// gradients are rescaled to at most this global L2 norm
  pub clip_threshold: Option<f32>,
  pub max_epochs: Option<usize>,
  /// checkpoints are written here
  pub model_dir: PathBuf,
}

impl Default for TrainConfig {
  fn default() -> Self {
    Self {
      status_every: 100,
      report_every: 25,
      generate_every: 100,
      max_generate_actions: 1000,
      patience: 10,
      eta0: 0.1,
      eta_decay: 0.08,
      start_epoch: 0,
      clip_threshold: Some(5.0),
      max_epochs: None,
      model_dir: PathBuf::from("."),
    }
  }
}

/// `eta0 / (1 + epoch * decay)`
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LearningRate {
  pub eta0: f64,
  pub decay: f64,
}

impl LearningRate {
  pub fn at(&self, epoch: usize) -> f64 {
    self.eta0 / (1.0 + epoch as f64 * self.decay)
  }
}

/// Early stopping on a score where lower is better
#[derive(Debug, Clone, PartialEq)]
pub struct Patience {
  best: f64,
  counter: usize,
  limit: usize,
}

impl Patience {
  pub fn new(limit: usize) -> Self {
    Self {
      best: f64::INFINITY,
      counter: 0,
      limit,
    }
  }

  /// Records one evaluation, returning whether it is a new best
  pub fn observe(&mut self, score: f64) -> bool {
    if score < self.best {
      self.best = score;
      self.counter = 0;
      true
    } else {
      self.counter += 1;
      false
    }
  }

  pub fn exhausted(&self) -> bool {
    self.counter >= self.limit
  }

  pub fn best(&self) -> f64 {
    self.best
  }

  pub fn counter(&self) -> usize {
    self.counter
  }
}

/// Rescales every gradient in `grads` belonging to `vars` so that their joint L2
/// norm is at most `threshold`. Returns the norm before clipping.
pub fn clip_gradients(grads: &mut GradStore, vars: &[Var], threshold: f32) -> Result<f32> {
  let mut sq = 0f32;
  for v in vars {
    if let Some(g) = grads.get(v.as_tensor()) {
      sq += g.sqr()?.sum_all()?.to_scalar::<f32>()?;
    }
  }
  let norm = sq.sqrt();
  if norm > threshold {
    let scale = f64::from(threshold / norm);
    for v in vars {
      if let Some(g) = grads.remove(v.as_tensor()) {
        grads.insert(v.as_tensor(), g.affine(scale, 0.0)?);
      }
    }
  }
  Ok(norm)
}

/// Summed negative log-likelihood over a set of sentences
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Evaluation {
  pub nll: f64,
  pub sentences: usize,
  pub words: usize,
  pub actions: usize,
}

impl Evaluation {
  fn add(&mut self, nll: f64, words: usize, actions: usize) {
    self.nll += nll;
    self.sentences += 1;
    self.words += words;
    self.actions += actions;
  }

  pub fn word_perplexity(&self) -> f64 {
    perplexity(self.nll, self.words)
  }

  pub fn action_perplexity(&self) -> f64 {
    perplexity(self.nll, self.actions)
  }

  /// Mean negative log-likelihood per sentence
  pub fn sentence_nll(&self) -> f64 {
    if self.sentences == 0 {
      0.0
    } else {
      self.nll / self.sentences as f64
    }
  }
}

/// Memoized scores keyed by sentence, then by derivation
#[derive(Debug, Default)]
pub struct RescoreCache {
  scores: HashMap<Vec<WordId>, HashMap<Vec<ActionId>, f64>>,
  hits: usize,
  misses: usize,
}

impl RescoreCache {
  pub fn new() -> Self {
    Default::default()
  }

  /// Cached score of `(sentence, actions)`, running `score` only the first time
  /// the pair is seen
  pub fn get_or_score<F>(&mut self, sentence: &[WordId], actions: &[ActionId], score: F) -> Result<f64>
  where
    F: FnOnce() -> Result<f64>,
  {
    let by_actions = self.scores.entry(sentence.to_vec()).or_default();
    if let Some(&cached) = by_actions.get(actions) {
      self.hits += 1;
      return Ok(cached);
    }
    let value = score()?;
    by_actions.insert(actions.to_vec(), value);
    self.misses += 1;
    Ok(value)
  }

  /// Number of distinct pairs scored
  pub fn len(&self) -> usize {
    self.scores.values().map(HashMap::len).sum()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  pub fn hits(&self) -> usize {
    self.hits
  }

  pub fn misses(&self) -> usize {
    self.misses
  }
}

/// One rescored sentence
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Rescored {
  pub len: usize,
  pub nll: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TrainSummary {
  pub best_dev_nll: f64,
  pub evaluations: usize,
  pub updates: usize,
  /// SGD learning rate when training ended
  pub learning_rate: f64,
  /// path of the last checkpoint written, if any
  pub checkpoint: Option<PathBuf>,
}

/// `every == 0` disables the event; otherwise it fires on blocks 1, every + 1, ...
fn due(block: usize, every: usize) -> bool {
  every != 0 && block % every == 1 % every
}

pub struct Trainer<'a> {
  model: &'a ParserModel,
  vocab: &'a Vocabularies,
  config: TrainConfig,
  stop: StopFlag,
}

impl<'a> Trainer<'a> {
  pub fn new(model: &'a ParserModel, vocab: &'a Vocabularies, config: TrainConfig, stop: StopFlag) -> Self {
    Self {
      model,
      vocab,
      config,
      stop,
    }
  }

  fn parser(&self) -> Parser<'a> {
    Parser::new(self.model, self.vocab)
  }

  fn stop_requested(&self) -> bool {
    self.stop.load(Ordering::SeqCst)
  }

  /// Trains on `train` until dev perplexity stops improving, an interrupt is
  /// requested, or the epoch limit is reached. A checkpoint is written on every
  /// dev improvement.
  pub fn train(&self, train: &Corpus, dev: &Corpus, rng: &mut dyn RngCore) -> Result<TrainSummary> {
    if train.is_empty() {
      return Err(Error::Config("training corpus is empty".to_string()));
    }
    let cfg = &self.config;
    let parser = self.parser();
    let vars = self.model.vars();
    let schedule = LearningRate {
      eta0: cfg.eta0,
      decay: cfg.eta_decay,
    };
    let mut epoch = cfg.start_epoch;
    let mut sgd = SGD::new(vars.clone(), schedule.at(epoch))?;
    let checkpoint = cfg
      .model_dir
      .join(self.model.config().checkpoint_name(std::process::id()));
    info!("writing checkpoints to {}", checkpoint.display());

    let n = train.len();
    let status_every = cfg.status_every.clamp(1, n);
    let mut order = (0..n).collect::<Vec<_>>();
    let mut si = n;
    let mut epochs_started = 0;
    let mut patience = Patience::new(cfg.patience);
    let mut summary = TrainSummary {
      best_dev_nll: f64::INFINITY,
      evaluations: 0,
      updates: 0,
      learning_rate: sgd.learning_rate(),
      checkpoint: None,
    };
    let mut block = 0;
    let mut out_of_epochs = false;

    while !self.stop_requested() && !patience.exhausted() && !out_of_epochs {
      let started = Instant::now();
      let mut stats = Evaluation::default();
      for _ in 0..status_every {
        if si == n {
          if cfg.max_epochs.is_some_and(|max| epochs_started >= max) {
            out_of_epochs = true;
            break;
          }
          si = 0;
          if epochs_started > 0 {
            epoch += 1;
            sgd.set_learning_rate(schedule.at(epoch));
            info!("** starting epoch {} (eta={:.5})", epoch, sgd.learning_rate());
          }
          epochs_started += 1;
          order.shuffle(rng);
        }

        let idx = order[si];
        let instance = &train.instances[idx];
        let out = parser.score(&instance.sentence, &instance.actions, true)?;
        let (Some(loss), Some(nll)) = (out.loss.as_ref(), out.nll()?) else {
          return Err(Error::Malformed("forced decoding produced no loss".to_string()));
        };
        if nll < 0.0 {
          return Err(Error::NegativeLoss { sentence: idx, loss: nll });
        }

        let mut grads = loss.backward()?;
        if let Some(threshold) = cfg.clip_threshold {
          let norm = clip_gradients(&mut grads, &vars, threshold)?;
          if norm > threshold {
            debug!("clipped gradient norm {:.3} on sentence {}", norm, idx);
          }
        }
        sgd.step(&grads)?;
        summary.updates += 1;
        stats.add(nll, instance.sentence.len(), instance.actions.len());
        si += 1;

        if self.stop_requested() {
          break;
        }
      }
      if stats.sentences == 0 {
        break;
      }

      block += 1;
      let fractional_epoch = epoch as f64 + si as f64 / n as f64;
      info!(
        "[epoch={:.3} eta={:.5}] per-action ppl: {:.3} per-word ppl: {:.3} per-sentence nll: {:.3} [{:.1} ms/instance]",
        fractional_epoch,
        sgd.learning_rate(),
        stats.action_perplexity(),
        stats.word_perplexity(),
        stats.sentence_nll(),
        started.elapsed().as_secs_f64() * 1000.0 / stats.sentences as f64
      );

      if due(block, cfg.generate_every) {
        match parser.generate(&mut *rng, cfg.max_generate_actions) {
          Ok(sample) => {
            let words = sample.tree.words().into_iter().cloned().collect::<Vec<_>>();
            info!("generated: {}", sample.tree);
            info!("yield ({} words): {}", words.len(), words.join(" "));
          }
          Err(Error::GenerationLimit { actions }) => {
            warn!("skipping generated sample: no complete tree after {} actions", actions);
          }
          Err(e) => return Err(e),
        }
      }

      if due(block, cfg.report_every) {
        let eval = self.evaluate(dev)?;
        summary.evaluations += 1;
        info!(
          "** dev (block={} epoch={:.3}) nll={:.3} ppl={:.3} over {} sentences",
          block,
          fractional_epoch,
          eval.nll,
          eval.word_perplexity(),
          eval.sentences
        );
        if patience.observe(eval.nll) {
          self.model.save(&checkpoint)?;
          summary.best_dev_nll = eval.nll;
          summary.checkpoint = Some(checkpoint.clone());
          info!("  new best, saved to {}", checkpoint.display());
        } else {
          info!("  no improvement ({}/{})", patience.counter(), cfg.patience);
        }
      }
    }

    summary.learning_rate = sgd.learning_rate();
    if self.stop_requested() {
      warn!("training interrupted after {} updates", summary.updates);
    } else if patience.exhausted() {
      info!("dev nll did not improve in {} evaluations, stopping", cfg.patience);
    } else {
      info!("finished {} epochs", epochs_started);
    }
    Ok(summary)
  }

  /// Scores every sentence of `corpus` without dropout
  pub fn evaluate(&self, corpus: &Corpus) -> Result<Evaluation> {
    let parser = self.parser();
    let mut eval = Evaluation::default();
    for instance in corpus.iter() {
      let out = parser.score(&instance.sentence, &instance.actions, false)?;
      let nll = out.nll()?.unwrap_or(0.0);
      eval.add(nll, instance.sentence.len(), instance.actions.len());
    }
    Ok(eval)
  }

  /// Scores every `(sentence, derivation)` pair of `corpus`, computing each
  /// distinct pair once
  pub fn rescore(&self, corpus: &Corpus, cache: &mut RescoreCache) -> Result<(Vec<Rescored>, Evaluation)> {
    let parser = self.parser();
    let mut total = Evaluation::default();
    let mut lines = Vec::with_capacity(corpus.len());
    for instance in corpus.iter() {
      let nll = cache.get_or_score(&instance.sentence.raw, &instance.actions, || {
        let out = parser.score(&instance.sentence, &instance.actions, false)?;
        Ok(out.nll()?.unwrap_or(0.0))
      })?;
      total.add(nll, instance.sentence.len(), instance.actions.len());
      lines.push(Rescored {
        len: instance.sentence.len(),
        nll,
      });
    }
    debug!(
      "rescoring cache: {} hits, {} misses",
      cache.hits(),
      cache.misses()
    );
    Ok((lines, total))
  }
}
