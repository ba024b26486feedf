use std::path::PathBuf;
use std::process;
use std::sync::atomic::Ordering;
use std::thread;

use anyhow::{Context as _, bail};
use clap::Parser;
use rand::SeedableRng;
use rand::rngs::StdRng;
use rnng::utils::perplexity;
use rnng::{
  CharModelKind, ClusterMap, Corpus, ModelConfig, ParserModel, RescoreCache, StopFlag, TrainConfig,
  Trainer, VocabularyBuilder,
};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Train and evaluate a generative top-down constituency parser
#[derive(Debug, Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
  /// Training oracle, also used to build the vocabularies
  #[arg(short = 'T', long)]
  training_data: PathBuf,
  /// Word clusters for the class-factored word softmax
  #[arg(short = 'C', long)]
  clusters: PathBuf,
  /// Development oracle, required with --train
  #[arg(short = 'd', long)]
  dev_data: Option<PathBuf>,
  /// Test oracle to rescore
  #[arg(short = 'p', long)]
  test_data: Option<PathBuf>,
  /// Load parameters from this checkpoint
  #[arg(short = 'm', long)]
  model: Option<PathBuf>,
  /// Train the model
  #[arg(short = 't', long)]
  train: bool,
  /// Directory checkpoints are written to
  #[arg(long, default_value = ".")]
  model_dir: PathBuf,
  #[arg(short = 'D', long, default_value_t = 0.0)]
  dropout: f32,
  #[arg(long, default_value_t = 2)]
  layers: usize,
  #[arg(long, default_value_t = 16)]
  action_dim: usize,
  #[arg(long, default_value_t = 32)]
  input_dim: usize,
  #[arg(long, default_value_t = 64)]
  hidden_dim: usize,
  /// Word composition from characters
  #[arg(long, default_value = "addition")]
  char_embeddings_model: String,
  #[arg(long, default_value_t = 0)]
  start_epoch: usize,
  /// Sentences per status line
  #[arg(long, default_value_t = 100)]
  status_every: usize,
  /// Dev evaluation every this many status blocks
  #[arg(long, default_value_t = 25)]
  report_every: usize,
  /// Sample a tree every this many status blocks
  #[arg(long, default_value_t = 100)]
  generate_every: usize,
  /// Abandon a sampled tree after this many actions
  #[arg(long, default_value_t = 1000)]
  max_generate_actions: usize,
  /// Dev evaluations without improvement before stopping
  #[arg(long, default_value_t = 10)]
  patience: usize,
  #[arg(long, default_value_t = 0.1)]
  eta0: f64,
  #[arg(long, default_value_t = 0.08)]
  eta_decay: f64,
  /// Stop after this many epochs even if dev perplexity still improves
  #[arg(long)]
  max_epochs: Option<usize>,
  /// Seed for shuffling and generation
  #[arg(long)]
  seed: Option<u64>,
}

impl Args {
  fn model_config(&self) -> anyhow::Result<ModelConfig> {
    let config = ModelConfig {
      layers: self.layers,
      input_dim: self.input_dim,
      hidden_dim: self.hidden_dim,
      action_dim: self.action_dim,
      dropout: self.dropout,
      char_model: self.char_embeddings_model.parse::<CharModelKind>()?,
    };
    config.validate()?;
    Ok(config)
  }

  fn train_config(&self) -> TrainConfig {
    TrainConfig {
      status_every: self.status_every,
      report_every: self.report_every,
      generate_every: self.generate_every,
      max_generate_actions: self.max_generate_actions,
      patience: self.patience,
      eta0: self.eta0,
      eta_decay: self.eta_decay,
      start_epoch: self.start_epoch,
      max_epochs: self.max_epochs,
      model_dir: self.model_dir.clone(),
      ..Default::default()
    }
  }
}

/// First interrupt asks training to stop after the sentence in flight, the
/// second exits immediately.
fn install_interrupt_handler(stop: StopFlag) -> anyhow::Result<()> {
  let runtime = tokio::runtime::Builder::new_current_thread()
    .enable_all()
    .build()
    .context("failed to start the signal listener")?;
  thread::spawn(move || {
    runtime.block_on(async {
      while tokio::signal::ctrl_c().await.is_ok() {
        if stop.swap(true, Ordering::SeqCst) {
          warn!("second interrupt, exiting");
          process::exit(1);
        }
        warn!("interrupt received, stopping after the current sentence (interrupt again to exit)");
      }
    })
  });
  Ok(())
}

fn main() -> anyhow::Result<()> {
  let args = Args::parse();

  tracing_subscriber::fmt()
    .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
    .with_writer(std::io::stderr)
    .init();

  tracing::trace!("CLI args = {:?}", args);

  if args.train && args.dev_data.is_none() {
    bail!("--train requires --dev-data");
  }
  let model_config = args.model_config()?;
  let train_config = args.train_config();

  let mut builder = VocabularyBuilder::new();
  let clusters = ClusterMap::read_from_file(&args.clusters, &mut builder)
    .with_context(|| format!("reading clusters from {}", args.clusters.display()))?;
  let train = Corpus::read_from_file(&args.training_data, &mut builder)
    .with_context(|| format!("reading training data from {}", args.training_data.display()))?;
  let vocab = builder.freeze()?;
  let clusters = clusters.cover(&vocab);
  info!(
    "{} training sentences, {} words; {}",
    train.len(),
    train.words(),
    vocab
  );

  let dev = match &args.dev_data {
    Some(path) => Corpus::read_from_file(path, &mut &vocab)
      .with_context(|| format!("reading dev data from {}", path.display()))?,
    None => Corpus::default(),
  };
  let test = match &args.test_data {
    Some(path) => Some(
      Corpus::read_from_file(path, &mut &vocab)
        .with_context(|| format!("reading test data from {}", path.display()))?,
    ),
    None => None,
  };

  let mut model = ParserModel::new(model_config, &vocab, &clusters)?;
  if let Some(path) = &args.model {
    model
      .load(path)
      .with_context(|| format!("loading model from {}", path.display()))?;
    info!("loaded parameters from {}", path.display());
  }

  let stop = StopFlag::default();
  let mut rng = match args.seed {
    Some(seed) => StdRng::seed_from_u64(seed),
    None => StdRng::from_entropy(),
  };

  if args.train {
    install_interrupt_handler(stop.clone())?;
    let summary = Trainer::new(&model, &vocab, train_config.clone(), stop.clone()).train(&train, &dev, &mut rng)?;
    info!(
      "best dev nll {:.3} after {} updates and {} evaluations",
      summary.best_dev_nll, summary.updates, summary.evaluations
    );
    if let Some(best) = &summary.checkpoint {
      model.load(best)?;
      info!("restored best parameters from {}", best.display());
    }
  }

  if let Some(test) = test {
    let trainer = Trainer::new(&model, &vocab, train_config, stop);
    let mut cache = RescoreCache::new();
    let (lines, total) = trainer.rescore(&test, &mut cache)?;
    for line in &lines {
      println!("{}\t{}", line.len, line.nll);
    }
    info!(
      "test nll {:.3} over {} words, ppl {:.3} ({} distinct derivations scored)",
      total.nll,
      total.words,
      perplexity(total.nll, total.words),
      cache.len()
    );
  }

  Ok(())
}
