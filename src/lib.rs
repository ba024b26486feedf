#[macro_use]
extern crate lazy_static;

pub mod actions;
pub mod composer;
pub mod configuration;
pub mod dict;
pub mod encoder;
pub mod error;
pub mod model;
pub mod oracle;
pub mod parser;
pub mod scorer;
pub mod syntree;
pub mod train;
pub mod utils;
pub mod words;

pub use crate::dict::{Vocabularies, VocabularyBuilder};
pub use crate::error::{Error, Result};
pub use crate::model::{ModelConfig, ParserModel};
pub use crate::oracle::{Corpus, Instance, Sentence};
pub use crate::parser::{ParseOutcome, Parser};
pub use crate::train::{RescoreCache, StopFlag, TrainConfig, Trainer};
pub use crate::words::{CharModelKind, ClusterMap};
