//! Reading generative top-down oracle files.
//!
//! Each sentence is a block of lines, blocks separated by blank lines:
//!
//! ```text
//! # (S (NP The dog) (VP barks))
//! The dog barks
//! the dog barks
//! the dog barks
//! NT(S)
//! NT(NP)
//! SHIFT
//! SHIFT
//! REDUCE
//! NT(VP)
//! SHIFT
//! REDUCE
//! REDUCE
//! ```
//!
//! The second line holds the surface tokens, the third their lower-cased form
//! and the fourth the unknown-normalized form the model actually scores.

use std::fs;
use std::path::Path;

use crate::dict::{ActionId, SymbolTable, WordId};
use crate::error::{Error, Result};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Sentence {
  pub surface: Vec<String>,
  /// ids of the unknown-normalized tokens
  pub raw: Vec<WordId>,
}

impl Sentence {
  pub fn new(surface: Vec<String>, raw: Vec<WordId>) -> Self {
    Self { surface, raw }
  }

  pub fn len(&self) -> usize {
    self.raw.len()
  }

  pub fn is_empty(&self) -> bool {
    self.raw.is_empty()
  }
}

/// A sentence paired with its reference derivation
#[derive(Debug, Clone, PartialEq)]
pub struct Instance {
  pub sentence: Sentence,
  pub actions: Vec<ActionId>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Corpus {
  pub instances: Vec<Instance>,
}

impl Corpus {
  pub fn len(&self) -> usize {
    self.instances.len()
  }

  pub fn is_empty(&self) -> bool {
    self.instances.is_empty()
  }

  pub fn get(&self, idx: usize) -> Option<&Instance> {
    self.instances.get(idx)
  }

  pub fn iter(&self) -> impl Iterator<Item = &Instance> {
    self.instances.iter()
  }

  /// Total number of words over all sentences
  pub fn words(&self) -> usize {
    self.instances.iter().map(|i| i.sentence.len()).sum()
  }

  pub fn read_from_file<P, T>(path: P, table: &mut T) -> Result<Self>
  where
    P: AsRef<Path>,
    T: SymbolTable,
  {
    let path = path.as_ref();
    let text = fs::read_to_string(path)?;
    Self::parse(&text, path, table)
  }

  /// Parses oracle text; `path` is only used in error messages
  pub fn parse<T: SymbolTable>(text: &str, path: &Path, table: &mut T) -> Result<Self> {
    let err = |line: usize, msg: String| Error::Input {
      path: path.to_path_buf(),
      line,
      msg,
    };

    let mut instances = Vec::new();
    let mut lines = text.lines().enumerate().map(|(i, l)| (i + 1, l.trim_end())).peekable();

    while let Some((lineno, line)) = lines.next() {
      if line.is_empty() {
        continue;
      }
      if !line.starts_with('#') {
        return Err(err(lineno, format!("expected a '#' tree line, got {:?}", line)));
      }

      let mut token_line = |what: &str| match lines.next() {
        Some((n, l)) if !l.is_empty() => Ok((n, l)),
        Some((n, _)) => Err(err(n, format!("empty {} line", what))),
        None => Err(err(lineno, format!("missing {} line", what))),
      };
      let (_, surface) = token_line("surface token")?;
      let (_, _lowercased) = token_line("lower-cased token")?;
      let (unk_lineno, unked) = token_line("unknown-normalized token")?;

      let surface = surface.split_whitespace().map(str::to_string).collect::<Vec<_>>();
      let raw = unked
        .split_whitespace()
        .map(|w| table.term(w))
        .collect::<Result<Vec<_>>>()
        .map_err(|e| err(unk_lineno, e.to_string()))?;
      if surface.len() != raw.len() {
        return Err(err(
          unk_lineno,
          format!("{} surface tokens but {} normalized tokens", surface.len(), raw.len()),
        ));
      }

      let mut actions = Vec::new();
      while let Some(&(n, l)) = lines.peek() {
        if l.is_empty() {
          break;
        }
        lines.next();
        actions.push(table.action(l.trim()).map_err(|e| err(n, e.to_string()))?);
      }
      if actions.is_empty() {
        return Err(err(lineno, "sentence has no actions".to_string()));
      }

      instances.push(Instance {
        sentence: Sentence::new(surface, raw),
        actions,
      });
    }

    Ok(Self { instances })
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::dict::VocabularyBuilder;

  const ORACLE: &str = "\
# (S (NP The dog) (VP barks))
The dog barks
the dog barks
the dog barks
NT(S)
NT(NP)
SHIFT
SHIFT
REDUCE
NT(VP)
SHIFT
REDUCE
REDUCE

# (S (NP Cats) (VP sleep))
Cats sleep
cats sleep
UNK-s sleep
NT(S)
NT(NP)
SHIFT
REDUCE
NT(VP)
SHIFT
REDUCE
REDUCE
";

  #[test]
  fn test_parse_training_oracle() {
    let mut builder = VocabularyBuilder::new();
    let corpus = Corpus::parse(ORACLE, Path::new("train.oracle"), &mut builder).unwrap();
    assert_eq!(corpus.len(), 2);
    assert_eq!(corpus.words(), 5);

    let first = corpus.get(0).unwrap();
    assert_eq!(first.sentence.surface, vec!["The", "dog", "barks"]);
    assert_eq!(first.actions.len(), 9);

    let vocab = builder.freeze().unwrap();
    assert_eq!(vocab.nonterminals().len(), 3);
    assert_eq!(vocab.term(corpus.get(1).unwrap().sentence.raw[0]).unwrap(), "UNK-s");
  }

  #[test]
  fn test_frozen_lookup_errors_carry_line() {
    let mut builder = VocabularyBuilder::new();
    Corpus::parse(ORACLE, Path::new("train.oracle"), &mut builder).unwrap();
    let vocab = builder.freeze().unwrap();

    let dev = "# (X (Y a))\nA\na\nzebra\nNT(X)\nNT(Y)\nSHIFT\nREDUCE\nREDUCE\n";
    match Corpus::parse(dev, Path::new("dev.oracle"), &mut &vocab) {
      Err(Error::Input { line, .. }) => assert_eq!(line, 5),
      other => panic!("expected oracle error, got {:?}", other),
    }

    // unseen words become UNK against frozen vocabularies
    let dev = "# (S (NP a))\nA\na\nzebra\nNT(S)\nNT(NP)\nSHIFT\nREDUCE\nREDUCE\n";
    let corpus = Corpus::parse(dev, Path::new("dev.oracle"), &mut &vocab).unwrap();
    assert_eq!(vocab.term(corpus.get(0).unwrap().sentence.raw[0]).unwrap(), "UNK");
  }

  #[test]
  fn test_malformed_blocks() {
    let mut builder = VocabularyBuilder::new();
    assert!(Corpus::parse("NT(S)\n", Path::new("x"), &mut builder).is_err());
    assert!(Corpus::parse("# (S a)\na b\na b\na\nSHIFT\n", Path::new("x"), &mut builder).is_err());
    assert!(Corpus::parse("# (S a)\na\na\n", Path::new("x"), &mut builder).is_err());
  }
}
