use std::collections::HashMap;
use std::fmt;

use crate::actions::{ActionName, ActionSet};
use crate::error::{Error, Result};

pub type WordId = usize;
pub type NtId = usize;
pub type ActionId = usize;
pub type CharId = usize;

/// Start-of-sentence token, always term id 0
pub const SOS: &str = "<s>";
pub const UNK: &str = "UNK";

/// Bidirectional string <-> id table.
///
/// Until `freeze` is called, `convert` interns unseen strings. Afterwards unseen
/// strings map to the unknown entry if one was set, and are an error otherwise.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct Dict {
  ids: HashMap<String, usize>,
  words: Vec<String>,
  frozen: bool,
  unk: Option<usize>,
}

impl Dict {
  pub fn new() -> Self {
    Default::default()
  }

  pub fn len(&self) -> usize {
    self.words.len()
  }

  pub fn is_empty(&self) -> bool {
    self.words.is_empty()
  }

  pub fn is_frozen(&self) -> bool {
    self.frozen
  }

  /// Look up `s` without interning, falling back to the unknown entry
  pub fn get(&self, s: &str) -> Option<usize> {
    self.ids.get(s).copied().or(self.unk)
  }

  pub fn convert(&mut self, s: &str) -> Result<usize> {
    if let Some(&id) = self.ids.get(s) {
      return Ok(id);
    }
    if self.frozen {
      return self
        .unk
        .ok_or_else(|| Error::Vocab(format!("unknown entry {:?} in frozen dictionary", s)));
    }
    let id = self.words.len();
    self.words.push(s.to_string());
    self.ids.insert(s.to_string(), id);
    Ok(id)
  }

  pub fn word(&self, id: usize) -> Result<&str> {
    self
      .words
      .get(id)
      .map(String::as_str)
      .ok_or_else(|| Error::Vocab(format!("id {} out of range for {} entries", id, self.words.len())))
  }

  pub fn freeze(&mut self) {
    self.frozen = true;
  }

  /// Designate the unknown entry, interning it even if the dictionary is frozen
  pub fn set_unk(&mut self, s: &str) -> Result<usize> {
    if self.unk.is_some() {
      return Err(Error::Vocab(format!("unknown entry already set, cannot set {:?}", s)));
    }
    let frozen = self.frozen;
    self.frozen = false;
    let id = self.convert(s)?;
    self.frozen = frozen;
    self.unk = Some(id);
    Ok(id)
  }

  pub fn unk(&self) -> Option<usize> {
    self.unk
  }

  pub fn iter(&self) -> impl Iterator<Item = (usize, &str)> {
    self.words.iter().enumerate().map(|(id, w)| (id, w.as_str()))
  }
}

/// Anything oracle reading can resolve symbols against: a builder that still
/// grows, or the frozen vocabularies.
pub trait SymbolTable {
  fn term(&mut self, word: &str) -> Result<WordId>;
  fn action(&mut self, action: &str) -> Result<ActionId>;
}

/// Mutable build phase of the vocabularies. Consumed by `freeze`.
#[derive(Debug)]
pub struct VocabularyBuilder {
  terms: Dict,
  nonterminals: Dict,
  actions: Dict,
}

impl Default for VocabularyBuilder {
  fn default() -> Self {
    Self::new()
  }
}

impl VocabularyBuilder {
  pub fn new() -> Self {
    let mut terms = Dict::new();
    terms.words.push(SOS.to_string());
    terms.ids.insert(SOS.to_string(), 0);
    Self {
      terms,
      nonterminals: Dict::new(),
      actions: Dict::new(),
    }
  }

  /// Freeze every table, derive the character table from the term table, and
  /// decode the action set.
  pub fn freeze(mut self) -> Result<Vocabularies> {
    self.terms.freeze();
    self.terms.set_unk(UNK)?;
    self.nonterminals.freeze();
    self.actions.freeze();

    let mut chars = Dict::new();
    for (id, word) in self.terms.iter() {
      if id == 0 {
        continue;
      }
      for c in word.chars() {
        chars.convert(c.encode_utf8(&mut [0; 4]))?;
      }
    }
    chars.freeze();
    chars.set_unk(UNK)?;

    let action_set = ActionSet::decode(&self.actions, &self.nonterminals)?;
    if action_set.is_empty() {
      return Err(Error::Vocab("no actions were seen while building".to_string()));
    }

    Ok(Vocabularies {
      terms: self.terms,
      nonterminals: self.nonterminals,
      actions: self.actions,
      chars,
      action_set,
    })
  }
}

impl SymbolTable for VocabularyBuilder {
  fn term(&mut self, word: &str) -> Result<WordId> {
    self.terms.convert(word)
  }

  fn action(&mut self, action: &str) -> Result<ActionId> {
    match ActionName::parse(action) {
      Some(ActionName::Open(label)) => {
        self.nonterminals.convert(label)?;
      }
      Some(_) => {}
      None => return Err(Error::Vocab(format!("malformed action {:?}", action))),
    }
    self.actions.convert(action)
  }
}

/// Frozen, process-wide vocabularies. There is no way to add entries to it.
#[derive(Debug)]
pub struct Vocabularies {
  terms: Dict,
  nonterminals: Dict,
  actions: Dict,
  chars: Dict,
  action_set: ActionSet,
}

impl Vocabularies {
  pub fn terms(&self) -> &Dict {
    &self.terms
  }

  pub fn nonterminals(&self) -> &Dict {
    &self.nonterminals
  }

  pub fn chars(&self) -> &Dict {
    &self.chars
  }

  pub fn actions(&self) -> &ActionSet {
    &self.action_set
  }

  pub fn term(&self, id: WordId) -> Result<&str> {
    self.terms.word(id)
  }

  pub fn nonterminal(&self, id: NtId) -> Result<&str> {
    self.nonterminals.word(id)
  }

  pub fn action_name(&self, id: ActionId) -> Result<&str> {
    self.actions.word(id)
  }

  pub fn term_id(&self, word: &str) -> Result<WordId> {
    self
      .terms
      .get(word)
      .ok_or_else(|| Error::Vocab(format!("unknown word {:?}", word)))
  }

  /// Character ids of a term, unknown characters mapped to `UNK`
  pub fn chars_of(&self, id: WordId) -> Result<Vec<CharId>> {
    let unk = self.chars.unk().unwrap_or(0);
    Ok(
      self
        .term(id)?
        .chars()
        .map(|c| self.chars.get(c.encode_utf8(&mut [0; 4])).unwrap_or(unk))
        .collect(),
    )
  }
}

impl SymbolTable for &Vocabularies {
  fn term(&mut self, word: &str) -> Result<WordId> {
    self.term_id(word)
  }

  fn action(&mut self, action: &str) -> Result<ActionId> {
    self
      .actions
      .ids
      .get(action)
      .copied()
      .ok_or_else(|| Error::Vocab(format!("action {:?} not seen in training", action)))
  }
}

impl fmt::Display for Vocabularies {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(
      f,
      "{} terms, {} nonterminals, {} actions, {} characters",
      self.terms.len(),
      self.nonterminals.len(),
      self.actions.len(),
      self.chars.len()
    )
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_dict_freeze_and_unk() {
    let mut d = Dict::new();
    assert_eq!(d.convert("a").unwrap(), 0);
    assert_eq!(d.convert("b").unwrap(), 1);
    assert_eq!(d.convert("a").unwrap(), 0);

    d.freeze();
    assert!(d.convert("c").is_err());
    assert_eq!(d.get("c"), None);

    let unk = d.set_unk("UNK").unwrap();
    assert_eq!(unk, 2);
    assert!(d.is_frozen());
    assert_eq!(d.convert("c").unwrap(), unk);
    assert_eq!(d.len(), 3);
    assert!(d.set_unk("other").is_err());
    assert_eq!(d.word(1).unwrap(), "b");
    assert!(matches!(d.word(3), Err(Error::Vocab(_))));
  }

  #[test]
  fn test_builder_registers_nonterminals() {
    let mut b = VocabularyBuilder::new();
    b.term("dog").unwrap();
    b.action("NT(NP)").unwrap();
    b.action("SHIFT").unwrap();
    b.action("REDUCE").unwrap();
    assert!(b.action("JUMP").is_err());

    let v = b.freeze().unwrap();
    assert_eq!(v.term(0).unwrap(), SOS);
    assert_eq!(v.nonterminals().len(), 1);
    assert_eq!(v.nonterminal(0).unwrap(), "NP");
    assert!(matches!(v.nonterminal(1), Err(Error::Vocab(_))));
    assert_eq!(v.actions().len(), 3);
    assert_eq!(v.term_id("cat").unwrap(), v.terms().unk().unwrap());
    assert_eq!(v.chars_of(v.term_id("dog").unwrap()).unwrap().len(), 3);
    assert!(v.chars_of(v.terms().len()).is_err());

    let mut frozen = &v;
    assert_eq!(frozen.action("SHIFT").unwrap(), 1);
    assert!(frozen.action("NT(VP)").is_err());
  }
}
