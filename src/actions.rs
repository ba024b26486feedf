use std::fmt;

use regex::Regex;

use crate::dict::{ActionId, Dict, NtId};
use crate::error::{Error, Result};

/// More open constituents than this and no further OPEN is allowed
pub const MAX_OPEN_NTS: usize = 100;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum Action {
  Shift,
  Reduce,
  /// Open a constituent labeled with the given nonterminal
  Open(NtId),
}

/// The part of an action the legality predicate cares about
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum ActionTag {
  Shift,
  Reduce,
  Open,
}

impl Action {
  pub fn tag(&self) -> ActionTag {
    match self {
      Self::Shift => ActionTag::Shift,
      Self::Reduce => ActionTag::Reduce,
      Self::Open(_) => ActionTag::Open,
    }
  }

  pub fn is_open(&self) -> bool {
    matches!(self, Self::Open(_))
  }
}

/// An action string split into its parts, before nonterminals have ids
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ActionName<'a> {
  Shift,
  Reduce,
  Open(&'a str),
}

impl<'a> ActionName<'a> {
  /// Recognizes `SHIFT`, `REDUCE` and `NT(label)`
  pub fn parse(s: &'a str) -> Option<Self> {
    lazy_static! {
      static ref OPEN: Regex = Regex::new(r"^NT\((.+)\)$").unwrap();
    }

    match s {
      "SHIFT" => Some(Self::Shift),
      "REDUCE" => Some(Self::Reduce),
      _ => OPEN
        .captures(s)
        .and_then(|caps| caps.get(1))
        .map(|m| Self::Open(m.as_str())),
    }
  }
}

/// Decides whether `action` may be taken next.
///
/// `prev` is the tag of the last action taken, `stack_size` counts the guard
/// entry, and `open_count` is the number of unclosed constituents.
pub fn is_legal(action: Action, prev: Option<ActionTag>, stack_size: usize, open_count: usize) -> bool {
  if action.is_open() && open_count > MAX_OPEN_NTS {
    return false;
  }
  if stack_size == 1 {
    return action.is_open();
  }
  // a freshly opened constituent needs at least one child
  !(action == Action::Reduce && prev == Some(ActionTag::Open))
}

/// The decoded action vocabulary. Built once when the vocabularies freeze and
/// only ever borrowed afterwards.
#[derive(Debug, Clone, PartialEq)]
pub struct ActionSet(Vec<Action>);

impl ActionSet {
  pub fn new(actions: Vec<Action>) -> Self {
    Self(actions)
  }

  pub fn decode(actions: &Dict, nonterminals: &Dict) -> Result<Self> {
    actions
      .iter()
      .map(|(_, name)| match ActionName::parse(name) {
        Some(ActionName::Shift) => Ok(Action::Shift),
        Some(ActionName::Reduce) => Ok(Action::Reduce),
        Some(ActionName::Open(label)) => nonterminals
          .get(label)
          .map(Action::Open)
          .ok_or_else(|| Error::Vocab(format!("unknown nonterminal {}", label))),
        None => Err(Error::Vocab(format!("malformed action {:?}", name))),
      })
      .collect::<Result<Vec<_>>>()
      .map(Self)
  }

  pub fn len(&self) -> usize {
    self.0.len()
  }

  pub fn is_empty(&self) -> bool {
    self.0.is_empty()
  }

  pub fn get(&self, id: ActionId) -> Option<Action> {
    self.0.get(id).copied()
  }

  pub fn iter(&self) -> impl Iterator<Item = (ActionId, Action)> + '_ {
    self.0.iter().copied().enumerate()
  }

  /// Ids of the actions allowed in the described configuration, in id order
  pub fn legal(&self, prev: Option<ActionTag>, stack_size: usize, open_count: usize) -> Vec<ActionId> {
    self
      .iter()
      .filter(|&(_, a)| is_legal(a, prev, stack_size, open_count))
      .map(|(id, _)| id)
      .collect()
  }

  /// Id of a given action, if it is part of the vocabulary
  pub fn id_of(&self, action: Action) -> Option<ActionId> {
    self.0.iter().position(|&a| a == action)
  }
}

impl fmt::Display for Action {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Self::Shift => write!(f, "SHIFT"),
      Self::Reduce => write!(f, "REDUCE"),
      Self::Open(nt) => write!(f, "NT({})", nt),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn toy_set() -> ActionSet {
    ActionSet::new(vec![Action::Open(0), Action::Open(1), Action::Shift, Action::Reduce])
  }

  #[test]
  fn test_parse_action_names() {
    assert_eq!(ActionName::parse("SHIFT"), Some(ActionName::Shift));
    assert_eq!(ActionName::parse("REDUCE"), Some(ActionName::Reduce));
    assert_eq!(ActionName::parse("NT(NP)"), Some(ActionName::Open("NP")));
    assert_eq!(ActionName::parse("NT(-NONE-)"), Some(ActionName::Open("-NONE-")));
    assert_eq!(ActionName::parse("NT()"), None);
    assert_eq!(ActionName::parse("shift"), None);
  }

  #[test]
  fn test_only_open_on_guard() {
    let set = toy_set();
    assert_eq!(set.legal(None, 1, 0), vec![0, 1]);
    assert_eq!(set.legal(Some(ActionTag::Reduce), 1, 0), vec![0, 1]);
  }

  #[test]
  fn test_no_reduce_after_open() {
    for stack_size in 2..6 {
      assert!(!is_legal(Action::Reduce, Some(ActionTag::Open), stack_size, 1));
      assert!(is_legal(Action::Reduce, Some(ActionTag::Shift), stack_size, 1));
      assert!(is_legal(Action::Shift, Some(ActionTag::Open), stack_size, 1));
    }
    assert_eq!(toy_set().legal(Some(ActionTag::Open), 2, 1), vec![0, 1, 2]);
  }

  #[test]
  fn test_open_ceiling() {
    assert!(is_legal(Action::Open(0), Some(ActionTag::Open), 101, MAX_OPEN_NTS));
    assert!(!is_legal(Action::Open(0), Some(ActionTag::Open), 102, MAX_OPEN_NTS + 1));
    // past the ceiling nothing opens, so only shift survives right after an open
    assert_eq!(toy_set().legal(Some(ActionTag::Open), 102, MAX_OPEN_NTS + 1), vec![2]);
    assert!(toy_set().legal(None, 1, MAX_OPEN_NTS + 1).is_empty());
  }

  #[test]
  fn test_decode() {
    let mut actions = Dict::new();
    let mut nts = Dict::new();
    nts.convert("NP").unwrap();
    actions.convert("NT(NP)").unwrap();
    actions.convert("SHIFT").unwrap();
    actions.convert("REDUCE").unwrap();
    let set = ActionSet::decode(&actions, &nts).unwrap();
    assert_eq!(set, ActionSet::new(vec![Action::Open(0), Action::Shift, Action::Reduce]));
    assert_eq!(set.id_of(Action::Reduce), Some(2));

    actions.convert("NT(VP)").unwrap();
    assert!(ActionSet::decode(&actions, &nts).is_err());
  }
}
