use crate::actions::{Action, ActionSet, ActionTag};
use crate::dict::{ActionId, NtId};
use crate::error::{Error, Result};
use crate::syntree::{Constituent, SynTree, Word};

pub type Tree = SynTree<String, String>;

/// One stack slot: the subtree built so far, its vector representation, and
/// whether it is a still-open nonterminal marker
#[derive(Debug, Clone)]
pub struct StackEntry<E> {
  pub tree: Tree,
  pub embedding: E,
  /// `Some(nt)` for an unclosed OPEN marker, `None` for terminals and
  /// completed constituents
  pub open: Option<NtId>,
}

/// The mutable state of one parse. Generic over the embedding type so that the
/// transition bookkeeping does not depend on the neural model.
#[derive(Debug, Clone)]
pub struct Configuration<E> {
  stack: Vec<StackEntry<E>>,
  open_count: usize,
  terminals: usize,
  prev: Option<ActionTag>,
  history: Vec<ActionId>,
}

impl<E> Configuration<E> {
  /// A configuration holding only the guard entry
  pub fn new(guard: E) -> Self {
    Self {
      stack: vec![StackEntry {
        tree: SynTree::Leaf(Word {
          value: "ROOT_GUARD".to_string(),
          span: (0, 0),
        }),
        embedding: guard,
        open: None,
      }],
      open_count: 0,
      terminals: 0,
      prev: None,
      history: Vec::new(),
    }
  }

  pub fn stack_size(&self) -> usize {
    self.stack.len()
  }

  pub fn open_count(&self) -> usize {
    self.open_count
  }

  pub fn terminals(&self) -> usize {
    self.terminals
  }

  pub fn prev(&self) -> Option<ActionTag> {
    self.prev
  }

  pub fn history(&self) -> &[ActionId] {
    &self.history
  }

  pub fn top(&self) -> Option<&StackEntry<E>> {
    self.stack.last()
  }

  /// Guard plus a single completed root, with at least one terminal generated
  pub fn is_final(&self) -> bool {
    !(self.stack.len() > 2 || self.terminals == 0)
  }

  pub fn legal_actions(&self, actions: &ActionSet) -> Vec<ActionId> {
    actions.legal(self.prev, self.stack.len(), self.open_count)
  }

  pub fn shift(&mut self, word: String, embedding: E) {
    self.stack.push(StackEntry {
      tree: SynTree::Leaf(Word {
        value: word,
        span: (self.terminals, self.terminals + 1),
      }),
      embedding,
      open: None,
    });
    self.terminals += 1;
  }

  pub fn open(&mut self, nt: NtId, label: String, embedding: E) {
    self.stack.push(StackEntry {
      tree: SynTree::Branch(
        Constituent {
          value: label,
          span: (self.terminals, self.terminals),
        },
        Vec::new(),
      ),
      embedding,
      open: Some(nt),
    });
    self.open_count += 1;
  }

  /// Closes the innermost open constituent.
  ///
  /// Every entry from the innermost open marker to the top is popped; `compose`
  /// gets the marker's nonterminal and the children's embeddings in their
  /// original order and returns the embedding of the new constituent, which
  /// becomes the new top. Returns how many entries were popped.
  pub fn reduce<F>(&mut self, compose: F) -> Result<usize>
  where
    F: FnOnce(NtId, &[E]) -> Result<E>,
  {
    let marker = self
      .stack
      .iter()
      .rposition(|e| e.open.is_some())
      .ok_or_else(|| Error::Malformed("REDUCE with no open constituent".to_string()))?;
    if marker == 0 {
      return Err(Error::Malformed("the guard entry cannot be closed".to_string()));
    }
    if marker + 1 == self.stack.len() {
      return Err(Error::Malformed("REDUCE of a constituent with no children".to_string()));
    }

    let children = self.stack.split_off(marker + 1);
    let Some(opener) = self.stack.pop() else {
      return Err(Error::Malformed("lost the open marker".to_string()));
    };
    let (Some(nt), SynTree::Branch(label, _)) = (opener.open, opener.tree) else {
      return Err(Error::Malformed("open marker is not an unfinished constituent".to_string()));
    };

    let (trees, embeddings): (Vec<_>, Vec<_>) = children
      .into_iter()
      .map(|c| (c.tree, c.embedding))
      .unzip();
    let popped = trees.len() + 1;
    let embedding = compose(nt, &embeddings)?;

    self.stack.push(StackEntry {
      tree: SynTree::Branch(
        Constituent {
          value: label.value,
          span: (label.span.0, self.terminals),
        },
        trees,
      ),
      embedding,
      open: None,
    });
    self.open_count -= 1;
    Ok(popped)
  }

  /// Records `action` as taken, after its transition has been applied
  pub fn record(&mut self, id: ActionId, action: Action) {
    self.history.push(id);
    self.prev = Some(action.tag());
  }

  /// The completed tree, once the configuration is final
  pub fn into_tree(mut self) -> Option<Tree> {
    if self.stack.len() == 2 && self.open_count == 0 {
      self.stack.pop().map(|e| e.tree)
    } else {
      None
    }
  }
}
