use std::fmt;

#[derive(Debug, PartialEq, Clone)]
pub struct Constituent<T> {
  pub value: T,
  pub span: (usize, usize),
}

#[derive(Debug, PartialEq, Clone)]
pub struct Word<U> {
  pub value: U,
  pub span: (usize, usize),
}

/// A phrase structure tree. Displays in bracketed form: `(S (NP the dog) (VP barks))`
#[derive(Debug, PartialEq, Clone)]
pub enum SynTree<T, U> {
  Branch(Constituent<T>, Vec<SynTree<T, U>>),
  Leaf(Word<U>),
}

impl<T, U> SynTree<T, U> {
  pub fn span(&self) -> (usize, usize) {
    match self {
      Self::Branch(c, _) => c.span,
      Self::Leaf(w) => w.span,
    }
  }

  /// The leaves, left to right
  pub fn words(&self) -> Vec<&U> {
    let mut out = Vec::new();
    self.collect_words(&mut out);
    out
  }

  fn collect_words<'a>(&'a self, out: &mut Vec<&'a U>) {
    match self {
      Self::Leaf(w) => out.push(&w.value),
      Self::Branch(_, children) => {
        for child in children {
          child.collect_words(out);
        }
      }
    }
  }
}

impl<T, U> fmt::Display for SynTree<T, U>
where
  T: fmt::Display,
  U: fmt::Display,
{
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Self::Leaf(w) => write!(f, "{}", w.value),
      Self::Branch(c, children) => {
        write!(f, "({}", c.value)?;
        for child in children {
          write!(f, " {}", child)?;
        }
        write!(f, ")")
      }
    }
  }
}

#[test]
fn test_bracketed_display() {
  let leaf = |w: &str, i: usize| {
    SynTree::Leaf(Word {
      value: w.to_string(),
      span: (i, i + 1),
    })
  };
  let np = SynTree::Branch(
    Constituent {
      value: "NP".to_string(),
      span: (0, 2),
    },
    vec![leaf("the", 0), leaf("dog", 1)],
  );
  let s = SynTree::Branch(
    Constituent {
      value: "S".to_string(),
      span: (0, 3),
    },
    vec![
      np,
      SynTree::Branch(
        Constituent {
          value: "VP".to_string(),
          span: (2, 3),
        },
        vec![leaf("barks", 2)],
      ),
    ],
  );

  assert_eq!(s.to_string(), "(S (NP the dog) (VP barks))");
  assert_eq!(s.words(), vec!["the", "dog", "barks"]);
  assert_eq!(s.span(), (0, 3));
}
