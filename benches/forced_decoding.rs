use std::path::Path;

use criterion::{Criterion, black_box, criterion_group, criterion_main};

use rnng::{ClusterMap, Corpus, ModelConfig, Parser, ParserModel, VocabularyBuilder};

const ORACLE: &str = "\
# (S (NP the dog) (VP barks))
the dog barks
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

# (S (NP mary) (VP said (SBAR that (S (NP she) (VP likes (NP herself))))))
mary said that she likes herself
mary said that she likes herself
mary said that she likes herself
NT(S)
NT(NP)
SHIFT
REDUCE
NT(VP)
SHIFT
NT(SBAR)
SHIFT
NT(S)
NT(NP)
SHIFT
REDUCE
NT(VP)
SHIFT
NT(NP)
SHIFT
REDUCE
REDUCE
REDUCE
REDUCE
REDUCE
REDUCE
";

fn criterion_benchmark(c: &mut Criterion) {
  let mut builder = VocabularyBuilder::new();
  let corpus = Corpus::parse(ORACLE, Path::new("bench.oracle"), &mut builder).unwrap();
  let vocab = builder.freeze().unwrap();
  let clusters = ClusterMap::new().cover(&vocab);
  let model = ParserModel::new(ModelConfig::default(), &vocab, &clusters).unwrap();
  let parser = Parser::new(&model, &vocab);

  let simple = corpus.get(0).unwrap();
  let nested = corpus.get(1).unwrap();

  c.bench_function("score simple", |b| {
    b.iter(|| parser.score(black_box(&simple.sentence), black_box(&simple.actions), false))
  });

  c.bench_function("score nested", |b| {
    b.iter(|| parser.score(black_box(&nested.sentence), black_box(&nested.actions), false))
  });

  c.bench_function("score nested with backward", |b| {
    b.iter(|| {
      let out = parser.score(black_box(&nested.sentence), black_box(&nested.actions), true).unwrap();
      out.loss.map(|l| l.backward())
    })
  });
}

criterion_group!(benches, criterion_benchmark);
criterion_main!(benches);
