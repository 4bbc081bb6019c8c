//! Benchmarks for the persistent vector index: cold start from the index
//! file versus a rebuild from the graph, and query latency.

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use rand::{Rng, SeedableRng};

use mnemos::concept::NewConcept;
use mnemos::config::EngineConfig;
use mnemos::engine::Engine;
use mnemos::vector::VectorIndex;

const DIM: usize = 128;
const COUNT: usize = 5_000;

fn random_vector(rng: &mut impl Rng) -> Vec<f32> {
    (0..DIM).map(|_| rng.gen_range(-1.0f32..1.0)).collect()
}

/// An engine holding `COUNT` random embeddings, flushed to disk.
fn populated(dir: &tempfile::TempDir) -> Engine {
    let mut config = EngineConfig::with_storage_path(dir.path());
    config.vector_dimension = DIM;
    let engine = Engine::open(config).unwrap();
    let mut rng = rand::rngs::StdRng::seed_from_u64(0);
    for i in 0..COUNT {
        engine
            .learn(NewConcept::from_content(format!("doc {i}"), random_vector(&mut rng)), vec![])
            .unwrap();
    }
    engine.flush().unwrap();
    engine
}

fn bench_cold_start(c: &mut Criterion) {
    let dir = tempfile::TempDir::new().unwrap();
    let engine = populated(&dir);
    let config = engine.config().index.clone();

    let mut group = c.benchmark_group("index_cold_start_5k");
    group.sample_size(10);
    group.bench_function("load", |b| {
        b.iter(|| {
            black_box(
                VectorIndex::load_or_build(&engine.paths().vectors, DIM, config.clone(), engine.graph())
                    .unwrap(),
            )
        })
    });
    group.bench_function("rebuild", |b| {
        let index = VectorIndex::new(DIM, config.clone());
        b.iter(|| index.rebuild_from(black_box(engine.graph())))
    });
    group.finish();
}

fn bench_search(c: &mut Criterion) {
    let dir = tempfile::TempDir::new().unwrap();
    let engine = populated(&dir);
    let mut rng = rand::rngs::StdRng::seed_from_u64(1);
    let queries: Vec<_> = (0..64).map(|_| random_vector(&mut rng)).collect();

    c.bench_function("search_k10_5k", |b| {
        let mut i = 0;
        b.iter(|| {
            i = (i + 1) % queries.len();
            black_box(engine.search(&queries[i], 10).unwrap())
        })
    });
    c.bench_function("search_exact_k10_5k", |b| {
        let mut i = 0;
        b.iter(|| {
            i = (i + 1) % queries.len();
            black_box(engine.vectors().search_exact(&queries[i], 10).unwrap())
        })
    });
}

criterion_group!(benches, bench_cold_start, bench_search);
criterion_main!(benches);
