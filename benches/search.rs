use chrono::Utc;
use criterion::{Criterion, criterion_group, criterion_main};
use ragline::database::VectorIndex;
use ragline::embeddings::EmbeddingRecord;
use std::hint::black_box;

const DIMENSION: usize = 384;

/// Cheap deterministic pseudo-random vector
fn vector(seed: u64) -> Vec<f32> {
    let mut state = seed.wrapping_mul(6_364_136_223_846_793_005).wrapping_add(1);
    (0..DIMENSION)
        .map(|_| {
            state = state
                .wrapping_mul(6_364_136_223_846_793_005)
                .wrapping_add(1_442_695_040_888_963_407);
            ((state >> 33) as f32 / (1_u64 << 31) as f32) - 0.5
        })
        .collect()
}

fn records(document: u64, chunks: u64) -> Vec<EmbeddingRecord> {
    (0..chunks)
        .map(|chunk| EmbeddingRecord {
            document_id: format!("doc-{}", document),
            chunk_id: format!("doc-{}_chunk_{}", document, chunk),
            vector: vector(document * 1000 + chunk),
            text: format!("chunk {} of document {}", chunk, document),
            hash: String::new(),
            model_name: "bench".to_string(),
            created_at: Utc::now(),
        })
        .collect()
}

pub fn criterion_benchmark(c: &mut Criterion) {
    let runtime = tokio::runtime::Runtime::new().expect("can create runtime");
    let index = VectorIndex::new(DIMENSION);
    runtime.block_on(async {
        for document in 0..500 {
            index
                .add(&format!("doc-{}", document), &records(document, 10))
                .await
                .expect("can add records");
        }
    });
    let query = vector(u64::MAX);

    c.bench_function("search_top10", |b| {
        b.iter(|| {
            runtime
                .block_on(index.search(black_box(&query), 10, -1.0))
                .expect("search succeeds")
        })
    });

    c.bench_function("search_thresholded", |b| {
        b.iter(|| {
            runtime
                .block_on(index.search(black_box(&query), 10, 0.2))
                .expect("search succeeds")
        })
    });
}

criterion_group!(benches, criterion_benchmark);
criterion_main!(benches);
