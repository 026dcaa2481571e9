use criterion::{Criterion, criterion_group, criterion_main};
use ragline::embeddings::{ChunkingConfig, Document, chunk_document};
use std::hint::black_box;

fn sample_document(words: usize) -> Document {
    let vocabulary = [
        "ownership", "borrowing", "lifetimes", "traits", "generics", "async", "runtime",
        "channel", "mutex", "iterator", "closure", "pattern",
    ];
    let content = (0..words)
        .map(|i| vocabulary[i % vocabulary.len()])
        .collect::<Vec<_>>()
        .join(" ");
    Document::new("bench", content)
}

pub fn criterion_benchmark(c: &mut Criterion) {
    let document = sample_document(20_000);
    let config = ChunkingConfig::default();
    c.bench_function("chunking", |b| {
        b.iter(|| chunk_document(black_box(&document), black_box(&config)))
    });

    let small_windows = ChunkingConfig {
        max_chunk_size: 64,
        overlap: 16,
    };
    c.bench_function("chunking_small_windows", |b| {
        b.iter(|| chunk_document(black_box(&document), black_box(&small_windows)))
    });
}

criterion_group!(benches, criterion_benchmark);
criterion_main!(benches);
