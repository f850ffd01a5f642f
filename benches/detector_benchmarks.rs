use criterion::{black_box, criterion_group, criterion_main, Criterion};
use finance_fabric::detector::shannon_entropy;

fn benchmark_entropy_on_text(c: &mut Criterion) {
    let data = b"the quick brown fox jumps over the lazy dog ".repeat(200);
    c.bench_function("shannon_entropy_text_4k", |b| {
        b.iter(|| shannon_entropy(black_box(&data)))
    });
}

fn benchmark_entropy_on_random(c: &mut Criterion) {
    let mut data = vec![0u8; 9200];
    let mut seed: u32 = 0xdead_beef;
    for byte in data.iter_mut() {
        seed = seed.wrapping_mul(1664525).wrapping_add(1013904223);
        *byte = (seed >> 24) as u8;
    }
    c.bench_function("shannon_entropy_random_9k", |b| {
        b.iter(|| shannon_entropy(black_box(&data)))
    });
}

criterion_group!(benches, benchmark_entropy_on_text, benchmark_entropy_on_random);
criterion_main!(benches);
