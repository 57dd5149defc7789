use std::str::from_utf8;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use vortex::http::Method;

const METHODS: [&[u8]; 8] = [
    b"GET", b"PUT", b"POST", b"HEAD", b"TRACE", b"DELETE", b"CONNECT", b"OPTIONS",
];

fn benchmark(c: &mut Criterion) {
    for method in METHODS {
        c.bench_with_input(
            BenchmarkId::new("method", from_utf8(method).unwrap()),
            black_box(&method),
            |b, i| b.iter(|| Method::parse(i)),
        );
    }
}

criterion_group!(benches, benchmark);
criterion_main!(benches);
