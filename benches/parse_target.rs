use criterion::{
    black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput::Bytes,
};
use vortex::http::cursor::{is_target_token, ByteCursor};

const TARGETS: [&[u8]; 4] = [
    b"/",
    b"/api/v1.0/weather/forecast/days/16",
    b"/wp-content/uploads/2010/03/hello-kitty-darth-vader-pink.jpg",
    b"/nvidia_web_services/controller.gfeclientcontent.php/com.nvidia.services.GFEClientContent.getShieldReady/{\"gcV\":\"2.2.2.0\",\"dID\":\"1341\",\"osC\":\"6.20\",\"is6\":\"1\",\"lg\":\"1033\",\"GFPV\":\"389.08\",\"isO\":\"1\",\"sM\":\"16777216\"}"
];

fn benchmark(c: &mut Criterion) {
    let mut group = c.benchmark_group("target");
    for target in TARGETS {
        group.throughput(Bytes(target.len() as u64));

        group.bench_with_input(
            BenchmarkId::new("target_token_scan", target.len()),
            black_box(&target),
            |b, i| {
                b.iter(|| {
                    let mut cursor = ByteCursor::new(i);
                    cursor.take_while(is_target_token)
                })
            },
        );
    }
    group.finish();
}

criterion_group!(benches, benchmark);
criterion_main!(benches);
