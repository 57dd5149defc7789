use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use vortex::http::{ParserLimits, RequestParser};

const REQ_FEW: &[u8] = b"\
GET / HTTP/1.1\r\n\
Host: www.example.org\r\n\r\n";

const REQ_MED: &[u8] = b"\
GET / HTTP/1.1\r\n\
Accept:*/*\r\n\
Accept-Encoding:gzip,deflate,br\r\n\
Accept-Language:en-US,en;q=0.5\r\n\
Cache-Control:no-cache\r\n\
Connection:keep-alive\r\n\
DNT:1\r\n\
Host: www.example.org\r\n\
Pragma:no-cache\r\n\
Referrer:https://www.example.org\r\n\
Sec-Fetch-Dest:empty\r\n\
Sec-Fetch-Mode:cors\r\n\
Sec-Fetch-Site:same-origin\r\n\
User-Agent:Mozilla/5.0 (X11; Linux x86_64; rv:109.0) Gecko/20100101 Firefox/109.0\r\n\r\n";

const REQ_MANY: &[u8] = b"\
GET / HTTP/1.1\r\n\
Host: play.google.com\r\n\
User-Agent: Mozilla/5.0 (X11; Linux x86_64; rv:109.0) Gecko/20100101 Firefox/109.0\r\n\
Accept: */*\r\n\
Accept-Language: en-US,en;q=0.5\r\n\
Accept-Encoding: gzip, deflate, br\r\n\
Referer: https://www.google.com/\r\n\
Content-Type: application/x-www-form-urlencoded;charset=utf-8\r\n\
Origin: https://www.google.com\r\n\
DNT: 1\r\n\
Connection: keep-alive\r\n\
Sec-Fetch-Dest: empty\r\n\
Sec-Fetch-Mode: cors\r\n\
Sec-Fetch-Site: same-site\r\n\
Pragma: no-cache\r\n\
Cache-Control: no-cache\r\n\r\n";

fn limits() -> ParserLimits {
    ParserLimits {
        max_header_line_size: 8 * 1024,
        max_headers: 100,
        max_message_size: usize::MAX,
    }
}

fn benchmark(c: &mut Criterion) {
    let inputs = [REQ_FEW, REQ_MED, REQ_MANY];

    let mut group = c.benchmark_group("headers");
    for &input in inputs.iter() {
        group.throughput(Throughput::Bytes(input.len() as u64));
        group.bench_with_input(
            BenchmarkId::new("header_section", input.len() as u64),
            input,
            |b, i| {
                b.iter(|| {
                    let mut parser = RequestParser::new(limits());
                    parser.feed(i);
                    let _ = parser.advance();
                })
            },
        );
    }
    group.finish();
}

criterion_group!(benches, benchmark);
criterion_main!(benches);
