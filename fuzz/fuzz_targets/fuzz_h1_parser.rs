#![no_main]

use libfuzzer_sys::fuzz_target;
use vortex::http::{ParserLimits, RequestParser};

fn limits() -> ParserLimits {
    ParserLimits {
        max_header_line_size: 8 * 1024,
        max_headers: 100,
        max_message_size: 1024 * 1024,
    }
}

// Feeds the corpus in two halves rather than all at once, so the fuzzer
// also exercises the resumable-across-reads path rather than only ever
// seeing one contiguous buffer.
fuzz_target!(|data: &[u8]| {
    let mut parser = RequestParser::new(limits());
    let mid = data.len() / 2;
    parser.feed(&data[..mid]);
    let _ = parser.advance();
    parser.feed(&data[mid..]);
    loop {
        match parser.advance() {
            Ok(Some(_)) => continue,
            _ => break,
        }
    }
});
