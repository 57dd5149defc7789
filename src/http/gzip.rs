//! Optional gzip body compression, applied only when the application opts
//! in. Built on `flate2`'s standard `GzEncoder` recipe rather than a
//! hand-rolled deflate implementation.

use std::io::Write;

use flate2::write::GzEncoder;
use flate2::Compression;

use super::message::Response;

/// Gzips `response.body` in place and sets `Content-Encoding: gzip`,
/// replacing any existing `Content-Length` (the compressed size differs
/// from the original). A no-op on an empty body.
pub fn compress(mut response: Response) -> std::io::Result<Response> {
    if response.body.is_empty() {
        return Ok(response);
    }
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(&response.body)?;
    response.body = encoder.finish()?;
    response.headers.push("content-encoding", "gzip");
    Ok(response)
}

/// Compresses only if the client's `Accept-Encoding` lists gzip and the
/// body is at least `min_size` bytes (compressing tiny bodies usually costs
/// more than it saves).
pub fn compress_if_acceptable(
    response: Response,
    accept_encoding: Option<&str>,
    min_size: usize,
) -> std::io::Result<Response> {
    let acceptable = accept_encoding
        .map(|v| v.split(',').map(str::trim).any(|tok| tok.starts_with("gzip")))
        .unwrap_or(false);
    if acceptable && response.body.len() >= min_size {
        compress(response)
    } else {
        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::status::Status;

    #[test]
    fn compress_sets_content_encoding_and_shrinks_body_len_field() {
        let response = Response::new(Status::OK).body(vec![b'a'; 1024]);
        let compressed = compress(response).unwrap();
        assert_eq!(compressed.headers.get("content-encoding"), Some("gzip"));
    }

    #[test]
    fn skips_when_client_does_not_accept_gzip() {
        let response = Response::new(Status::OK).body(vec![b'a'; 1024]);
        let out = compress_if_acceptable(response, Some("br"), 0).unwrap();
        assert!(out.headers.get("content-encoding").is_none());
    }
}
