// SPDX-FileCopyrightText: 2025 Alexandre Gomes Gaigalas <alganet@gmail.com>
//
// SPDX-License-Identifier: ISC

//! Body codecs for the `gzip`, `deflate` and `br` content codings.
//!
//! HTTP `deflate` is treated as raw DEFLATE, which is what archives recorded
//! by earlier versions contain.

use crate::errors::{Error, Result};
use bytes::Bytes;
use flate2::read::{DeflateDecoder, GzDecoder};
use flate2::write::{DeflateEncoder, GzEncoder};
use flate2::Compression;
use hyper::header::{CONTENT_ENCODING, CONTENT_LENGTH};
use hyper::Response;
use std::io::{Read, Write};

/// Decompress `body` according to content coding `ce`. Unknown or identity
/// codings return the input unchanged alongside an error so callers can
/// apply the best-effort contract.
pub fn decompress_body(ce: &str, body: &[u8]) -> Result<Vec<u8>> {
    match ce.to_ascii_lowercase().as_str() {
        "gzip" => {
            let mut out = Vec::new();
            GzDecoder::new(body).read_to_end(&mut out)?;
            Ok(out)
        }
        "deflate" => {
            let mut out = Vec::new();
            DeflateDecoder::new(body).read_to_end(&mut out)?;
            Ok(out)
        }
        "br" => {
            let mut out = Vec::new();
            brotli::Decompressor::new(body, 4096).read_to_end(&mut out)?;
            Ok(out)
        }
        other => Err(Error::Transform(format!("unknown content coding: {other}"))),
    }
}

/// Compress `body` according to accepted coding `ae`. Returns the compressed
/// bytes and the coding actually chosen. An unrecognized coding returns the
/// input and `"identity"` alongside an error.
pub fn compress_body(ae: &str, body: &[u8]) -> Result<(Vec<u8>, &'static str)> {
    let ae = ae.to_ascii_lowercase();
    if ae.contains("gzip") {
        let mut enc = GzEncoder::new(Vec::new(), Compression::default());
        enc.write_all(body)?;
        Ok((enc.finish()?, "gzip"))
    } else if ae.contains("deflate") {
        let mut enc = DeflateEncoder::new(Vec::new(), Compression::default());
        enc.write_all(body)?;
        Ok((enc.finish()?, "deflate"))
    } else if ae.contains("br") {
        let mut out = Vec::new();
        {
            let mut enc = brotli::CompressorWriter::new(&mut out, 4096, 5, 22);
            enc.write_all(body)?;
            enc.flush()?;
        }
        Ok((out, "br"))
    } else {
        Err(Error::Transform(format!("unknown content coding: {ae}")))
    }
}

/// Decompress a buffered response in place, dropping `Content-Encoding` and
/// fixing `Content-Length`. Responses that are already uncompressed are left
/// untouched, so the operation is idempotent.
pub fn decompress_response(resp: &mut Response<Bytes>) -> Result<()> {
    let ce = resp
        .headers()
        .get(CONTENT_ENCODING)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_ascii_lowercase())
        .unwrap_or_default();
    if ce.is_empty() || ce == "identity" {
        return Ok(());
    }

    let body = decompress_body(&ce, resp.body())?;
    resp.headers_mut().remove(CONTENT_ENCODING);
    if resp.headers().contains_key(CONTENT_LENGTH) {
        let len = body.len().to_string();
        resp.headers_mut()
            .insert(CONTENT_LENGTH, len.parse().expect("decimal length"));
    }
    *resp.body_mut() = Bytes::from(body);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::response_with_headers;
    use rstest::rstest;

    #[rstest]
    #[case("gzip")]
    #[case("deflate")]
    #[case("br")]
    fn codecs_roundtrip(#[case] coding: &str) {
        let plain = b"<html><body>hello compression</body></html>";
        let (compressed, chosen) = compress_body(coding, plain).unwrap();
        assert_eq!(chosen, coding);
        assert_ne!(compressed.as_slice(), plain.as_slice());
        let back = decompress_body(coding, &compressed).unwrap();
        assert_eq!(back.as_slice(), plain.as_slice());
    }

    #[test]
    fn coding_is_matched_case_insensitively() {
        let (compressed, chosen) = compress_body("GZip", b"data").unwrap();
        assert_eq!(chosen, "gzip");
        assert_eq!(decompress_body("GZIP", &compressed).unwrap(), b"data");
    }

    #[test]
    fn unknown_coding_is_an_error() {
        assert!(decompress_body("zstd", b"data").is_err());
        assert!(compress_body("zstd", b"data").is_err());
    }

    #[test]
    fn corrupt_gzip_is_an_error() {
        assert!(decompress_body("gzip", b"definitely not gzip").is_err());
    }

    #[test]
    fn decompress_response_is_idempotent() {
        let (gz, _) = compress_body("gzip", b"payload").unwrap();
        let len = gz.len().to_string();
        let mut resp = response_with_headers(
            200,
            &[("content-encoding", "gzip"), ("content-length", &len)],
            &gz,
        );

        decompress_response(&mut resp).unwrap();
        assert_eq!(resp.body().as_ref(), b"payload");
        assert!(resp.headers().get(CONTENT_ENCODING).is_none());
        assert_eq!(resp.headers().get(CONTENT_LENGTH).unwrap(), "7");

        // Second pass sees no Content-Encoding and changes nothing.
        decompress_response(&mut resp).unwrap();
        assert_eq!(resp.body().as_ref(), b"payload");
    }

    #[test]
    fn decompress_response_without_length_leaves_length_absent() {
        let (gz, _) = compress_body("gzip", b"chunked once").unwrap();
        let mut resp = response_with_headers(200, &[("content-encoding", "gzip")], &gz);
        decompress_response(&mut resp).unwrap();
        assert_eq!(resp.body().as_ref(), b"chunked once");
        assert!(resp.headers().get(CONTENT_LENGTH).is_none());
    }
}
