// SPDX-FileCopyrightText: 2025 Alexandre Gomes Gaigalas <alganet@gmail.com>
//
// SPDX-License-Identifier: ISC

//! HTTP/1.1 wire-format codec for archived exchanges.
//!
//! Archived requests are stored origin-form with a `Host` header; the parser
//! also accepts absolute-form request targets. Responses are stored with the
//! body fully buffered: `Transfer-Encoding` never appears in stored bytes,
//! and a stored response carries `Content-Length` only if the live response
//! did.

use crate::errors::{Error, Result};
use bytes::Bytes;
use hyper::header::{HeaderName, HeaderValue, CONTENT_LENGTH, HOST, TRANSFER_ENCODING};
use hyper::{Method, Request, Response, StatusCode, Uri, Version};

const MAX_HEADERS: usize = 100;

/// Render a buffered request to its stored wire form.
///
/// The request URL must be absolute; the authority becomes the `Host` header
/// and the request-line carries the origin-form target.
pub fn serialize_request(req: &Request<Bytes>) -> Result<Vec<u8>> {
    let authority = req
        .uri()
        .authority()
        .ok_or_else(|| Error::Config(format!("request URL must be absolute: {}", req.uri())))?;
    let target = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");

    let mut buf = Vec::with_capacity(128 + req.body().len());
    buf.extend_from_slice(req.method().as_str().as_bytes());
    buf.push(b' ');
    buf.extend_from_slice(target.as_bytes());
    buf.extend_from_slice(b" HTTP/1.1\r\n");
    buf.extend_from_slice(b"Host: ");
    buf.extend_from_slice(authority.as_str().as_bytes());
    buf.extend_from_slice(b"\r\n");
    for (name, value) in req.headers() {
        if name == HOST {
            continue;
        }
        write_header(&mut buf, name, value);
    }
    buf.extend_from_slice(b"\r\n");
    buf.extend_from_slice(req.body());
    Ok(buf)
}

/// Parse a stored request. `fallback_scheme` supplies the URL scheme for
/// origin-form targets; absolute-form targets keep their own scheme.
pub fn parse_request(raw: &[u8], fallback_scheme: &str) -> Result<Request<Bytes>> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut parsed = httparse::Request::new(&mut headers);
    let header_len = match parsed
        .parse(raw)
        .map_err(|e| Error::Wire(format!("bad request: {e}")))?
    {
        httparse::Status::Complete(n) => n,
        httparse::Status::Partial => {
            return Err(Error::Wire("truncated request header block".into()))
        }
    };

    let method = parsed
        .method
        .ok_or_else(|| Error::Wire("request missing method".into()))?
        .parse::<Method>()
        .map_err(|e| Error::Wire(format!("bad method: {e}")))?;
    let target = parsed
        .path
        .ok_or_else(|| Error::Wire("request missing target".into()))?;

    let uri: Uri = if target.starts_with("http://") || target.starts_with("https://") {
        target
            .parse()
            .map_err(|e| Error::Wire(format!("bad absolute target {target}: {e}")))?
    } else {
        let host = parsed
            .headers
            .iter()
            .find(|h| h.name.eq_ignore_ascii_case("host"))
            .map(|h| String::from_utf8_lossy(h.value).into_owned())
            .ok_or_else(|| Error::Wire(format!("origin-form target {target} without Host")))?;
        format!("{fallback_scheme}://{host}{target}")
            .parse()
            .map_err(|e| Error::Wire(format!("bad target {target}: {e}")))?
    };

    let mut builder = Request::builder()
        .method(method)
        .uri(uri)
        .version(parse_version(parsed.version));
    for h in parsed.headers.iter() {
        if h.name.eq_ignore_ascii_case("host") {
            continue;
        }
        builder = builder.header(
            parse_header_name(h.name)?,
            HeaderValue::from_bytes(h.value)
                .map_err(|e| Error::Wire(format!("bad header value for {}: {e}", h.name)))?,
        );
    }
    builder
        .body(Bytes::copy_from_slice(&raw[header_len..]))
        .map_err(|e| Error::Wire(format!("bad request: {e}")))
}

/// Render a buffered response to its stored wire form.
///
/// `Transfer-Encoding` is dropped (the body is already decoded) and any
/// `Content-Length` is rewritten to the buffered body length.
pub fn serialize_response(resp: &Response<Bytes>) -> Vec<u8> {
    let mut buf = Vec::with_capacity(128 + resp.body().len());
    buf.extend_from_slice(b"HTTP/1.1 ");
    buf.extend_from_slice(resp.status().as_str().as_bytes());
    buf.push(b' ');
    buf.extend_from_slice(resp.status().canonical_reason().unwrap_or("").as_bytes());
    buf.extend_from_slice(b"\r\n");

    let mut wrote_content_length = false;
    for (name, value) in resp.headers() {
        if name == TRANSFER_ENCODING {
            continue;
        }
        if name == CONTENT_LENGTH {
            if !wrote_content_length {
                wrote_content_length = true;
                let len = resp.body().len().to_string();
                buf.extend_from_slice(b"content-length: ");
                buf.extend_from_slice(len.as_bytes());
                buf.extend_from_slice(b"\r\n");
            }
            continue;
        }
        write_header(&mut buf, name, value);
    }
    buf.extend_from_slice(b"\r\n");
    buf.extend_from_slice(resp.body());
    buf
}

/// Parse a stored response. The body is the byte remainder after the header
/// block; stored bytes are self-delimiting, so `Content-Length` is not
/// consulted.
pub fn parse_response(raw: &[u8]) -> Result<Response<Bytes>> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut parsed = httparse::Response::new(&mut headers);
    let header_len = match parsed
        .parse(raw)
        .map_err(|e| Error::Wire(format!("bad response: {e}")))?
    {
        httparse::Status::Complete(n) => n,
        httparse::Status::Partial => {
            return Err(Error::Wire("truncated response header block".into()))
        }
    };

    let status = StatusCode::from_u16(
        parsed
            .code
            .ok_or_else(|| Error::Wire("response missing status".into()))?,
    )
    .map_err(|e| Error::Wire(format!("bad status: {e}")))?;

    let mut builder = Response::builder()
        .status(status)
        .version(parse_version(parsed.version));
    for h in parsed.headers.iter() {
        builder = builder.header(
            parse_header_name(h.name)?,
            HeaderValue::from_bytes(h.value)
                .map_err(|e| Error::Wire(format!("bad header value for {}: {e}", h.name)))?,
        );
    }
    builder
        .body(Bytes::copy_from_slice(&raw[header_len..]))
        .map_err(|e| Error::Wire(format!("bad response: {e}")))
}

fn write_header(buf: &mut Vec<u8>, name: &HeaderName, value: &HeaderValue) {
    buf.extend_from_slice(name.as_str().as_bytes());
    buf.extend_from_slice(b": ");
    buf.extend_from_slice(value.as_bytes());
    buf.extend_from_slice(b"\r\n");
}

fn parse_header_name(name: &str) -> Result<HeaderName> {
    name.parse::<HeaderName>()
        .map_err(|e| Error::Wire(format!("bad header name {name}: {e}")))
}

fn parse_version(version: Option<u8>) -> Version {
    match version {
        Some(0) => Version::HTTP_10,
        _ => Version::HTTP_11,
    }
}
