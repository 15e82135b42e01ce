// SPDX-FileCopyrightText: 2025 Alexandre Gomes Gaigalas <alganet@gmail.com>
//
// SPDX-License-Identifier: ISC

//! Shared constructors for unit tests.

use crate::archive::ArchivedRequest;
use bytes::Bytes;
use hyper::{Request, Response};

/// A GET request with the given absolute URL and headers.
pub fn request_with_headers(url: &str, headers: &[(&str, &str)]) -> Request<Bytes> {
    let mut builder = Request::builder().method("GET").uri(url);
    for (name, value) in headers {
        builder = builder.header(*name, *value);
    }
    builder.body(Bytes::new()).expect("test request")
}

/// A plain-text response with the given status and body.
pub fn text_response(status: u16, body: &[u8]) -> Response<Bytes> {
    Response::builder()
        .status(status)
        .body(Bytes::copy_from_slice(body))
        .expect("test response")
}

/// A response with explicit headers.
pub fn response_with_headers(
    status: u16,
    headers: &[(&str, &str)],
    body: &[u8],
) -> Response<Bytes> {
    let mut builder = Response::builder().status(status);
    for (name, value) in headers {
        builder = builder.header(*name, *value);
    }
    builder
        .body(Bytes::copy_from_slice(body))
        .expect("test response")
}

/// An archived 200 exchange for the given URL and request headers.
pub fn archived_request(url: &str, headers: &[(&str, &str)]) -> ArchivedRequest {
    let req = request_with_headers(url, headers);
    let resp = text_response(200, b"");
    ArchivedRequest::new(&req, &resp).expect("serialize test exchange")
}

/// An archived exchange whose response carries a marker header, for
/// distinguishing duplicate-URL entries.
pub fn archived_request_with_response_marker(url: &str, marker: &str) -> ArchivedRequest {
    let req = request_with_headers(url, &[]);
    let resp = response_with_headers(200, &[("matched", marker)], b"");
    ArchivedRequest::new(&req, &resp).expect("serialize test exchange")
}
