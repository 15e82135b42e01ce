// SPDX-FileCopyrightText: 2025 Alexandre Gomes Gaigalas <alganet@gmail.com>
//
// SPDX-License-Identifier: ISC

//! Record and replay request handlers.
//!
//! Both handlers consume fully buffered requests and produce hyper
//! responses; the listener loop (plain or TLS-terminated) is the embedder's
//! concern and tells the handler which scheme the connection carried.
//! Neither handler ever fails the service future: origin failures become
//! 502s, match misses become 404s.

use crate::archive::{Archive, WritableArchive};
use crate::certs::insecure_client_config;
use crate::errors::{Error, Result};
use crate::transform::{apply_all, Transformer};
use bytes::Bytes;
use hyper::client::HttpConnector;
use hyper::header::HOST;
use hyper::{Body, Client, Request, Response, StatusCode, Uri};
use std::sync::Arc;
use tracing::{error, info, warn};

/// Path answered with a plain 200 without consulting the archive; load
/// generators use it as a liveness probe.
pub const GENERATE_200_PATH: &str = "/web-page-replay-generate-200";
/// Path that restarts chronological serving for subsequent requests.
pub const RESET_CHRONOLOGY_PATH: &str = "/web-page-replay-reset-replay-chronology";

/// Forwards requests to real origins, archiving each exchange.
pub struct RecordHandler {
    archive: Arc<WritableArchive>,
    client: Client<hyper_rustls::HttpsConnector<HttpConnector>>,
    transformers: Vec<Box<dyn Transformer>>,
}

impl RecordHandler {
    /// Build a recording handler. The outbound client skips peer
    /// verification: trust decisions belong to replay-time clients, and the
    /// recorder must be able to reach origins with internal certs.
    pub fn new(archive: Arc<WritableArchive>, transformers: Vec<Box<dyn Transformer>>) -> Self {
        let connector = hyper_rustls::HttpsConnectorBuilder::new()
            .with_tls_config(insecure_client_config(&[]))
            .https_or_http()
            .enable_http1()
            .build();
        let client = Client::builder().build(connector);
        Self {
            archive,
            client,
            transformers,
        }
    }

    /// Handle one inbound request: forward, archive, transform, respond.
    /// `scheme` is how the listener received the connection ("http" or
    /// "https").
    pub async fn handle(&self, scheme: &str, req: Request<Body>) -> Response<Body> {
        let (parts, body) = req.into_parts();
        let body = match hyper::body::to_bytes(body).await {
            Ok(b) => b,
            Err(e) => {
                warn!(error = %e, "record: failed reading request body");
                return status_response(StatusCode::BAD_GATEWAY, "request body read failed");
            }
        };

        let recorded_req = match normalize_request(scheme, parts, body) {
            Ok(r) => r,
            Err(e) => {
                warn!(error = %e, "record: unroutable request");
                return status_response(StatusCode::BAD_REQUEST, "unroutable request");
            }
        };

        let mut outbound = Request::builder()
            .method(recorded_req.method())
            .uri(recorded_req.uri().clone());
        for (name, value) in recorded_req.headers() {
            outbound = outbound.header(name, value);
        }
        let outbound = match outbound.body(Body::from(recorded_req.body().clone())) {
            Ok(r) => r,
            Err(e) => {
                error!(error = %e, "record: failed building outbound request");
                return status_response(StatusCode::BAD_GATEWAY, "outbound build failed");
            }
        };

        let origin_resp = match self.client.request(outbound).await {
            Ok(r) => r,
            Err(e) => {
                warn!(url = %recorded_req.uri(), error = %e, "record: origin request failed");
                return status_response(StatusCode::BAD_GATEWAY, "origin request failed");
            }
        };

        let (resp_parts, resp_body) = origin_resp.into_parts();
        let resp_body = match hyper::body::to_bytes(resp_body).await {
            Ok(b) => b,
            Err(e) => {
                warn!(url = %recorded_req.uri(), error = %e, "record: origin body read failed");
                return status_response(StatusCode::BAD_GATEWAY, "origin body read failed");
            }
        };
        let mut recorded_resp = Response::from_parts(resp_parts, resp_body);

        // Archive the exchange as received; transformers only affect what
        // the downstream client sees.
        if let Err(e) = self.archive.record_request(&recorded_req, &recorded_resp) {
            error!(url = %recorded_req.uri(), error = %e, "record: failed archiving exchange");
        }

        apply_all(&self.transformers, &recorded_req, &mut recorded_resp);
        to_hyper_response(recorded_resp)
    }

    /// Flush the archive to disk; called on shutdown (e.g. SIGINT).
    pub fn close(&self) -> Result<()> {
        self.archive.close()
    }
}

/// Serves archived responses; never performs outbound I/O.
pub struct ReplayHandler {
    archive: Arc<Archive>,
    transformers: Vec<Box<dyn Transformer>>,
}

impl ReplayHandler {
    pub fn new(archive: Arc<Archive>, transformers: Vec<Box<dyn Transformer>>) -> Self {
        Self {
            archive,
            transformers,
        }
    }

    /// Handle one inbound request by matching it against the archive.
    pub async fn handle(&self, scheme: &str, req: Request<Body>) -> Response<Body> {
        let (parts, body) = req.into_parts();
        // Drain the body so the connection stays usable; matching never
        // consults it.
        let body = match hyper::body::to_bytes(body).await {
            Ok(b) => b,
            Err(e) => {
                warn!(error = %e, "replay: failed reading request body");
                Bytes::new()
            }
        };

        match parts.uri.path() {
            GENERATE_200_PATH => return status_response(StatusCode::OK, "OK"),
            RESET_CHRONOLOGY_PATH => {
                self.archive.start_new_replay_session();
                info!("replay: reset replay chronology");
                return status_response(StatusCode::OK, "OK");
            }
            _ => {}
        }

        let incoming = match normalize_request(scheme, parts, body) {
            Ok(r) => r,
            Err(e) => {
                warn!(error = %e, "replay: unroutable request");
                return status_response(StatusCode::NOT_FOUND, "");
            }
        };

        match self.archive.find_request(&incoming) {
            Ok((_, mut resp)) => {
                apply_all(&self.transformers, &incoming, &mut resp);
                to_hyper_response(resp)
            }
            Err(Error::NotFound) => {
                info!(url = %incoming.uri(), method = %incoming.method(), "replay: no matching request");
                status_response(StatusCode::NOT_FOUND, "")
            }
            Err(e) => {
                error!(url = %incoming.uri(), error = %e, "replay: archive lookup failed");
                status_response(StatusCode::NOT_FOUND, "")
            }
        }
    }
}

/// Rebuild an inbound request as an absolute-URL buffered request: the
/// scheme comes from the listener, the authority from the request target or
/// the `Host` header, and the `Host` header itself is folded into the URI.
fn normalize_request(
    scheme: &str,
    parts: hyper::http::request::Parts,
    body: Bytes,
) -> Result<Request<Bytes>> {
    let uri = if let Some(authority) = parts.uri.authority() {
        Uri::builder()
            .scheme(parts.uri.scheme_str().unwrap_or(scheme))
            .authority(authority.as_str())
            .path_and_query(
                parts
                    .uri
                    .path_and_query()
                    .map(|pq| pq.as_str())
                    .unwrap_or("/"),
            )
            .build()
            .map_err(|e| Error::Config(format!("bad request URL: {e}")))?
    } else {
        let host = parts
            .headers
            .get(HOST)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| Error::Config("relative request without Host header".into()))?;
        Uri::builder()
            .scheme(scheme)
            .authority(host)
            .path_and_query(
                parts
                    .uri
                    .path_and_query()
                    .map(|pq| pq.as_str())
                    .unwrap_or("/"),
            )
            .build()
            .map_err(|e| Error::Config(format!("bad request URL: {e}")))?
    };

    let mut req = Request::builder()
        .method(parts.method)
        .uri(uri)
        .version(parts.version)
        .body(body)
        .map_err(|e| Error::Config(format!("bad request: {e}")))?;
    *req.headers_mut() = parts.headers;
    req.headers_mut().remove(HOST);
    Ok(req)
}

fn to_hyper_response(resp: Response<Bytes>) -> Response<Body> {
    resp.map(Body::from)
}

fn status_response(status: StatusCode, message: &str) -> Response<Body> {
    Response::builder()
        .status(status)
        .body(Body::from(message.to_string()))
        .unwrap_or_else(|_| Response::new(Body::empty()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::AddMode;
    use crate::test_helpers::{request_with_headers, response_with_headers};
    use crate::transform::ScriptInjector;
    use std::collections::HashMap;
    use uuid::Uuid;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn temp_archive_path() -> std::path::PathBuf {
        std::env::temp_dir().join(format!("replay_http_proxy_{}.wprgo", Uuid::new_v4()))
    }

    fn replay_handler_with(
        urls: &[(&str, &[u8])],
        transformers: Vec<Box<dyn Transformer>>,
    ) -> ReplayHandler {
        let mut archive = Archive::new();
        for (url, body) in urls {
            let req = request_with_headers(url, &[]);
            let resp = response_with_headers(200, &[("content-type", "text/html")], body);
            archive
                .add_archived_request(&req, &resp, AddMode::Append)
                .unwrap();
        }
        archive
            .current_session_id
            .store(1, std::sync::atomic::Ordering::SeqCst);
        ReplayHandler::new(Arc::new(archive), transformers)
    }

    #[tokio::test]
    async fn record_forwards_and_archives() {
        let mock = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/page"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "text/plain")
                    .set_body_string("origin body"),
            )
            .mount(&mock)
            .await;

        let archive_path = temp_archive_path();
        let wa = Arc::new(WritableArchive::create(&archive_path).unwrap());
        let handler = RecordHandler::new(wa.clone(), Vec::new());

        let req = Request::builder()
            .method("GET")
            .uri(format!("{}/page", mock.uri()))
            .body(Body::empty())
            .unwrap();
        let resp = handler.handle("http", req).await;
        assert_eq!(resp.status(), StatusCode::OK);
        let body = hyper::body::to_bytes(resp.into_body()).await.unwrap();
        assert_eq!(body.as_ref(), b"origin body");

        let snapshot = wa.snapshot().unwrap();
        let host = mock.address().to_string();
        assert_eq!(snapshot.requests[&host].len(), 1);

        let _ = std::fs::remove_file(&archive_path);
    }

    #[tokio::test]
    async fn record_origin_failure_is_502_and_archives_nothing() {
        let archive_path = temp_archive_path();
        let wa = Arc::new(WritableArchive::create(&archive_path).unwrap());
        let handler = RecordHandler::new(wa.clone(), Vec::new());

        // Port 9 (discard) is almost certainly closed.
        let req = Request::builder()
            .method("GET")
            .uri("http://127.0.0.1:9/")
            .body(Body::empty())
            .unwrap();
        let resp = handler.handle("http", req).await;
        assert_eq!(resp.status(), StatusCode::BAD_GATEWAY);

        let snapshot = wa.snapshot().unwrap();
        assert!(snapshot.requests.is_empty());

        let _ = std::fs::remove_file(&archive_path);
    }

    #[tokio::test]
    async fn record_builds_absolute_url_from_host_header() {
        let mock = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/rel"))
            .respond_with(ResponseTemplate::new(200).set_body_string("ok"))
            .mount(&mock)
            .await;

        let archive_path = temp_archive_path();
        let wa = Arc::new(WritableArchive::create(&archive_path).unwrap());
        let handler = RecordHandler::new(wa.clone(), Vec::new());

        let req = Request::builder()
            .method("GET")
            .uri("/rel")
            .header(HOST, mock.address().to_string())
            .body(Body::empty())
            .unwrap();
        let resp = handler.handle("http", req).await;
        assert_eq!(resp.status(), StatusCode::OK);

        let snapshot = wa.snapshot().unwrap();
        let host = mock.address().to_string();
        let expected = format!("http://{host}/rel");
        assert!(snapshot.requests[&host].contains_key(&expected));

        let _ = std::fs::remove_file(&archive_path);
    }

    #[tokio::test]
    async fn replay_serves_archived_response_without_network() {
        let handler = replay_handler_with(
            &[("https://example.com/page", b"<html>recorded</html>")],
            Vec::new(),
        );
        let req = Request::builder()
            .method("GET")
            .uri("https://example.com/page")
            .body(Body::empty())
            .unwrap();
        let resp = handler.handle("https", req).await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(
            resp.headers().get("content-type").unwrap(),
            "text/html"
        );
        let body = hyper::body::to_bytes(resp.into_body()).await.unwrap();
        assert_eq!(body.as_ref(), b"<html>recorded</html>");
    }

    #[tokio::test]
    async fn replay_miss_is_404() {
        let handler = replay_handler_with(&[], Vec::new());
        let req = Request::builder()
            .method("GET")
            .uri("https://unknown.example/missing")
            .body(Body::empty())
            .unwrap();
        let resp = handler.handle("https", req).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn replay_applies_transformers() {
        let injector =
            ScriptInjector::new(b"var replayed=1;", &HashMap::new()).unwrap();
        let handler = replay_handler_with(
            &[("https://example.com/page", b"<html></html>")],
            vec![Box::new(injector)],
        );
        let req = Request::builder()
            .method("GET")
            .uri("https://example.com/page")
            .body(Body::empty())
            .unwrap();
        let resp = handler.handle("https", req).await;
        let body = hyper::body::to_bytes(resp.into_body()).await.unwrap();
        assert_eq!(
            body.as_ref(),
            b"<html><script>var replayed=1;</script></html>".as_slice()
        );
    }

    #[tokio::test]
    async fn replay_normalizes_relative_requests() {
        let handler = replay_handler_with(
            &[("https://example.com/page", b"recorded")],
            Vec::new(),
        );
        let req = Request::builder()
            .method("GET")
            .uri("/page")
            .header(HOST, "example.com")
            .body(Body::empty())
            .unwrap();
        let resp = handler.handle("https", req).await;
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn control_urls_do_not_touch_the_archive() {
        let handler = replay_handler_with(&[], Vec::new());

        let req = Request::builder()
            .uri(format!("https://example.com{GENERATE_200_PATH}"))
            .body(Body::empty())
            .unwrap();
        let resp = handler.handle("https", req).await;
        assert_eq!(resp.status(), StatusCode::OK);

        let before = handler
            .archive
            .current_session_id
            .load(std::sync::atomic::Ordering::SeqCst);
        let req = Request::builder()
            .uri(format!("https://example.com{RESET_CHRONOLOGY_PATH}"))
            .body(Body::empty())
            .unwrap();
        let resp = handler.handle("https", req).await;
        assert_eq!(resp.status(), StatusCode::OK);
        let after = handler
            .archive
            .current_session_id
            .load(std::sync::atomic::Ordering::SeqCst);
        assert_eq!(after, before + 1);
    }

    #[test]
    fn normalize_strips_host_header_into_uri() {
        let req = Request::builder()
            .method("GET")
            .uri("/p?q=1")
            .header(HOST, "example.com:8443")
            .header("accept", "*/*")
            .body(Body::empty())
            .unwrap();
        let (parts, _) = req.into_parts();
        let normalized = normalize_request("https", parts, Bytes::new()).unwrap();
        assert_eq!(
            normalized.uri().to_string(),
            "https://example.com:8443/p?q=1"
        );
        assert!(normalized.headers().get(HOST).is_none());
        assert!(normalized.headers().get("accept").is_some());
    }
}
