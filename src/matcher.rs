// SPDX-FileCopyrightText: 2025 Alexandre Gomes Gaigalas <alganet@gmail.com>
//
// SPDX-License-Identifier: ISC

//! Matching engine: resolve an incoming request to a recorded exchange.
//!
//! Resolution is two-level. The host index prunes the search space, then an
//! exact URL lookup is tried before a fuzzy pass that scores every stored
//! URL sharing the request path by query-parameter overlap. Inside the
//! winning bucket a second score over request headers breaks ties, with an
//! optional chronological mode that cycles through duplicate entries using
//! session ids.

use crate::archive::{Archive, ArchivedRequest};
use crate::errors::{Error, Result};
use bytes::Bytes;
use hyper::header::{HeaderMap, HeaderName, HeaderValue};
use hyper::{Request, Response};
use std::collections::BTreeMap;
use std::sync::atomic::Ordering;
use tracing::warn;

impl Archive {
    /// Search the archive for the best recorded exchange for `req`.
    ///
    /// Returns [`Error::NotFound`] when no stored entry qualifies. Does not
    /// consume the request body; matching looks only at URL, method and
    /// headers.
    pub fn find_request(&self, req: &Request<Bytes>) -> Result<(Request<Bytes>, Response<Bytes>)> {
        let host = req
            .uri()
            .authority()
            .map(|a| a.as_str())
            .ok_or_else(|| Error::Config(format!("request URL must be absolute: {}", req.uri())))?;
        let host_map = match self.requests.get(host) {
            Some(m) if !m.is_empty() => m,
            _ => return Err(Error::NotFound),
        };

        let url = req.uri().to_string();
        if let Some(bucket) = host_map.get(&url) {
            if !bucket.is_empty() {
                return self.best_match_in_bucket(req, bucket);
            }
        }

        // Fuzzy pass: among stored URLs with the same path, pick the one
        // with the most matching query parameters. The ratio is
        // 2*(1+M)/(|aq|+|bq|); the +1 keeps it positive when nothing
        // matches.
        let aq = query_multimap(req.uri().query().unwrap_or(""));
        let mut best_url: Option<&String> = None;
        let mut best_ratio = 0.0f64;
        for candidate in host_map.keys() {
            let parsed = match url::Url::parse(candidate) {
                Ok(u) => u,
                Err(_) => continue,
            };
            if parsed.path() != req.uri().path() {
                continue;
            }
            let bq = query_multimap(parsed.query().unwrap_or(""));
            let mut matching = 1usize;
            let total = aq.len() + bq.len();
            for (key, values) in &aq {
                if bq.get(key) == Some(values) {
                    matching += 1;
                }
            }
            let ratio = 2.0 * matching as f64 / total as f64;
            // Map iteration order is nondeterministic; equal ratios fall
            // back to lexicographic URL order.
            if ratio > best_ratio
                || (ratio == best_ratio && best_url.map_or(false, |best| candidate < best))
            {
                best_url = Some(candidate);
                best_ratio = ratio;
            }
        }

        match best_url {
            Some(u) => self.best_match_in_bucket(req, &host_map[u]),
            None => Err(Error::NotFound),
        }
    }

    /// Pick the best entry of a bucket by header overlap. Single-entry
    /// buckets are returned as-is, without method filtering or session
    /// stamping.
    fn best_match_in_bucket(
        &self,
        incoming: &Request<Bytes>,
        bucket: &[ArchivedRequest],
    ) -> Result<(Request<Bytes>, Response<Bytes>)> {
        let scheme = incoming.uri().scheme_str().unwrap_or("http");
        if bucket.is_empty() {
            return Err(Error::NotFound);
        }
        if bucket.len() == 1 {
            return bucket[0].unmarshal(scheme);
        }

        let current = self.current_session_id.load(Ordering::SeqCst);
        let chronological = self.serve_response_in_chronological_sequence;

        let mut best: Option<(usize, f64)> = None;
        let mut best_in_sequence: Option<(usize, f64)> = None;
        for (index, entry) in bucket.iter().enumerate() {
            let (archived_req, _) = match entry.unmarshal(scheme) {
                Ok(pair) => pair,
                Err(e) => {
                    warn!(index, error = %e, "skipping undecodable entry");
                    continue;
                }
            };

            if archived_req.method() != incoming.method() {
                continue;
            }

            let mut matching = 1usize;
            let total = incoming.headers().keys_len() + archived_req.headers().keys_len();
            for name in archived_req.headers().keys() {
                if header_values_equal(archived_req.headers(), incoming.headers(), name) {
                    matching += 1;
                }
            }
            let ratio = 2.0 * matching as f64 / total as f64;

            if chronological
                && entry.last_served_session_id.load(Ordering::SeqCst) != current
                && ratio > best_in_sequence.map_or(0.0, |(_, r)| r)
            {
                best_in_sequence = Some((index, ratio));
            }
            if ratio > best.map_or(0.0, |(_, r)| r) {
                best = Some((index, ratio));
            }
        }

        let chosen = if chronological && best_in_sequence.is_some() {
            best_in_sequence
        } else {
            best
        };
        match chosen {
            Some((index, _)) => {
                let entry = &bucket[index];
                entry
                    .last_served_session_id
                    .store(current, Ordering::SeqCst);
                entry.unmarshal(scheme)
            }
            None => Err(Error::NotFound),
        }
    }
}

/// Parse a query string into an ordered multimap: key → value list in
/// appearance order.
fn query_multimap(query: &str) -> BTreeMap<String, Vec<String>> {
    let mut map: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for (key, value) in url::form_urlencoded::parse(query.as_bytes()) {
        map.entry(key.into_owned()).or_default().push(value.into_owned());
    }
    map
}

/// Compare the full value lists for one header name. Names are
/// case-insensitive per HeaderMap semantics; values compare byte-exact.
fn header_values_equal(a: &HeaderMap, b: &HeaderMap, name: &HeaderName) -> bool {
    let av: Vec<&HeaderValue> = a.get_all(name).iter().collect();
    let bv: Vec<&HeaderValue> = b.get_all(name).iter().collect();
    av == bv
}
