// SPDX-FileCopyrightText: 2025 Alexandre Gomes Gaigalas <alganet@gmail.com>
//
// SPDX-License-Identifier: ISC

//! Archive store: recorded exchanges, per-host TLS material, persistence.
//!
//! An [`Archive`] is a replayable bundle serialized as gzip-compressed JSON.
//! Exchanges are indexed host → absolute URL → ordered bucket; the two-level
//! index lets the matcher prune its fuzzy search to one host. A
//! [`WritableArchive`] wraps an archive with the mutex-guarded mutation
//! surface the recording handler uses.

use crate::errors::{Error, Result};
use crate::wire;
use bytes::Bytes;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use hyper::{Request, Response};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;
use tracing::{info, warn};

/// One recorded exchange: request and response in HTTP/1.1 wire form.
///
/// Immutable after creation except for `last_served_session_id`, which the
/// matcher stamps during chronological replay.
#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ArchivedRequest {
    #[serde(rename = "SerializedRequest", with = "crate::serde_helpers::base64_bytes")]
    pub serialized_request: Vec<u8>,
    /// Empty if the original transaction failed.
    #[serde(rename = "SerializedResponse", with = "crate::serde_helpers::base64_bytes")]
    pub serialized_response: Vec<u8>,
    #[serde(rename = "LastServedSessionId")]
    pub last_served_session_id: AtomicU32,
}

impl ArchivedRequest {
    /// Serialize a buffered exchange for storage.
    pub fn new(req: &Request<Bytes>, resp: &Response<Bytes>) -> Result<Self> {
        Ok(Self {
            serialized_request: wire::serialize_request(req)?,
            serialized_response: wire::serialize_response(resp),
            last_served_session_id: AtomicU32::new(0),
        })
    }

    /// Decode the stored exchange. `scheme` fills in the URL scheme for
    /// origin-form stored requests.
    pub fn unmarshal(&self, scheme: &str) -> Result<(Request<Bytes>, Response<Bytes>)> {
        let req = wire::parse_request(&self.serialized_request, scheme)?;
        let resp = wire::parse_response(&self.serialized_response)?;
        Ok((req, resp))
    }

    fn copy(&self) -> Self {
        Self {
            serialized_request: self.serialized_request.clone(),
            serialized_response: self.serialized_response.clone(),
            last_served_session_id: AtomicU32::new(
                self.last_served_session_id.load(Ordering::SeqCst),
            ),
        }
    }
}

/// How `add_archived_request` treats an existing bucket for the same URL.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddMode {
    /// Push onto the ordered bucket.
    Append,
    /// Replace the bucket with the new entry.
    OverwriteExisting,
    /// Keep the existing bucket and drop the new entry.
    SkipExisting,
}

/// A replayable bundle of recorded exchanges plus per-host TLS material.
///
/// Immutable during replay except for the two session counters; shared as
/// `Arc<Archive>` across connections.
#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Archive {
    /// host → absolute URL → ordered exchanges for that URL.
    #[serde(rename = "Requests")]
    pub requests: HashMap<String, HashMap<String, Vec<ArchivedRequest>>>,
    /// host → DER-encoded leaf certificate bytes (possibly a concatenation
    /// of several certificates, one per configured root).
    #[serde(rename = "Certs", with = "crate::serde_helpers::base64_bytes_map")]
    pub certs: HashMap<String, Vec<u8>>,
    /// host → ALPN protocol observed during recording ("h2" or "http/1.1").
    #[serde(rename = "NegotiatedProtocol")]
    pub negotiated_protocol: HashMap<String, String>,
    /// host → remote ip:port observed during recording.
    #[serde(rename = "RemoteAddresses")]
    pub remote_addresses: HashMap<String, String>,
    /// Seed consumed by injected client-side determinism scripts.
    #[serde(rename = "DeterministicTimeSeedMs")]
    pub deterministic_time_seed_ms: i64,
    /// When true, replay prefers entries not yet served in this session.
    #[serde(rename = "ServeResponseInChronologicalSequence")]
    pub serve_response_in_chronological_sequence: bool,
    /// Replay session counter; reset to 1 on load.
    #[serde(rename = "CurrentSessionId")]
    pub current_session_id: AtomicU32,
}

impl Archive {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open an archive file previously written by [`WritableArchive::close`].
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = File::open(path.as_ref())
            .map_err(|e| Error::Archive(format!("could not open {:?}: {e}", path.as_ref())))?;
        Self::load(file)
    }

    /// Decode a gzipped-JSON archive from a reader and prepare it for
    /// replay. Unknown JSON fields are ignored; missing fields take zero
    /// values.
    pub fn load<R: io::Read>(reader: R) -> Result<Self> {
        let gz = GzDecoder::new(reader);
        let archive: Archive = serde_json::from_reader(gz)
            .map_err(|e| Error::Archive(format!("archive decode failed: {e}")))?;
        // Session bookkeeping restarts on every load regardless of what was
        // stored.
        archive.current_session_id.store(1, Ordering::SeqCst);
        Ok(archive)
    }

    /// Serialize this archive as gzipped JSON.
    pub fn serialize<W: io::Write>(&self, writer: W) -> Result<()> {
        let mut gz = GzEncoder::new(writer, Compression::default());
        serde_json::to_writer(&mut gz, self)
            .map_err(|e| Error::Archive(format!("archive encode failed: {e}")))?;
        gz.finish()?;
        Ok(())
    }

    /// The stored DER cert bytes and negotiated protocol for a host, if the
    /// host was seen during recording.
    pub fn find_host_tls_config(&self, host: &str) -> Option<(&[u8], &str)> {
        self.certs
            .get(host)
            .map(|der| (der.as_slice(), self.negotiated_protocol_for(host)))
    }

    /// The ALPN protocol recorded for a host; defaults to `"http/1.1"`.
    pub fn negotiated_protocol_for(&self, host: &str) -> &str {
        self.negotiated_protocol
            .get(host)
            .map(String::as_str)
            .unwrap_or("http/1.1")
    }

    /// Insert one exchange under its host/URL slot according to `mode`.
    pub fn add_archived_request(
        &mut self,
        req: &Request<Bytes>,
        resp: &Response<Bytes>,
        mode: AddMode,
    ) -> Result<()> {
        let host = req
            .uri()
            .authority()
            .ok_or_else(|| Error::Config(format!("request URL must be absolute: {}", req.uri())))?
            .to_string();
        let url = req.uri().to_string();
        let entry = ArchivedRequest::new(req, resp)?;

        let bucket = self
            .requests
            .entry(host)
            .or_default()
            .entry(url.clone())
            .or_default();
        match mode {
            AddMode::Append => bucket.push(entry),
            AddMode::OverwriteExisting => {
                if !bucket.is_empty() {
                    info!(url = %url, "overwriting existing request");
                }
                *bucket = vec![entry];
            }
            AddMode::SkipExisting => {
                if bucket.is_empty() {
                    bucket.push(entry);
                } else {
                    info!(url = %url, "skipping existing request");
                }
            }
        }
        Ok(())
    }

    /// Apply `f` to every decoded exchange. Entries that fail to decode are
    /// logged and skipped; errors returned by `f` stop the iteration.
    pub fn for_each<F>(&self, mut f: F) -> Result<()>
    where
        F: FnMut(Request<Bytes>, Response<Bytes>) -> Result<()>,
    {
        for url_map in self.requests.values() {
            for (url, bucket) in url_map {
                let scheme = url
                    .parse::<hyper::Uri>()
                    .ok()
                    .and_then(|u| u.scheme_str().map(str::to_owned))
                    .unwrap_or_else(|| "http".to_string());
                for (index, entry) in bucket.iter().enumerate() {
                    match entry.unmarshal(&scheme) {
                        Ok((req, resp)) => f(req, resp)?,
                        Err(e) => {
                            warn!(url = %url, index, error = %e, "skipping undecodable entry");
                        }
                    }
                }
            }
        }
        Ok(())
    }

    /// Produce a fresh archive by passing every exchange through `f`.
    /// Returning `None` drops the exchange. The receiver is unmodified.
    pub fn edit<F>(&self, mut f: F) -> Result<Archive>
    where
        F: FnMut(Request<Bytes>, Response<Bytes>) -> Result<Option<(Request<Bytes>, Response<Bytes>)>>,
    {
        let mut clone = Archive::new();
        self.for_each(|req, resp| {
            if let Some((new_req, new_resp)) = f(req, resp)? {
                clone.add_archived_request(&new_req, &new_resp, AddMode::Append)?;
            }
            Ok(())
        })?;
        Ok(clone)
    }

    /// Produce a fresh archive without the exchanges for which
    /// `should_drop` returns true. Insertion order inside each bucket is
    /// preserved.
    pub fn trim<F>(&self, mut should_drop: F) -> Result<Archive>
    where
        F: FnMut(&Request<Bytes>, &Response<Bytes>) -> Result<bool>,
    {
        self.edit(|req, resp| {
            if should_drop(&req, &resp)? {
                Ok(None)
            } else {
                Ok(Some((req, resp)))
            }
        })
    }

    /// Add every exchange of `other` that the receiver cannot already
    /// resolve to the same URL.
    pub fn merge(&mut self, other: &Archive) -> Result<()> {
        let mut added = 0usize;
        let mut skipped = 0usize;
        let mut pending = Vec::new();
        other.for_each(|req, resp| {
            let duplicate = match self.find_request(&req) {
                Ok((found, _)) => found.uri().to_string() == req.uri().to_string(),
                Err(Error::NotFound) => false,
                Err(e) => return Err(e),
            };
            if duplicate {
                skipped += 1;
            } else {
                pending.push((req, resp));
            }
            Ok(())
        })?;
        for (req, resp) in &pending {
            self.add_archived_request(req, resp, AddMode::Append)?;
            added += 1;
        }
        info!(added, duplicates = skipped, "merged requests");
        Ok(())
    }

    /// Start a new replay session so chronological serving restarts from the
    /// first entry of every bucket.
    pub fn start_new_replay_session(&self) {
        self.current_session_id.fetch_add(1, Ordering::SeqCst);
    }

    fn copy(&self) -> Self {
        let mut requests: HashMap<String, HashMap<String, Vec<ArchivedRequest>>> = HashMap::new();
        for (host, url_map) in &self.requests {
            let copied = url_map
                .iter()
                .map(|(url, bucket)| {
                    (url.clone(), bucket.iter().map(ArchivedRequest::copy).collect())
                })
                .collect();
            requests.insert(host.clone(), copied);
        }
        Self {
            requests,
            certs: self.certs.clone(),
            negotiated_protocol: self.negotiated_protocol.clone(),
            remote_addresses: self.remote_addresses.clone(),
            deterministic_time_seed_ms: self.deterministic_time_seed_ms,
            serve_response_in_chronological_sequence: self
                .serve_response_in_chronological_sequence,
            current_session_id: AtomicU32::new(self.current_session_id.load(Ordering::SeqCst)),
        }
    }
}

/// A recording archive: an [`Archive`] plus the output path, with every
/// mutation serialized behind one mutex. The file is not written until
/// [`close`](WritableArchive::close).
pub struct WritableArchive {
    inner: Mutex<WritableInner>,
    path: PathBuf,
}

struct WritableInner {
    archive: Archive,
    open: bool,
}

impl WritableArchive {
    /// Create a writable archive that will flush to `path` on close. The
    /// path must be creatable now so misconfiguration fails at startup, not
    /// after a recording session.
    pub fn create<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        File::create(&path)
            .map_err(|e| Error::Config(format!("could not create {:?}: {e}", path)))?;
        Ok(Self {
            inner: Mutex::new(WritableInner {
                archive: Archive::new(),
                open: true,
            }),
            path,
        })
    }

    /// Record one exchange. This is the single commit point: the entry is
    /// either fully indexed or not present at all.
    pub fn record_request(&self, req: &Request<Bytes>, resp: &Response<Bytes>) -> Result<()> {
        let mut inner = self.lock()?;
        inner.archive.add_archived_request(req, resp, AddMode::Append)
    }

    /// Record the minted cert bytes and negotiated protocol for a host. The
    /// first cert recorded for a host wins; the protocol is always updated.
    pub fn record_tls_config(&self, host: &str, der: Vec<u8>, negotiated_protocol: &str) -> Result<()> {
        let mut inner = self.lock()?;
        inner
            .archive
            .certs
            .entry(host.to_string())
            .or_insert(der);
        inner
            .archive
            .negotiated_protocol
            .insert(host.to_string(), negotiated_protocol.to_string());
        Ok(())
    }

    /// The stored cert bytes and protocol for a host, if already recorded.
    pub fn find_host_tls_config(&self, host: &str) -> Result<Option<(Vec<u8>, String)>> {
        let inner = self.lock()?;
        Ok(inner
            .archive
            .find_host_tls_config(host)
            .map(|(der, proto)| (der.to_vec(), proto.to_string())))
    }

    /// Record the observed remote address for a host.
    pub fn record_remote_address(&self, host: &str, addr: &str) -> Result<()> {
        let mut inner = self.lock()?;
        inner
            .archive
            .remote_addresses
            .insert(host.to_string(), addr.to_string());
        Ok(())
    }

    /// Set the seed injected into client-side determinism scripts.
    pub fn set_deterministic_time_seed_ms(&self, seed: i64) -> Result<()> {
        let mut inner = self.lock()?;
        inner.archive.deterministic_time_seed_ms = seed;
        Ok(())
    }

    /// Read-only access to the archive under the mutex.
    pub fn with_archive<T>(&self, f: impl FnOnce(&Archive) -> T) -> Result<T> {
        let inner = self.lock()?;
        Ok(f(&inner.archive))
    }

    /// Flush the archive to its file and mark it closed. Closing twice is an
    /// error.
    pub fn close(&self) -> Result<()> {
        let mut inner = self.lock()?;
        if !inner.open {
            return Err(Error::Archive("already closed".into()));
        }
        inner.open = false;
        let file = File::create(&self.path)?;
        inner.archive.serialize(file)
    }

    /// Snapshot the current contents as a standalone archive (used by tests
    /// and by in-process record-then-replay flows).
    pub fn snapshot(&self) -> Result<Archive> {
        let inner = self.lock()?;
        Ok(inner.archive.copy())
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, WritableInner>> {
        self.inner
            .lock()
            .map_err(|_| Error::Archive("archive lock poisoned".into()))
    }
}
