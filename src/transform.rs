// SPDX-FileCopyrightText: 2025 Alexandre Gomes Gaigalas <alganet@gmail.com>
//
// SPDX-License-Identifier: ISC

//! Response transformers: script injection, CSP rewriting, rule files.
//!
//! Transformers mutate a buffered response in place and are best-effort: the
//! web is wild, and a body that cannot be decoded or re-encoded is left
//! exactly as it was. Failures that do not depend on the response (a missing
//! script file, a bad rules file) are raised at construction time instead.

use crate::compress::{compress_body, decompress_body};
use crate::errors::{Error, Result};
use base64::{engine::general_purpose::URL_SAFE as BASE64_URL, Engine as _};
use bytes::Bytes;
use hyper::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_ENCODING, CONTENT_LENGTH, CONTENT_TYPE};
use hyper::{Request, Response, StatusCode};
use regex::bytes::Regex;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::Path;
use tracing::{debug, info, warn};

const CSP_HEADER: &str = "content-security-policy";

/// A response transformer. `transform` may inspect the request but must not
/// modify it, and in doubt should leave the response unchanged.
pub trait Transformer: Send + Sync {
    fn transform(&self, req: &Request<Bytes>, resp: &mut Response<Bytes>);
}

/// Apply every transformer in registration order.
pub fn apply_all(
    transformers: &[Box<dyn Transformer>],
    req: &Request<Bytes>,
    resp: &mut Response<Bytes>,
) {
    for t in transformers {
        t.transform(req, resp);
    }
}

/// Injects a script after the first `<head>`, `<html>` or `<!doctype html>`
/// tag of 200 `text/html` responses, propagating any CSP nonce and rewriting
/// the CSP so the injected script may execute.
#[derive(Debug)]
pub struct ScriptInjector {
    script: Vec<u8>,
    sha256: String,
    head_re: Regex,
    html_re: Regex,
    doctype_re: Regex,
}

impl ScriptInjector {
    /// Build an injector from script bytes, applying `replacements`
    /// (e.g. the deterministic time seed placeholder) first.
    pub fn new(script: &[u8], replacements: &HashMap<String, String>) -> Result<Self> {
        let mut script = script.to_vec();
        for (old, new) in replacements {
            script = replace_all(&script, old.as_bytes(), new.as_bytes());
        }
        // The sha256 may be needed in a CSP header to grant the injected
        // script execute permission.
        let digest = Sha256::digest(&script);
        let sha256 = BASE64_URL.encode(digest);
        Ok(Self {
            script,
            sha256,
            head_re: anchor_regex(r"(?is)^.*?(<!--.*-->)?.*?<head.*?>")?,
            html_re: anchor_regex(r"(?is)^.*?(<!--.*-->)?.*?<html.*?>")?,
            doctype_re: anchor_regex(r"(?is)^.*?(<!--.*-->)?.*?<!doctype html>")?,
        })
    }

    /// Build an injector from a script file.
    pub fn from_file<P: AsRef<Path>>(path: P, replacements: &HashMap<String, String>) -> Result<Self> {
        let script = std::fs::read(path.as_ref()).map_err(|e| {
            Error::Config(format!("could not read script {:?}: {e}", path.as_ref()))
        })?;
        Self::new(&script, replacements)
    }

    fn script_with_nonce(&self, nonce: &str) -> Vec<u8> {
        let mut tag = Vec::with_capacity(self.script.len() + 32);
        tag.extend_from_slice(b"<script");
        if !nonce.is_empty() {
            tag.extend_from_slice(b" nonce=\"");
            tag.extend_from_slice(nonce.as_bytes());
            tag.extend_from_slice(b"\"");
        }
        tag.push(b'>');
        tag.extend_from_slice(&self.script);
        tag.extend_from_slice(b"</script>");
        tag
    }

    fn insertion_point(&self, body: &[u8]) -> Option<usize> {
        self.head_re
            .find(body)
            .or_else(|| self.html_re.find(body))
            .or_else(|| self.doctype_re.find(body))
            .map(|m| m.end())
    }
}

impl Transformer for ScriptInjector {
    fn transform(&self, req: &Request<Bytes>, resp: &mut Response<Bytes>) {
        let content_type = resp
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_ascii_lowercase())
            .unwrap_or_default();
        if !content_type.starts_with("text/html") || resp.status() != StatusCode::OK {
            return;
        }

        // The last Content-Encoding value decides the coding.
        let ce = resp
            .headers()
            .get_all(CONTENT_ENCODING)
            .iter()
            .last()
            .and_then(|v| v.to_str().ok())
            .map(|s| s.trim().to_ascii_lowercase())
            .unwrap_or_default();
        let is_compressed = !ce.is_empty() && ce != "identity";

        let plain = if is_compressed {
            match decompress_body(&ce, resp.body()) {
                Ok(plain) => plain,
                Err(e) => {
                    // Possibly a coding the web supports but we do not.
                    // Leave the body as is.
                    warn!(url = %req.uri(), error = %e, "ScriptInjector: decompress failed");
                    return;
                }
            }
        } else {
            resp.body().to_vec()
        };

        if contains(&plain, &self.script) {
            debug!(url = %req.uri(), "ScriptInjector: already injected");
            return;
        }

        let Some(at) = self.insertion_point(&plain) else {
            debug!(url = %req.uri(), "ScriptInjector: no start tags found, skip injecting");
            return;
        };

        // If the CSP names a nonce, the injected script must carry it to be
        // allowed to execute.
        let nonce = csp_script_src_directive(resp.headers())
            .and_then(|d| nonce_from_script_src(&d))
            .unwrap_or_default();

        let tag = self.script_with_nonce(&nonce);
        let mut injected = Vec::with_capacity(plain.len() + tag.len());
        injected.extend_from_slice(&plain[..at]);
        injected.extend_from_slice(&tag);
        injected.extend_from_slice(&plain[at..]);

        let new_body = if is_compressed {
            match compress_body(&ce, &injected) {
                Ok((bytes, _)) => bytes,
                Err(e) => {
                    warn!(url = %req.uri(), error = %e, "ScriptInjector: recompress failed");
                    return;
                }
            }
        } else {
            injected
        };

        if resp.headers().contains_key(CONTENT_LENGTH) {
            let len = new_body.len().to_string();
            resp.headers_mut()
                .insert(CONTENT_LENGTH, len.parse().expect("decimal length"));
        }
        *resp.body_mut() = Bytes::from(new_body);

        transform_csp_header(resp.headers_mut(), &self.sha256);
        debug!(url = %req.uri(), "ScriptInjector: successfully injected");
    }
}

/// The `script-src` directive from any CSP header, falling back to
/// `default-src`. Sites may send several CSP headers; `script-src` is
/// preferred across all of them.
fn csp_script_src_directive(headers: &HeaderMap) -> Option<String> {
    for prefix in ["script-src", "default-src"] {
        for value in headers.get_all(CSP_HEADER) {
            let Ok(csp) = value.to_str() else { continue };
            for directive in csp.split(';') {
                let directive = directive.trim();
                if directive.starts_with(prefix) {
                    return Some(directive.to_string());
                }
            }
        }
    }
    None
}

/// The nonce token of a script-src directive, without the `'nonce-`/`'`
/// wrapping, or None if the directive carries no nonce.
fn nonce_from_script_src(directive: &str) -> Option<String> {
    for token in directive.trim().split(' ') {
        let token = token.trim();
        if let Some(rest) = token.strip_prefix("'nonce-") {
            return Some(rest.trim_end_matches('\'').to_string());
        }
    }
    None
}

/// Rewrite every Content-Security-Policy header so inline scripts may
/// execute. Directives that already name a nonce are left alone (the nonce
/// is propagated onto the injected tag instead).
fn transform_csp_header(headers: &mut HeaderMap, injected_script_sha256: &str) {
    let values: Vec<HeaderValue> = headers.get_all(CSP_HEADER).iter().cloned().collect();
    if values.is_empty() {
        return;
    }
    headers.remove(CSP_HEADER);
    for value in values {
        let updated = match value.to_str() {
            Ok(csp) => {
                let rewritten = updated_single_csp(csp, injected_script_sha256);
                HeaderValue::from_str(&rewritten).unwrap_or(value)
            }
            Err(_) => value,
        };
        headers.append(CSP_HEADER, updated);
    }
}

/// Update the script permissions of a single CSP string when needed; always
/// returns a CSP string.
fn updated_single_csp(csp: &str, injected_script_sha256: &str) -> String {
    if csp.is_empty() {
        return String::new();
    }
    // Prefer 'script-src'; update a 'default-src' only when no 'script-src'
    // exists.
    let mut directives: Vec<String> = csp.split(';').map(str::to_string).collect();
    let mut update_index = None;
    for (index, directive) in directives.iter().enumerate() {
        let directive = directive.trim();
        if directive.starts_with("script-src") || directive.starts_with("default-src") {
            update_index = Some(index);
            if directive.starts_with("script-src") {
                break;
            }
        }
    }
    let Some(update_index) = update_index else {
        return csp.to_string();
    };
    let update_directive = directives[update_index].clone();
    if nonce_from_script_src(&update_directive).is_some() {
        return csp.to_string();
    }

    let mut new_directive = String::new();
    let mut needs_unsafe_inline = true;
    let mut looking_for_sha = true;
    for token in update_directive.split(' ') {
        let token = token.trim();
        if token == "'unsafe-inline'" {
            needs_unsafe_inline = false;
        }
        // A CSP that names hashes only allows matching inline scripts, so
        // the injected script's hash joins the first sha block.
        if token.starts_with("'sha256-")
            || token.starts_with("'sha384-")
            || token.starts_with("'sha512-")
        {
            if looking_for_sha {
                looking_for_sha = false;
                new_directive.push_str("'sha256-");
                new_directive.push_str(injected_script_sha256);
                new_directive.push_str("' ");
            }
            needs_unsafe_inline = false;
        } else {
            looking_for_sha = true;
        }
        // 'none' would contradict the permissions added below.
        if token == "'none'" {
            continue;
        }
        new_directive.push_str(token);
        new_directive.push(' ');
    }
    if needs_unsafe_inline {
        new_directive.push_str("'unsafe-inline'");
    }

    directives[update_index] = new_directive;
    directives.join(";")
}

/// One rule of a rules file. Matches by exact `URL` xor `URLPattern` regex;
/// on match may append response headers, inject a script, or (validated but
/// not emitted) declare HTTP/2 pushes.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct TransformerRule {
    #[serde(rename = "URL")]
    pub url: String,
    #[serde(rename = "URLPattern")]
    pub url_pattern: String,
    #[serde(rename = "ExtraHeaders")]
    pub extra_headers: HashMap<String, Vec<String>>,
    #[serde(rename = "Push")]
    pub push: Vec<PushPromiseRule>,
    #[serde(rename = "InjectedScript")]
    pub injected_script: String,

    #[serde(skip)]
    url_re: Option<regex::Regex>,
    #[serde(skip)]
    script_injector: Option<ScriptInjector>,
}

/// A push declared by a rule. Kept for validation; PUSH_PROMISE emission is
/// not implemented.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct PushPromiseRule {
    #[serde(rename = "URL")]
    pub url: String,
    #[serde(rename = "Headers")]
    pub headers: HashMap<String, Vec<String>>,
}

impl TransformerRule {
    fn compile(&mut self) -> Result<()> {
        if self.url.is_empty() && self.url_pattern.is_empty() {
            return Err(Error::Config("rule missing URL or URLPattern".into()));
        }
        if !self.url.is_empty() && !self.url_pattern.is_empty() {
            return Err(Error::Config("rule has both URL and URLPattern".into()));
        }
        if !self.url_pattern.is_empty() {
            let re = regex::Regex::new(&self.url_pattern).map_err(|e| {
                Error::Config(format!("error compiling URLPattern {}: {e}", self.url_pattern))
            })?;
            self.url_re = Some(re);
        }
        if !self.injected_script.is_empty() {
            self.script_injector = Some(ScriptInjector::from_file(
                &self.injected_script,
                &HashMap::new(),
            )?);
        }
        if self.extra_headers.is_empty() && self.push.is_empty() && self.injected_script.is_empty()
        {
            return Err(Error::Config("rule has no effect".into()));
        }
        for p in &self.push {
            if p.url.is_empty() {
                return Err(Error::Config("push has empty URL".into()));
            }
            match url::Url::parse(&p.url) {
                Ok(u) if u.scheme() == "http" || u.scheme() == "https" => {}
                _ => return Err(Error::Config(format!("push has bad URL {}", p.url))),
            }
        }
        Ok(())
    }

    fn matches(&self, req: &Request<Bytes>) -> bool {
        let url = req.uri().to_string();
        if !self.url.is_empty() {
            return self.url == url;
        }
        self.url_re.as_ref().map_or(false, |re| re.is_match(&url))
    }
}

/// A transformer controlled by a JSON rules file.
#[derive(Debug)]
pub struct RuleBasedTransformer {
    rules: Vec<TransformerRule>,
}

impl RuleBasedTransformer {
    /// Load and validate a rules file: a JSON array of rules. Relative
    /// injected-script paths resolve against the rules file's directory.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read(path)
            .map_err(|e| Error::Config(format!("could not read rules {path:?}: {e}")))?;
        let mut rules: Vec<TransformerRule> = serde_json::from_slice(&raw)
            .map_err(|e| Error::Config(format!("rules decode failed: {e}")))?;

        let rules_dir = path.parent().unwrap_or_else(|| Path::new("."));
        for rule in &mut rules {
            if !rule.injected_script.is_empty() && !Path::new(&rule.injected_script).is_absolute() {
                rule.injected_script = rules_dir
                    .join(&rule.injected_script)
                    .to_string_lossy()
                    .into_owned();
            }
            rule.compile()?;
        }
        Ok(Self { rules })
    }

    pub fn rules(&self) -> &[TransformerRule] {
        &self.rules
    }
}

impl Transformer for RuleBasedTransformer {
    fn transform(&self, req: &Request<Bytes>, resp: &mut Response<Bytes>) {
        for rule in &self.rules {
            if !rule.matches(req) {
                continue;
            }
            info!(url = %req.uri(), extra_headers = rule.extra_headers.len(), "rule matched");
            for (name, values) in &rule.extra_headers {
                let Ok(name) = name.parse::<HeaderName>() else {
                    warn!(header = %name, "rule header name invalid, skipping");
                    continue;
                };
                for value in values {
                    match value.parse::<HeaderValue>() {
                        Ok(v) => {
                            resp.headers_mut().append(name.clone(), v);
                        }
                        Err(_) => warn!(header = %name, "rule header value invalid, skipping"),
                    }
                }
            }
            if let Some(injector) = &rule.script_injector {
                injector.transform(req, resp);
            }
        }
    }
}

fn anchor_regex(pattern: &str) -> Result<Regex> {
    Regex::new(pattern).map_err(|e| Error::Transform(format!("bad anchor pattern: {e}")))
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    if needle.is_empty() {
        return true;
    }
    haystack.windows(needle.len()).any(|w| w == needle)
}

fn replace_all(input: &[u8], old: &[u8], new: &[u8]) -> Vec<u8> {
    if old.is_empty() {
        return input.to_vec();
    }
    let mut out = Vec::with_capacity(input.len());
    let mut i = 0;
    while i < input.len() {
        if input[i..].starts_with(old) {
            out.extend_from_slice(new);
            i += old.len();
        } else {
            out.push(input[i]);
            i += 1;
        }
    }
    out
}
