// SPDX-FileCopyrightText: 2025 Alexandre Gomes Gaigalas <alganet@gmail.com>
//
// SPDX-License-Identifier: ISC

//! TLS broker: per-SNI server configurations signed by a local root CA.
//!
//! The broker answers one question: given the ServerName of a ClientHello,
//! what certificate chain, key and ALPN preference should the proxy present?
//! In replay mode the answer comes from the archive (or a freshly minted
//! dummy leaf); in record mode the real origin is dialed once per host to
//! harvest a certificate template and the negotiated protocol.
//!
//! Minted leaves reuse the root's key pair, so archived leaf DER can be
//! served later with nothing but the root key. The listener wires this up
//! through `tokio_rustls::LazyConfigAcceptor`: peek the ClientHello, call
//! [`TlsBroker::server_config`] with its server name, finish the handshake
//! with the returned config.

use crate::archive::{Archive, WritableArchive};
use crate::errors::{Error, Result};
use rcgen::{
    BasicConstraints, Certificate, CertificateParams, DistinguishedName, DnType,
    ExtendedKeyUsagePurpose, IsCa, KeyPair, KeyUsagePurpose, SanType, SerialNumber,
    PKCS_ECDSA_P256_SHA256,
};
use rand::RngCore;
use rustls::{Certificate as RustlsCertificate, ClientConfig, PrivateKey, ServerConfig};
use std::collections::HashMap;
use std::net::IpAddr;
use std::path::Path;
use std::sync::{Arc, Mutex};
use time::{Duration, OffsetDateTime};
use tracing::{info, warn};
use x509_parser::extensions::GeneralName;

/// Root CA material: the signing certificate plus both encodings the broker
/// needs (rcgen signer for minting, DER + key for rustls).
pub struct RootCa {
    signer: Certificate,
    cert_der: Vec<u8>,
    key_pem: String,
    key_der: PrivateKey,
}

impl RootCa {
    /// Load a root from a PEM X.509 cert/key pair on disk.
    pub async fn load(cert_path: &Path, key_path: &Path) -> Result<Self> {
        let cert_pem = tokio::fs::read_to_string(cert_path)
            .await
            .map_err(|e| Error::Config(format!("failed to read root cert {cert_path:?}: {e}")))?;
        let key_pem = tokio::fs::read_to_string(key_path)
            .await
            .map_err(|e| Error::Config(format!("failed to read root key {key_path:?}: {e}")))?;
        Self::from_pem(&cert_pem, &key_pem)
    }

    /// Reconstruct root material from PEM strings. The signer parameters are
    /// recovered from the certificate itself so minted leaves carry the real
    /// root subject as issuer.
    pub fn from_pem(cert_pem: &str, key_pem: &str) -> Result<Self> {
        let key_pair =
            KeyPair::from_pem(key_pem).map_err(|e| Error::Config(format!("bad root key: {e}")))?;
        let key_der = PrivateKey(key_pair.serialize_der());
        let params = CertificateParams::from_ca_cert_pem(cert_pem, key_pair)
            .map_err(|e| Error::Config(format!("bad root cert: {e}")))?;
        let signer = Certificate::from_params(params)?;

        let cert_der = rustls_pemfile::certs(&mut cert_pem.as_bytes())
            .map_err(|e| Error::Config(format!("bad root cert PEM: {e}")))?
            .into_iter()
            .next()
            .ok_or_else(|| Error::Config("no certificate in root PEM".into()))?;

        Ok(Self {
            signer,
            cert_der,
            key_pem: key_pem.to_string(),
            key_der,
        })
    }

    /// Generate a fresh self-signed root, returned as (cert PEM, key PEM).
    pub fn generate(common_name: &str) -> Result<(String, String)> {
        let mut params = CertificateParams::default();
        params.alg = &PKCS_ECDSA_P256_SHA256;
        params.is_ca = IsCa::Ca(BasicConstraints::Constrained(0));
        params.distinguished_name = DistinguishedName::new();
        params
            .distinguished_name
            .push(DnType::CommonName, common_name);
        params
            .distinguished_name
            .push(DnType::OrganizationName, "replay-http");
        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        let now = OffsetDateTime::now_utc();
        params.not_before = now - Duration::hours(24);
        params.not_after = now + Duration::days(3650);

        let cert = Certificate::from_params(params)?;
        let cert_pem = cert.serialize_pem()?;
        let key_pem = cert.serialize_private_key_pem();
        Ok((cert_pem, key_pem))
    }

    /// The root certificate in DER form, as read from the PEM.
    pub fn cert_der(&self) -> &[u8] {
        &self.cert_der
    }
}

/// Where per-host TLS material comes from.
pub enum BrokerMode {
    /// Serve archived certs and protocols; mint dummies for unknown hosts.
    Replay(Arc<Archive>),
    /// Harvest cert templates and ALPN from real origins, recording both.
    Record(Arc<WritableArchive>),
}

/// Per-SNI server-configuration source for the proxy listener.
pub struct TlsBroker {
    roots: Vec<RootCa>,
    mode: BrokerMode,
    cache: Mutex<HashMap<String, Arc<ServerConfig>>>,
    origin_port: u16,
}

impl TlsBroker {
    pub fn new(roots: Vec<RootCa>, mode: BrokerMode) -> Result<Self> {
        if roots.is_empty() {
            return Err(Error::Config("at least one root CA is required".into()));
        }
        Ok(Self {
            roots,
            mode,
            cache: Mutex::new(HashMap::new()),
            origin_port: 443,
        })
    }

    /// Override the origin port dialed while harvesting (tests).
    pub fn set_origin_port(&mut self, port: u16) {
        self.origin_port = port;
    }

    /// The server configuration for one ClientHello. `server_name` is the
    /// SNI value; rare legacy clients that send none are answered with the
    /// root certificates themselves.
    pub async fn server_config(&self, server_name: Option<&str>) -> Result<Arc<ServerConfig>> {
        let host = match server_name {
            Some(h) if !h.is_empty() => h,
            _ => return self.roots_config(),
        };

        if let Some(config) = self.cached(host) {
            return Ok(config);
        }

        let (der, protocol) = match &self.mode {
            BrokerMode::Replay(archive) => match archive.find_host_tls_config(host) {
                Some((der, protocol)) => (der.to_vec(), protocol.to_string()),
                None => (self.mint_leaves(host, None)?, "http/1.1".to_string()),
            },
            BrokerMode::Record(archive) => match archive.find_host_tls_config(host)? {
                Some((der, protocol)) => (der, protocol),
                None => {
                    let harvest = self.harvest_origin(host).await?;
                    let sans = origin_sans(&harvest.leaf_der).unwrap_or_else(|e| {
                        warn!(host, error = %e, "could not parse origin SANs");
                        Vec::new()
                    });
                    let der = self.mint_leaves(host, Some(&sans))?;
                    archive.record_tls_config(host, der.clone(), &harvest.protocol)?;
                    archive.record_remote_address(host, &harvest.remote_addr)?;
                    info!(host, protocol = %harvest.protocol, "recorded origin TLS config");
                    (der, harvest.protocol)
                }
            },
        };

        let config = self.build_server_config(&der, &protocol)?;
        self.cache
            .lock()
            .map_err(|_| Error::Tls("cert cache lock poisoned".into()))?
            .insert(host.to_string(), config.clone());
        Ok(config)
    }

    fn cached(&self, host: &str) -> Option<Arc<ServerConfig>> {
        self.cache.lock().ok()?.get(host).cloned()
    }

    /// Mint one leaf per root for `host` and return the concatenated DER.
    /// `template_sans` is `Some` for record-mode minting: the subject
    /// alternative names come from the origin certificate (when it had any)
    /// and the leaf carries the wider key usages recorded archives contain.
    fn mint_leaves(&self, host: &str, template_sans: Option<&[SanType]>) -> Result<Vec<u8>> {
        let mut concat = Vec::new();
        for root in &self.roots {
            let mut params = self.leaf_params(root, host)?;
            if let Some(sans) = template_sans {
                if !sans.is_empty() {
                    params.subject_alt_names = sans.to_vec();
                }
                params.key_usages = vec![
                    KeyUsagePurpose::KeyCertSign,
                    KeyUsagePurpose::KeyEncipherment,
                    KeyUsagePurpose::DigitalSignature,
                    KeyUsagePurpose::CrlSign,
                ];
                params.extended_key_usages = vec![
                    ExtendedKeyUsagePurpose::ClientAuth,
                    ExtendedKeyUsagePurpose::ServerAuth,
                ];
            }
            let leaf = Certificate::from_params(params)?;
            concat.extend(leaf.serialize_der_with_signer(&root.signer)?);
        }
        Ok(concat)
    }

    fn leaf_params(&self, root: &RootCa, host: &str) -> Result<CertificateParams> {
        let mut params = CertificateParams::default();
        params.alg = root.signer.get_params().alg;
        // The leaf reuses the root key pair; replay serves archived leaves
        // with the root's private key.
        params.key_pair = Some(
            KeyPair::from_pem(&root.key_pem)
                .map_err(|e| Error::Config(format!("bad root key: {e}")))?,
        );
        params.use_authority_key_identifier_extension = false;
        params.distinguished_name = DistinguishedName::new();
        params.distinguished_name.push(DnType::CommonName, host);

        let now = OffsetDateTime::now_utc();
        params.not_before = now - Duration::hours(24);
        params.not_after = now + Duration::days(360);

        let mut serial = [0u8; 20];
        rand::thread_rng().fill_bytes(&mut serial);
        params.serial_number = Some(SerialNumber::from_slice(&serial));

        params.key_usages = vec![
            KeyUsagePurpose::KeyEncipherment,
            KeyUsagePurpose::DigitalSignature,
        ];
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
        params.subject_alt_names = match host.parse::<IpAddr>() {
            Ok(ip) => vec![SanType::IpAddress(ip)],
            Err(_) => vec![SanType::DnsName(host.to_string())],
        };
        Ok(params)
    }

    fn build_server_config(&self, der_concat: &[u8], protocol: &str) -> Result<Arc<ServerConfig>> {
        let chain: Vec<RustlsCertificate> = split_der_certificates(der_concat)?
            .into_iter()
            .map(RustlsCertificate)
            .collect();
        let mut config = ServerConfig::builder()
            .with_safe_defaults()
            .with_no_client_auth()
            .with_single_cert(chain, self.roots[0].key_der.clone())?;
        config.alpn_protocols = alpn_preference(protocol);
        Ok(Arc::new(config))
    }

    fn roots_config(&self) -> Result<Arc<ServerConfig>> {
        let chain: Vec<RustlsCertificate> = self
            .roots
            .iter()
            .map(|r| RustlsCertificate(r.cert_der.clone()))
            .collect();
        let mut config = ServerConfig::builder()
            .with_safe_defaults()
            .with_no_client_auth()
            .with_single_cert(chain, self.roots[0].key_der.clone())?;
        config.alpn_protocols = alpn_preference("http/1.1");
        Ok(Arc::new(config))
    }

    /// Dial the real origin to harvest its leaf certificate and negotiated
    /// protocol. Unreachable origins propagate as a TLS error, failing the
    /// client-facing handshake.
    async fn harvest_origin(&self, host: &str) -> Result<OriginHarvest> {
        let addr = format!("{host}:{}", self.origin_port);
        let stream = tokio::net::TcpStream::connect(&addr)
            .await
            .map_err(|e| Error::Tls(format!("could not reach origin {addr}: {e}")))?;
        let remote_addr = stream
            .peer_addr()
            .map(|a| a.to_string())
            .unwrap_or_default();

        let config = insecure_client_config(&["h2", "http/1.1"]);
        let connector = tokio_rustls::TlsConnector::from(Arc::new(config));
        let server_name = rustls::ServerName::try_from(host)
            .map_err(|_| Error::Tls(format!("invalid server name {host}")))?;
        let tls = connector
            .connect(server_name, stream)
            .await
            .map_err(|e| Error::Tls(format!("origin handshake with {addr} failed: {e}")))?;

        let (_, conn) = tls.get_ref();
        let protocol = conn
            .alpn_protocol()
            .map(|p| String::from_utf8_lossy(p).into_owned())
            .unwrap_or_else(|| "http/1.1".to_string());
        let leaf_der = conn
            .peer_certificates()
            .and_then(|certs| certs.first())
            .map(|c| c.0.clone())
            .ok_or_else(|| Error::Tls(format!("origin {addr} sent no certificate")))?;

        Ok(OriginHarvest {
            leaf_der,
            protocol,
            remote_addr,
        })
    }
}

struct OriginHarvest {
    leaf_der: Vec<u8>,
    protocol: String,
    remote_addr: String,
}

/// The ALPN preference list for a recorded protocol.
fn alpn_preference(protocol: &str) -> Vec<Vec<u8>> {
    if protocol == "h2" {
        vec![b"h2".to_vec(), b"http/1.1".to_vec()]
    } else {
        vec![b"http/1.1".to_vec()]
    }
}

/// Split a concatenation of DER certificates into individual certs using
/// the ASN.1 length-prefix convention: tag 0x30 followed by a short-form
/// length, or 0x81/0x82 long-form lengths.
pub fn split_der_certificates(blob: &[u8]) -> Result<Vec<Vec<u8>>> {
    let mut certs = Vec::new();
    let mut at = 0usize;
    while at < blob.len() {
        let rest = &blob[at..];
        if rest.len() < 2 || rest[0] != 0x30 {
            return Err(Error::Tls("malformed DER certificate sequence".into()));
        }
        let (length, header_len) = match rest[1] {
            n if n < 0x80 => (n as usize, 2),
            0x81 => {
                if rest.len() < 3 {
                    return Err(Error::Tls("truncated DER length".into()));
                }
                (rest[2] as usize, 3)
            }
            0x82 => {
                if rest.len() < 4 {
                    return Err(Error::Tls("truncated DER length".into()));
                }
                (((rest[2] as usize) << 8) | rest[3] as usize, 4)
            }
            _ => return Err(Error::Tls("unsupported DER length form".into())),
        };
        let total = header_len + length;
        if rest.len() < total {
            return Err(Error::Tls("truncated DER certificate".into()));
        }
        certs.push(rest[..total].to_vec());
        at += total;
    }
    if certs.is_empty() {
        return Err(Error::Tls("empty DER certificate sequence".into()));
    }
    Ok(certs)
}

/// A client configuration that skips peer verification, used to harvest
/// origin certificates and to forward recorded traffic to origins whose
/// trust chain the recorder does not care about.
pub fn insecure_client_config(alpn: &[&str]) -> ClientConfig {
    let mut config = ClientConfig::builder()
        .with_safe_defaults()
        .with_custom_certificate_verifier(Arc::new(SkipVerification))
        .with_no_client_auth();
    config.alpn_protocols = alpn.iter().map(|p| p.as_bytes().to_vec()).collect();
    config
}

struct SkipVerification;

impl rustls::client::ServerCertVerifier for SkipVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &RustlsCertificate,
        _intermediates: &[RustlsCertificate],
        _server_name: &rustls::ServerName,
        _scts: &mut dyn Iterator<Item = &[u8]>,
        _ocsp_response: &[u8],
        _now: std::time::SystemTime,
    ) -> std::result::Result<rustls::client::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::ServerCertVerified::assertion())
    }
}

/// Extract the subject alternative names of an origin certificate for use
/// as a minting template.
fn origin_sans(der: &[u8]) -> Result<Vec<SanType>> {
    let (_, cert) = x509_parser::parse_x509_certificate(der)
        .map_err(|e| Error::Tls(format!("could not parse origin certificate: {e}")))?;
    let mut sans = Vec::new();
    if let Ok(Some(ext)) = cert.subject_alternative_name() {
        for name in &ext.value.general_names {
            match name {
                GeneralName::DNSName(dns) => sans.push(SanType::DnsName(dns.to_string())),
                GeneralName::IPAddress(bytes) => {
                    let ip: Option<IpAddr> = match bytes.len() {
                        4 => {
                            let mut b = [0u8; 4];
                            b.copy_from_slice(bytes);
                            Some(IpAddr::from(b))
                        }
                        16 => {
                            let mut b = [0u8; 16];
                            b.copy_from_slice(bytes);
                            Some(IpAddr::from(b))
                        }
                        _ => None,
                    };
                    if let Some(ip) = ip {
                        sans.push(SanType::IpAddress(ip));
                    }
                }
                _ => {}
            }
        }
    }
    Ok(sans)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_root() -> RootCa {
        let (cert_pem, key_pem) = RootCa::generate("replay-http test CA").unwrap();
        RootCa::from_pem(&cert_pem, &key_pem).unwrap()
    }

    fn replay_broker(archive: Archive) -> TlsBroker {
        TlsBroker::new(vec![test_root()], BrokerMode::Replay(Arc::new(archive))).unwrap()
    }

    #[test]
    fn split_der_handles_all_length_forms() {
        let short = {
            let mut v = vec![0x30, 0x02];
            v.extend_from_slice(&[0xaa, 0xbb]);
            v
        };
        let one_byte = {
            let mut v = vec![0x30, 0x81, 0x03];
            v.extend_from_slice(&[0xcc; 3]);
            v
        };
        let two_byte = {
            let mut v = vec![0x30, 0x82, 0x01, 0x00];
            v.extend_from_slice(&[0xdd; 256]);
            v
        };
        let mut blob = Vec::new();
        blob.extend_from_slice(&short);
        blob.extend_from_slice(&one_byte);
        blob.extend_from_slice(&two_byte);

        let certs = split_der_certificates(&blob).unwrap();
        assert_eq!(certs.len(), 3);
        assert_eq!(certs[0], short);
        assert_eq!(certs[1], one_byte);
        assert_eq!(certs[2], two_byte);
    }

    #[test]
    fn split_der_rejects_garbage() {
        assert!(split_der_certificates(&[]).is_err());
        assert!(split_der_certificates(&[0x31, 0x01, 0x00]).is_err());
        assert!(split_der_certificates(&[0x30, 0x05, 0x00]).is_err());
        assert!(split_der_certificates(&[0x30, 0x83, 0x00, 0x00, 0x00, 0x01, 0x00]).is_err());
    }

    #[test]
    fn generated_root_roundtrips_through_pem() {
        let (cert_pem, key_pem) = RootCa::generate("roundtrip CA").unwrap();
        assert!(cert_pem.contains("BEGIN CERTIFICATE"));
        let root = RootCa::from_pem(&cert_pem, &key_pem).unwrap();
        let (_, parsed) = x509_parser::parse_x509_certificate(root.cert_der()).unwrap();
        assert!(parsed.subject().to_string().contains("roundtrip CA"));
    }

    #[tokio::test]
    async fn replay_mints_dummy_leaf_for_unknown_host() {
        let broker = replay_broker(Archive::new());
        let config = broker.server_config(Some("example.com")).await.unwrap();
        assert_eq!(config.alpn_protocols, vec![b"http/1.1".to_vec()]);
        assert!(broker.cached("example.com").is_some());

        // The minted leaf names the host and is issued by the root.
        let der = broker.mint_leaves("example.com", None).unwrap();
        let leaves = split_der_certificates(&der).unwrap();
        assert_eq!(leaves.len(), 1);
        let (_, leaf) = x509_parser::parse_x509_certificate(&leaves[0]).unwrap();
        assert!(leaf.subject().to_string().contains("example.com"));
        assert!(leaf.issuer().to_string().contains("replay-http test CA"));
        let san = leaf.subject_alternative_name().unwrap().unwrap();
        assert!(matches!(
            san.value.general_names[0],
            GeneralName::DNSName("example.com")
        ));
    }

    #[tokio::test]
    async fn dummy_leaf_config_is_cached_per_host() {
        let broker = replay_broker(Archive::new());
        let first = broker.server_config(Some("example.com")).await.unwrap();
        let second = broker.server_config(Some("example.com")).await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));

        let other = broker.server_config(Some("example.org")).await.unwrap();
        assert!(!Arc::ptr_eq(&first, &other));
    }

    #[tokio::test]
    async fn ip_server_name_gets_ip_san() {
        let broker = replay_broker(Archive::new());
        let der = broker.mint_leaves("127.0.0.1", None).unwrap();
        let leaves = split_der_certificates(&der).unwrap();
        let (_, leaf) = x509_parser::parse_x509_certificate(&leaves[0]).unwrap();
        let san = leaf.subject_alternative_name().unwrap().unwrap();
        assert!(matches!(
            san.value.general_names[0],
            GeneralName::IPAddress(&[127, 0, 0, 1])
        ));
        let _ = broker;
    }

    #[tokio::test]
    async fn archived_h2_protocol_prefers_h2_alpn() {
        let mut archive = Archive::new();
        archive
            .negotiated_protocol
            .insert("example.com".into(), "h2".into());
        let broker = replay_broker(archive);
        let config = broker.server_config(Some("example.com")).await.unwrap();
        assert_eq!(
            config.alpn_protocols,
            vec![b"h2".to_vec(), b"http/1.1".to_vec()]
        );
    }

    #[tokio::test]
    async fn archived_cert_bytes_are_served_verbatim() {
        // Mint with the same root PEM pair that the serving broker loads;
        // archived leaves carry the root's public key, so this works.
        let (cert_pem, key_pem) = RootCa::generate("archive CA").unwrap();
        let minter = TlsBroker::new(
            vec![RootCa::from_pem(&cert_pem, &key_pem).unwrap()],
            BrokerMode::Replay(Arc::new(Archive::new())),
        )
        .unwrap();
        let der = minter.mint_leaves("archived.test", None).unwrap();

        let mut archive = Archive::new();
        archive.certs.insert("archived.test".into(), der.clone());
        archive
            .negotiated_protocol
            .insert("archived.test".into(), "h2".into());
        let broker = TlsBroker::new(
            vec![RootCa::from_pem(&cert_pem, &key_pem).unwrap()],
            BrokerMode::Replay(Arc::new(archive)),
        )
        .unwrap();
        let config = broker.server_config(Some("archived.test")).await.unwrap();
        assert_eq!(
            config.alpn_protocols,
            vec![b"h2".to_vec(), b"http/1.1".to_vec()]
        );
    }

    #[tokio::test]
    async fn empty_server_name_serves_the_roots() {
        let broker = replay_broker(Archive::new());
        let root_der = broker.roots[0].cert_der().to_vec();
        let config = broker.server_config(None).await.unwrap();
        assert_eq!(config.alpn_protocols, vec![b"http/1.1".to_vec()]);
        let (_, parsed) = x509_parser::parse_x509_certificate(&root_der).unwrap();
        assert!(parsed.subject().to_string().contains("replay-http test CA"));
    }

    #[test]
    fn no_roots_is_a_config_error() {
        let res = TlsBroker::new(vec![], BrokerMode::Replay(Arc::new(Archive::new())));
        assert!(matches!(res, Err(Error::Config(_))));
    }

    #[test]
    fn alpn_preference_lists() {
        assert_eq!(
            alpn_preference("h2"),
            vec![b"h2".to_vec(), b"http/1.1".to_vec()]
        );
        assert_eq!(alpn_preference("http/1.1"), vec![b"http/1.1".to_vec()]);
        assert_eq!(alpn_preference(""), vec![b"http/1.1".to_vec()]);
    }
}
