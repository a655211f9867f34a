use crate::pki::{PkiError, PkiManager, TrustMaterial, TrustObserver};
use parking_lot::RwLock;
use rustls::server::{VerifierBuilderError, WebPkiClientVerifier};
use rustls::{CertificateError, RootCertStore, ServerConfig};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tokio_rustls::TlsAcceptor;

#[derive(Debug, Error)]
pub enum TlsError {
    #[error(transparent)]
    Pki(#[from] PkiError),
    #[error("rustls rejected listener material: {0}")]
    Rustls(#[from] rustls::Error),
    #[error("client verifier: {0}")]
    Verifier(#[from] VerifierBuilderError),
}

/// One consistent view of listener trust: the rustls config plus what it was
/// built from.
#[derive(Clone)]
pub struct TrustSnapshot {
    pub config: Arc<ServerConfig>,
    pub authority_fingerprint: String,
    pub server_fingerprint: String,
    pub generation: u64,
}

impl fmt::Debug for TrustSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TrustSnapshot")
            .field("authority_fingerprint", &self.authority_fingerprint)
            .field("server_fingerprint", &self.server_fingerprint)
            .field("generation", &self.generation)
            .finish()
    }
}

/// Keeps the TLS listener's verification context in step with PKI state.
///
/// Each accepted connection clones the current snapshot before its handshake
/// starts, so a rebuild never affects handshakes already in flight.
pub struct TlsTrust {
    require_client_certificate: bool,
    alpn: Vec<Vec<u8>>,
    current: RwLock<Option<TrustSnapshot>>,
}

impl TlsTrust {
    pub fn new(require_client_certificate: bool, alpn: &[String]) -> Self {
        Self {
            require_client_certificate,
            alpn: alpn.iter().map(|p| p.as_bytes().to_vec()).collect(),
            current: RwLock::new(None),
        }
    }

    pub fn requires_client_certificate(&self) -> bool {
        self.require_client_certificate
    }

    pub fn rebuild(&self, pki: &PkiManager) -> Result<(), TlsError> {
        let material = pki.trust_material()?;
        let authority_fingerprint = material.authority_fingerprint.clone();
        let server_fingerprint = material.server_fingerprint.clone();
        let config = build_server_config(material, self.require_client_certificate, &self.alpn)?;
        let mut guard = self.current.write();
        let generation = guard.as_ref().map_or(1, |s| s.generation + 1);
        *guard = Some(TrustSnapshot {
            config: Arc::new(config),
            authority_fingerprint,
            server_fingerprint,
            generation,
        });
        tracing::info!(generation, "reloaded TLS listener trust");
        Ok(())
    }

    pub fn snapshot(&self) -> Option<TrustSnapshot> {
        self.current.read().clone()
    }

    pub fn acceptor(&self) -> Option<TlsAcceptor> {
        self.current
            .read()
            .as_ref()
            .map(|s| TlsAcceptor::from(s.config.clone()))
    }
}

impl TrustObserver for TlsTrust {
    fn trust_changed(&self, pki: &PkiManager) {
        if let Err(err) = self.rebuild(pki) {
            tracing::warn!("keeping previous TLS trust snapshot: {err}");
        }
    }
}

/// Server config that trusts only the active authority and enforces its
/// revocation list.
pub fn build_server_config(
    material: TrustMaterial,
    require_client_certificate: bool,
    alpn: &[Vec<u8>],
) -> Result<ServerConfig, TlsError> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let mut roots = RootCertStore::empty();
    roots.add(material.authority)?;
    let mut verifier = WebPkiClientVerifier::builder_with_provider(Arc::new(roots), provider.clone());
    if let Some(crl) = material.crl {
        verifier = verifier.with_crls(vec![crl]);
    }
    if !require_client_certificate {
        verifier = verifier.allow_unauthenticated();
    }
    let verifier = verifier.build()?;
    let mut cfg = ServerConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()?
        .with_client_cert_verifier(verifier)
        .with_single_cert(material.server_chain, material.server_key)?;
    cfg.alpn_protocols = alpn.to_vec();
    cfg.max_early_data_size = 0;
    Ok(cfg)
}

/// Why a TLS handshake was refused.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandshakeFailure {
    Revoked,
    Expired,
    UntrustedChain,
    MissingClientCertificate,
    ProtocolMismatch,
    Io(String),
    Other(String),
}

impl HandshakeFailure {
    pub fn reason(&self) -> &'static str {
        match self {
            HandshakeFailure::Revoked => "revoked",
            HandshakeFailure::Expired => "expired",
            HandshakeFailure::UntrustedChain => "untrusted_chain",
            HandshakeFailure::MissingClientCertificate => "missing_client_certificate",
            HandshakeFailure::ProtocolMismatch => "protocol_mismatch",
            HandshakeFailure::Io(_) => "io",
            HandshakeFailure::Other(_) => "other",
        }
    }

    /// Classify the error returned by `TlsAcceptor::accept`.
    pub fn from_io(err: &std::io::Error) -> Self {
        match err
            .get_ref()
            .and_then(|inner| inner.downcast_ref::<rustls::Error>())
        {
            Some(tls) => Self::from_tls(tls),
            None => HandshakeFailure::Io(err.to_string()),
        }
    }

    pub fn from_tls(err: &rustls::Error) -> Self {
        match err {
            rustls::Error::InvalidCertificate(cert) => match cert {
                CertificateError::Revoked => HandshakeFailure::Revoked,
                CertificateError::Expired | CertificateError::NotValidYet => {
                    HandshakeFailure::Expired
                }
                other => {
                    // Newer rustls reports validity failures with context variants.
                    let debug = format!("{other:?}");
                    if debug.contains("Expired") || debug.contains("NotValidYet") {
                        HandshakeFailure::Expired
                    } else {
                        HandshakeFailure::UntrustedChain
                    }
                }
            },
            rustls::Error::NoCertificatesPresented => HandshakeFailure::MissingClientCertificate,
            rustls::Error::PeerIncompatible(_)
            | rustls::Error::PeerMisbehaved(_)
            | rustls::Error::InvalidMessage(_)
            | rustls::Error::NoApplicationProtocol => HandshakeFailure::ProtocolMismatch,
            other => HandshakeFailure::Other(other.to_string()),
        }
    }
}

impl fmt::Display for HandshakeFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HandshakeFailure::Io(detail) | HandshakeFailure::Other(detail) => {
                write!(f, "{}: {detail}", self.reason())
            }
            _ => f.write_str(self.reason()),
        }
    }
}

/// Subject common name of the verified client certificate, if one was presented.
pub fn peer_common_name(conn: &rustls::ServerConnection) -> Option<String> {
    let leaf = conn.peer_certificates()?.first()?;
    let (_, cert) = x509_parser::parse_x509_certificate(leaf.as_ref()).ok()?;
    let cn = cert.subject().iter_common_name().next()?;
    cn.as_str().ok().map(str::to_string)
}
