use crate::audit;
use crate::tls::{peer_common_name, HandshakeFailure, TlsTrust};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpStream;

/// Upper bound on a single TLS handshake.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// TLS edge of the secure listener.
///
/// Each accept takes the trust snapshot current at that moment, so a PKI
/// change during a handshake never mixes old and new trust state.
pub(crate) struct EdgeTlsEndpoint {
    trust: Arc<TlsTrust>,
}

pub(crate) struct EdgeAcceptedStream {
    pub stream: tokio_rustls::server::TlsStream<TcpStream>,
    pub peer_addr: SocketAddr,
    /// Subject CN of the verified client certificate.
    pub common_name: Option<String>,
    pub trust_generation: u64,
}

#[derive(Debug, Error)]
pub enum EdgeError {
    #[error("no TLS trust material loaded")]
    NoTrust,
    #[error("TLS handshake timed out")]
    Timeout,
    #[error("TLS handshake failed: {0}")]
    Handshake(HandshakeFailure),
}

impl EdgeError {
    pub fn reason(&self) -> &'static str {
        match self {
            EdgeError::NoTrust => "no_trust",
            EdgeError::Timeout => "timeout",
            EdgeError::Handshake(failure) => failure.reason(),
        }
    }
}

impl EdgeTlsEndpoint {
    pub fn new(trust: Arc<TlsTrust>) -> Self {
        Self { trust }
    }

    pub async fn accept(
        &self,
        stream: TcpStream,
        peer: SocketAddr,
    ) -> Result<EdgeAcceptedStream, EdgeError> {
        let snapshot = self.trust.snapshot().ok_or(EdgeError::NoTrust)?;
        let acceptor = tokio_rustls::TlsAcceptor::from(snapshot.config.clone());
        let tls_stream = match tokio::time::timeout(HANDSHAKE_TIMEOUT, acceptor.accept(stream)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(err)) => return Err(EdgeError::Handshake(HandshakeFailure::from_io(&err))),
            Err(_) => return Err(EdgeError::Timeout),
        };
        let (_, server_conn) = tls_stream.get_ref();
        let common_name = peer_common_name(server_conn);
        if common_name.is_none() && self.trust.requires_client_certificate() {
            // The verifier demands a certificate, so this only happens for a
            // certificate whose subject carries no CN.
            return Err(EdgeError::Handshake(HandshakeFailure::Other(
                "client certificate has no common name".into(),
            )));
        }
        Ok(EdgeAcceptedStream {
            stream: tls_stream,
            peer_addr: peer,
            common_name,
            trust_generation: snapshot.generation,
        })
    }
}

/// Log and audit a refused TLS connection.
pub(crate) fn audit_rejection(peer: SocketAddr, err: &EdgeError) {
    let peer = peer.to_string();
    match err {
        EdgeError::Handshake(HandshakeFailure::Io(detail)) => {
            tracing::debug!(%peer, "TLS handshake aborted: {detail}");
        }
        _ => tracing::warn!(%peer, reason = err.reason(), "TLS handshake rejected: {err}"),
    }
    audit::emit(
        "tls_handshake_rejected",
        "-",
        &peer,
        &format!("reason={} {err}", err.reason()),
    );
}
