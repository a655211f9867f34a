//! Common test harness utilities for integration tests.
//!
//! This module provides helpers for:
//! - Building a runtime on ephemeral ports with an in-memory record store
//! - Driving the broker with a minimal MQTT 3.1.1 client over TCP, TLS or WebSocket
//! - Waiting for asynchronous side effects

// Not all test files use all helpers; silence dead_code warnings for unused exports.
#![allow(dead_code)]

use locus::config::{Config, Secret};
use locus::domain::{InMemoryRecordStore, StaticUserDirectory};
use locus::listeners::{BoundPorts, WsByteStream, MQTT_SUBPROTOCOL};
use locus::pki::{FileMaterialStore, IssuedClientCertificate, KeySealer, PkiManager};
use locus::runtime::Runtime;
use locus::time::{system_clock, SharedClock};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use rustls::{ClientConfig, RootCertStore};
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::{HeaderValue, SEC_WEBSOCKET_PROTOCOL};

pub const ROOT: &str = "owntracks";
pub const READ_TIMEOUT: Duration = Duration::from_secs(5);

/// Config rooted in `dir`, listening on OS-assigned loopback ports.
pub fn test_config(dir: &TempDir) -> Config {
    let mut cfg = Config::default();
    cfg.broker.topic_root = ROOT.to_string();
    cfg.broker.retry_base_ms = 300;
    cfg.broker.retry_max_ms = 1_200;
    cfg.listeners.bind_host = "127.0.0.1".to_string();
    cfg.listeners.plain_port = 0;
    cfg.listeners.tls_port = 0;
    cfg.listeners.ws_port = 0;
    cfg.listeners.drain_grace_ms = 500;
    cfg.listeners.runtime_file = Some(dir.path().join("run").join("ports.json"));
    cfg.pki.store_path = dir.path().join("pki.json");
    cfg.pki.secret = Secret::new("integration-secret");
    cfg.pki.reload_interval_ms = 100;
    cfg.domain.journal_path = dir.path().join("journal.jsonl");
    cfg
}

/// Directory knowing alice by certificate and password, and bob by password.
/// Hashes use minimal Argon2 cost so logins stay fast in debug builds.
pub fn directory() -> StaticUserDirectory {
    let params = argon2::Params::new(1024, 1, 1, None).expect("argon2 params");
    let mut dir = StaticUserDirectory::with_params(params);
    dir.add_owner("alice", "alice");
    dir.set_password("alice", b"alice-pw").expect("hash alice");
    dir.set_password("bob", b"bob-pw").expect("hash bob");
    dir
}

pub struct Harness {
    pub runtime: Runtime,
    pub store: Arc<InMemoryRecordStore>,
    pub ports: BoundPorts,
    pub dir: TempDir,
}

impl Harness {
    pub async fn start() -> Self {
        Self::start_with(|_| {}).await
    }

    pub async fn start_with(configure: impl FnOnce(&mut Config)) -> Self {
        Self::start_with_clock(system_clock(), configure).await
    }

    pub async fn start_with_clock(clock: SharedClock, configure: impl FnOnce(&mut Config)) -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut cfg = test_config(&dir);
        configure(&mut cfg);
        let store = Arc::new(InMemoryRecordStore::new());
        let runtime = Runtime::new(cfg, store.clone(), Arc::new(directory()), clock, None)
            .expect("build runtime");
        let ports = runtime.start().await.expect("start runtime");
        Self {
            runtime,
            store,
            ports,
            dir,
        }
    }

    pub fn plain_port(&self) -> u16 {
        self.ports.plain_port.expect("plain listener running")
    }

    pub fn tls_port(&self) -> u16 {
        self.ports.tls_port.expect("tls listener running")
    }

    pub fn ws_port(&self) -> u16 {
        self.ports.ws_port.expect("websocket listener running")
    }

    /// A second manager over the broker's material store, as the CLI opens it.
    pub fn admin_pki(&self) -> PkiManager {
        let cfg = self.runtime.config();
        PkiManager::open(
            Arc::new(FileMaterialStore::new(cfg.pki.store_path.clone())),
            KeySealer::from_secret(cfg.pki.secret.expose()),
            system_clock(),
        )
        .expect("open pki store")
    }

    /// Issue a client certificate and package it for the TLS test client.
    pub fn issue(&self, identity: &str) -> ClientIdentity {
        let issued = self
            .runtime
            .pki()
            .issue_client_certificate(identity, 30, 256)
            .expect("issue client certificate");
        ClientIdentity::from_issued(&issued)
    }

    pub async fn stop(self) {
        self.runtime.shutdown().await;
    }
}

/// Certificate, key and trusted authority for a TLS client.
#[derive(Clone)]
pub struct ClientIdentity {
    pub serial: String,
    pub cert_pem: Option<String>,
    pub key_pem: Option<String>,
    pub ca_pem: String,
}

impl ClientIdentity {
    pub fn from_issued(issued: &IssuedClientCertificate) -> Self {
        Self {
            serial: issued.serial_number.clone(),
            cert_pem: Some(issued.cert_pem.clone()),
            key_pem: Some(issued.key_pem.to_string()),
            ca_pem: issued.authority_pem.clone(),
        }
    }

    /// Trust `ca_pem` but present no client certificate.
    pub fn anonymous(ca_pem: &str) -> Self {
        Self {
            serial: String::new(),
            cert_pem: None,
            key_pem: None,
            ca_pem: ca_pem.to_string(),
        }
    }

    fn client_config(&self) -> io::Result<ClientConfig> {
        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let mut roots = RootCertStore::empty();
        for cert in rustls_pemfile::certs(&mut self.ca_pem.as_bytes()) {
            roots.add(cert?).map_err(io::Error::other)?;
        }
        let builder = ClientConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()
            .map_err(io::Error::other)?
            .with_root_certificates(roots);
        match (&self.cert_pem, &self.key_pem) {
            (Some(cert), Some(key)) => {
                let chain: Vec<CertificateDer<'static>> =
                    rustls_pemfile::certs(&mut cert.as_bytes()).collect::<Result<_, _>>()?;
                let key: PrivateKeyDer<'static> = rustls_pemfile::private_key(&mut key.as_bytes())?
                    .ok_or_else(|| io::Error::other("no private key in PEM"))?;
                builder
                    .with_client_auth_cert(chain, key)
                    .map_err(io::Error::other)
            }
            _ => Ok(builder.with_no_client_auth()),
        }
    }
}

pub trait TestStream: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> TestStream for T {}

#[derive(Debug, Clone)]
pub struct ConnectOptions {
    pub client_id: String,
    pub keep_alive: u16,
    pub clean_session: bool,
    pub username: Option<String>,
    pub password: Option<Vec<u8>>,
    /// Topic, payload and QoS of the last will.
    pub will: Option<(String, Vec<u8>, u8)>,
    pub protocol_level: u8,
}

impl ConnectOptions {
    pub fn new(client_id: &str) -> Self {
        Self {
            client_id: client_id.to_string(),
            keep_alive: 60,
            clean_session: true,
            username: None,
            password: None,
            will: None,
            protocol_level: 4,
        }
    }

    pub fn credentials(mut self, username: &str, password: &[u8]) -> Self {
        self.username = Some(username.to_string());
        self.password = Some(password.to_vec());
        self
    }

    pub fn will(mut self, topic: &str, payload: &[u8], qos: u8) -> Self {
        self.will = Some((topic.to_string(), payload.to_vec(), qos));
        self
    }

    pub fn keep_alive(mut self, secs: u16) -> Self {
        self.keep_alive = secs;
        self
    }
}

#[derive(Debug, Clone)]
pub struct Frame {
    pub packet_type: u8,
    pub flags: u8,
    pub body: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct ReceivedPublish {
    pub topic: String,
    pub qos: u8,
    pub dup: bool,
    pub message_id: Option<u16>,
    pub payload: Vec<u8>,
}

/// Minimal MQTT 3.1.1 client framing packets by hand.
pub struct MqttClient {
    stream: Box<dyn TestStream>,
}

impl MqttClient {
    pub async fn tcp(port: u16) -> io::Result<Self> {
        let stream = TcpStream::connect(("127.0.0.1", port)).await?;
        stream.set_nodelay(true)?;
        Ok(Self {
            stream: Box::new(stream),
        })
    }

    pub async fn tls(port: u16, identity: &ClientIdentity) -> io::Result<Self> {
        let connector = TlsConnector::from(Arc::new(identity.client_config()?));
        let stream = TcpStream::connect(("127.0.0.1", port)).await?;
        let name = ServerName::try_from("localhost").map_err(io::Error::other)?;
        let tls = connector.connect(name, stream).await?;
        Ok(Self {
            stream: Box::new(tls),
        })
    }

    /// Upgrade to WebSocket offering the `mqtt` subprotocol.
    pub async fn ws(port: u16) -> io::Result<Self> {
        let mut request = format!("ws://127.0.0.1:{port}/mqtt")
            .into_client_request()
            .map_err(io::Error::other)?;
        request
            .headers_mut()
            .insert(SEC_WEBSOCKET_PROTOCOL, HeaderValue::from_static(MQTT_SUBPROTOCOL));
        let (ws, response) = tokio_tungstenite::connect_async(request)
            .await
            .map_err(io::Error::other)?;
        if response.headers().get(SEC_WEBSOCKET_PROTOCOL).map(HeaderValue::as_bytes)
            != Some(MQTT_SUBPROTOCOL.as_bytes())
        {
            return Err(io::Error::other("broker did not select the mqtt subprotocol"));
        }
        Ok(Self {
            stream: Box::new(WsByteStream::new(ws)),
        })
    }

    /// Send CONNECT and return the CONNACK return code.
    pub async fn connect(&mut self, opts: &ConnectOptions) -> io::Result<u8> {
        let mut flags = 0u8;
        if opts.clean_session {
            flags |= 0x02;
        }
        let mut payload = Vec::new();
        put_str(&mut payload, opts.client_id.as_bytes());
        if let Some((topic, message, qos)) = &opts.will {
            flags |= 0x04 | (*qos << 3);
            put_str(&mut payload, topic.as_bytes());
            put_str(&mut payload, message);
        }
        if let Some(username) = &opts.username {
            flags |= 0x80;
            put_str(&mut payload, username.as_bytes());
        }
        if let Some(password) = &opts.password {
            flags |= 0x40;
            put_str(&mut payload, password);
        }
        let mut body = Vec::new();
        let name: &[u8] = if opts.protocol_level == 3 { b"MQIsdp" } else { b"MQTT" };
        put_str(&mut body, name);
        body.push(opts.protocol_level);
        body.push(flags);
        body.extend_from_slice(&opts.keep_alive.to_be_bytes());
        body.extend(payload);
        self.send(0x10, &body).await?;
        let frame = self.read_frame().await?;
        if frame.packet_type != 2 || frame.body.len() != 2 {
            return Err(io::Error::other(format!("expected CONNACK, got {frame:?}")));
        }
        Ok(frame.body[1])
    }

    pub async fn publish(&mut self, topic: &str, payload: &[u8], qos: u8, mid: u16) -> io::Result<()> {
        let mut body = Vec::new();
        put_str(&mut body, topic.as_bytes());
        if qos > 0 {
            body.extend_from_slice(&mid.to_be_bytes());
        }
        body.extend_from_slice(payload);
        self.send(0x30 | (qos << 1), &body).await
    }

    /// Publish at QoS 1 and wait for the matching PUBACK.
    pub async fn publish_acked(&mut self, topic: &str, payload: &[u8], mid: u16) -> io::Result<()> {
        self.publish(topic, payload, 1, mid).await?;
        let frame = self.read_frame().await?;
        if frame.packet_type != 4 || frame.body != mid.to_be_bytes() {
            return Err(io::Error::other(format!("expected PUBACK {mid}, got {frame:?}")));
        }
        Ok(())
    }

    /// Subscribe and return the SUBACK return codes.
    pub async fn subscribe(&mut self, packet_id: u16, filters: &[(&str, u8)]) -> io::Result<Vec<u8>> {
        let mut body = packet_id.to_be_bytes().to_vec();
        for (filter, qos) in filters {
            put_str(&mut body, filter.as_bytes());
            body.push(*qos);
        }
        self.send(0x82, &body).await?;
        let frame = self.read_frame().await?;
        if frame.packet_type != 9 || frame.body[..2] != packet_id.to_be_bytes() {
            return Err(io::Error::other(format!("expected SUBACK, got {frame:?}")));
        }
        Ok(frame.body[2..].to_vec())
    }

    pub async fn unsubscribe(&mut self, packet_id: u16, filters: &[&str]) -> io::Result<()> {
        let mut body = packet_id.to_be_bytes().to_vec();
        for filter in filters {
            put_str(&mut body, filter.as_bytes());
        }
        self.send(0xA2, &body).await?;
        let frame = self.read_frame().await?;
        if frame.packet_type != 11 {
            return Err(io::Error::other(format!("expected UNSUBACK, got {frame:?}")));
        }
        Ok(())
    }

    pub async fn puback(&mut self, mid: u16) -> io::Result<()> {
        self.send(0x40, &mid.to_be_bytes()).await
    }

    pub async fn ping(&mut self) -> io::Result<()> {
        self.send(0xC0, &[]).await?;
        let frame = self.read_frame().await?;
        if frame.packet_type != 13 {
            return Err(io::Error::other(format!("expected PINGRESP, got {frame:?}")));
        }
        Ok(())
    }

    pub async fn disconnect(mut self) -> io::Result<()> {
        self.send(0xE0, &[]).await?;
        self.stream.shutdown().await
    }

    pub async fn expect_publish(&mut self) -> io::Result<ReceivedPublish> {
        let frame = self.read_frame().await?;
        if frame.packet_type != 3 {
            return Err(io::Error::other(format!("expected PUBLISH, got {frame:?}")));
        }
        let qos = (frame.flags >> 1) & 0x03;
        let topic_len = u16::from_be_bytes([frame.body[0], frame.body[1]]) as usize;
        let topic = String::from_utf8_lossy(&frame.body[2..2 + topic_len]).to_string();
        let mut idx = 2 + topic_len;
        let message_id = if qos > 0 {
            let mid = u16::from_be_bytes([frame.body[idx], frame.body[idx + 1]]);
            idx += 2;
            Some(mid)
        } else {
            None
        };
        Ok(ReceivedPublish {
            topic,
            qos,
            dup: frame.flags & 0x08 != 0,
            message_id,
            payload: frame.body[idx..].to_vec(),
        })
    }

    /// Assert that nothing arrives within `window`.
    pub async fn expect_silence(&mut self, window: Duration) -> bool {
        tokio::time::timeout(window, read_frame(&mut self.stream))
            .await
            .is_err()
    }

    /// True once the broker has closed the connection.
    pub async fn closed_by_broker(&mut self) -> bool {
        matches!(
            tokio::time::timeout(READ_TIMEOUT, read_frame(&mut self.stream)).await,
            Ok(Err(_))
        )
    }

    pub async fn read_frame(&mut self) -> io::Result<Frame> {
        tokio::time::timeout(READ_TIMEOUT, read_frame(&mut self.stream))
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "no frame from broker"))?
    }

    async fn send(&mut self, header: u8, body: &[u8]) -> io::Result<()> {
        let mut frame = vec![header];
        let mut len = body.len();
        loop {
            let mut byte = (len % 128) as u8;
            len /= 128;
            if len > 0 {
                byte |= 0x80;
            }
            frame.push(byte);
            if len == 0 {
                break;
            }
        }
        frame.extend_from_slice(body);
        self.stream.write_all(&frame).await?;
        self.stream.flush().await
    }
}

async fn read_frame(stream: &mut Box<dyn TestStream>) -> io::Result<Frame> {
    let first = stream.read_u8().await?;
    let mut multiplier = 1usize;
    let mut len = 0usize;
    loop {
        let byte = stream.read_u8().await?;
        len += (byte & 0x7F) as usize * multiplier;
        if byte & 0x80 == 0 {
            break;
        }
        multiplier *= 128;
    }
    let mut body = vec![0u8; len];
    stream.read_exact(&mut body).await?;
    Ok(Frame {
        packet_type: first >> 4,
        flags: first & 0x0F,
        body,
    })
}

fn put_str(buf: &mut Vec<u8>, value: &[u8]) {
    buf.extend_from_slice(&(value.len() as u16).to_be_bytes());
    buf.extend_from_slice(value);
}

/// Connect over TLS and complete CONNECT; errors cover both refused
/// handshakes and connections the broker drops right after.
pub async fn tls_session(port: u16, identity: &ClientIdentity, client_id: &str) -> io::Result<(MqttClient, u8)> {
    let mut client = MqttClient::tls(port, identity).await?;
    let code = client.connect(&ConnectOptions::new(client_id)).await?;
    Ok((client, code))
}

/// Poll `check` until it holds or five seconds pass.
pub async fn eventually<F>(mut check: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + READ_TIMEOUT;
    loop {
        if check() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}

pub fn audit_events(event_type: &str) -> Vec<locus::audit::AuditEvent> {
    locus::audit::snapshot()
        .into_iter()
        .filter(|e| e.event_type == event_type)
        .collect()
}
