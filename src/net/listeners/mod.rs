//! Plaintext, TLS and WebSocket MQTT listeners.
//!
//! Each listener moves through `Stopped → Starting → Listening → Draining →
//! Stopped`. Accepted connections are handed to MQTT sessions, which are
//! tracked so shutdown can give them a bounded grace period.

pub mod edge;
pub mod protocol;
pub mod websocket;

pub use edge::{EdgeError, HANDSHAKE_TIMEOUT};
pub use protocol::{ProtocolIo, ProtocolStream, ProtocolTransport};
pub use websocket::{WsByteStream, MQTT_SUBPROTOCOL};

use self::edge::EdgeTlsEndpoint;
use crate::config::{ListenerConfig, PortSetting};
use crate::mqtt::{run_session, ConnectionMeta, SessionContext};
use crate::tls::TlsTrust;
use anyhow::Context;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerState {
    Stopped,
    Starting,
    Listening,
    Draining,
}

#[derive(Debug, Error)]
pub enum ListenerError {
    /// Another process holds the port; retrying later may succeed.
    #[error("port {port} is unavailable")]
    PortUnavailable {
        port: u16,
        #[source]
        source: io::Error,
    },
    #[error("failed to bind {addr}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },
    #[error("TLS listener unavailable: {0}")]
    Tls(String),
    #[error(transparent)]
    Config(#[from] anyhow::Error),
}

impl ListenerError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, ListenerError::PortUnavailable { .. })
    }
}

/// Ports actually bound, as published to the runtime file.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoundPorts {
    pub plain_port: Option<u16>,
    pub tls_port: Option<u16>,
    #[serde(default)]
    pub ws_port: Option<u16>,
}

struct ListenerSlot {
    state: ListenerState,
    addr: Option<SocketAddr>,
    accept_task: Option<JoinHandle<()>>,
}

impl Default for ListenerSlot {
    fn default() -> Self {
        Self {
            state: ListenerState::Stopped,
            addr: None,
            accept_task: None,
        }
    }
}

type SessionSet = Arc<Mutex<JoinSet<()>>>;

/// What sits between an accepted socket and the MQTT session.
#[derive(Clone)]
enum Edge {
    Plain,
    Tls(Arc<EdgeTlsEndpoint>),
    WebSocket,
}

pub struct ListenerManager {
    cfg: ListenerConfig,
    ctx: Arc<SessionContext>,
    trust: Arc<TlsTrust>,
    shutdown: watch::Sender<bool>,
    sessions: SessionSet,
    slots: Mutex<HashMap<ProtocolTransport, ListenerSlot>>,
}

impl ListenerManager {
    pub fn new(cfg: ListenerConfig, ctx: Arc<SessionContext>, trust: Arc<TlsTrust>) -> Self {
        let (shutdown, _) = watch::channel(false);
        let mut slots = HashMap::new();
        slots.insert(ProtocolTransport::Tcp, ListenerSlot::default());
        slots.insert(ProtocolTransport::Tls, ListenerSlot::default());
        slots.insert(ProtocolTransport::WebSocket, ListenerSlot::default());
        Self {
            cfg,
            ctx,
            trust,
            shutdown,
            sessions: Arc::new(Mutex::new(JoinSet::new())),
            slots: Mutex::new(slots),
        }
    }

    /// Start every enabled listener. A listener that fails to bind leaves the
    /// others running; the first failure is returned.
    pub async fn start(&self) -> Result<BoundPorts, ListenerError> {
        self.shutdown.send_replace(false);
        let mut first_error = None;
        for (transport, setting) in [
            (ProtocolTransport::Tcp, self.cfg.plain()?),
            (ProtocolTransport::Tls, self.cfg.tls()?),
            (ProtocolTransport::WebSocket, self.cfg.ws()?),
        ] {
            if setting == PortSetting::Disabled {
                tracing::info!(transport = transport.as_str(), "listener disabled");
                continue;
            }
            if let Err(err) = self.start_listener(transport, setting).await {
                tracing::error!(transport = transport.as_str(), "listener failed to start: {err}");
                first_error.get_or_insert(err);
            }
        }
        let ports = self.bound_ports();
        self.write_runtime_file(&ports);
        match first_error {
            Some(err) => Err(err),
            None => Ok(ports),
        }
    }

    async fn start_listener(
        &self,
        transport: ProtocolTransport,
        setting: PortSetting,
    ) -> Result<u16, ListenerError> {
        let Some(port) = setting.bind_port() else {
            return Err(ListenerError::Config(anyhow::anyhow!(
                "{transport} listener is disabled"
            )));
        };
        let edge = match transport {
            ProtocolTransport::Tcp => Edge::Plain,
            ProtocolTransport::Tls => {
                if self.trust.snapshot().is_none() {
                    return Err(ListenerError::Tls("no server certificate is active".into()));
                }
                Edge::Tls(Arc::new(EdgeTlsEndpoint::new(self.trust.clone())))
            }
            ProtocolTransport::WebSocket => Edge::WebSocket,
        };
        self.set_state(transport, ListenerState::Starting, None);
        let addr = format!("{}:{port}", self.cfg.bind_host);
        let listener = match TcpListener::bind(&addr).await {
            Ok(listener) => listener,
            Err(source) => {
                self.set_state(transport, ListenerState::Stopped, None);
                return Err(if source.kind() == io::ErrorKind::AddrInUse {
                    ListenerError::PortUnavailable { port, source }
                } else {
                    ListenerError::Bind { addr, source }
                });
            }
        };
        let local = listener
            .local_addr()
            .map_err(|source| ListenerError::Bind { addr, source })?;
        tracing::info!(transport = transport.as_str(), "MQTT listener bound on {local}");
        let task = tokio::spawn(accept_loop(
            listener,
            transport,
            edge,
            self.ctx.clone(),
            self.sessions.clone(),
            self.shutdown.subscribe(),
        ));
        let mut slots = self.slots.lock();
        let slot = slots.entry(transport).or_default();
        slot.state = ListenerState::Listening;
        slot.addr = Some(local);
        slot.accept_task = Some(task);
        Ok(local.port())
    }

    /// Stop accepting, give sessions the drain grace to finish, then abort
    /// whatever is left.
    pub async fn stop(&self) {
        let accept_tasks: Vec<JoinHandle<()>> = {
            let mut slots = self.slots.lock();
            slots
                .values_mut()
                .filter_map(|slot| {
                    if slot.state == ListenerState::Listening {
                        slot.state = ListenerState::Draining;
                    }
                    slot.accept_task.take()
                })
                .collect()
        };
        self.shutdown.send_replace(true);
        for task in accept_tasks {
            let _ = task.await;
        }
        let mut sessions = std::mem::take(&mut *self.sessions.lock());
        let in_flight = sessions.len();
        let grace = self.cfg.drain_grace();
        let drained = tokio::time::timeout(grace, async {
            while sessions.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            tracing::warn!(
                remaining = sessions.len(),
                "drain grace of {grace:?} elapsed; aborting sessions"
            );
            sessions.abort_all();
            while sessions.join_next().await.is_some() {}
        }
        {
            let mut slots = self.slots.lock();
            for slot in slots.values_mut() {
                slot.state = ListenerState::Stopped;
                slot.addr = None;
            }
        }
        self.remove_runtime_file();
        tracing::info!(in_flight, "listeners stopped");
    }

    pub fn state(&self, transport: ProtocolTransport) -> ListenerState {
        self.slots
            .lock()
            .get(&transport)
            .map_or(ListenerState::Stopped, |s| s.state)
    }

    pub fn local_addr(&self, transport: ProtocolTransport) -> Option<SocketAddr> {
        self.slots.lock().get(&transport).and_then(|s| s.addr)
    }

    pub fn bound_ports(&self) -> BoundPorts {
        BoundPorts {
            plain_port: self.local_addr(ProtocolTransport::Tcp).map(|a| a.port()),
            tls_port: self.local_addr(ProtocolTransport::Tls).map(|a| a.port()),
            ws_port: self
                .local_addr(ProtocolTransport::WebSocket)
                .map(|a| a.port()),
        }
    }

    /// Connections currently handshaking or running a session.
    pub fn active_sessions(&self) -> usize {
        self.sessions.lock().len()
    }

    fn set_state(&self, transport: ProtocolTransport, state: ListenerState, addr: Option<SocketAddr>) {
        let mut slots = self.slots.lock();
        let slot = slots.entry(transport).or_default();
        slot.state = state;
        slot.addr = addr;
    }

    fn write_runtime_file(&self, ports: &BoundPorts) {
        let Some(path) = &self.cfg.runtime_file else {
            return;
        };
        if let Err(err) = write_ports(path, ports) {
            tracing::warn!(path = %path.display(), "failed to write runtime file: {err:#}");
        }
    }

    fn remove_runtime_file(&self) {
        if let Some(path) = &self.cfg.runtime_file {
            match std::fs::remove_file(path) {
                Ok(()) => {}
                Err(err) if err.kind() == io::ErrorKind::NotFound => {}
                Err(err) => tracing::warn!(path = %path.display(), "failed to remove runtime file: {err}"),
            }
        }
    }
}

fn write_ports(path: &Path, ports: &BoundPorts) -> anyhow::Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("create {}", parent.display()))?;
    }
    let body = serde_json::to_vec_pretty(ports)?;
    std::fs::write(path, body).with_context(|| format!("write {}", path.display()))?;
    Ok(())
}

async fn accept_loop(
    listener: TcpListener,
    transport: ProtocolTransport,
    edge: Edge,
    ctx: Arc<SessionContext>,
    sessions: SessionSet,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        if *shutdown.borrow() {
            break;
        }
        let (stream, peer) = tokio::select! {
            biased;
            _ = shutdown.changed() => break,
            accepted = listener.accept() => match accepted {
                Ok(pair) => pair,
                Err(err) => {
                    tracing::warn!("{transport} accept error: {err:?}");
                    continue;
                }
            },
        };
        if let Err(err) = stream.set_nodelay(true) {
            tracing::debug!(%peer, "set_nodelay failed: {err}");
        }
        let ctx = ctx.clone();
        let edge = edge.clone();
        let session_shutdown = shutdown.clone();
        let task = async move {
            let (io, certificate_common_name): (ProtocolIo, Option<String>) = match edge {
                Edge::Plain => (Box::new(stream), None),
                Edge::WebSocket => {
                    match tokio::time::timeout(HANDSHAKE_TIMEOUT, websocket::accept(stream)).await {
                        Ok(Ok(ws)) => (Box::new(ws), None),
                        Ok(Err(err)) => {
                            tracing::debug!(%peer, "WebSocket upgrade failed: {err}");
                            return;
                        }
                        Err(_) => {
                            tracing::debug!(%peer, "WebSocket upgrade timed out");
                            return;
                        }
                    }
                }
                Edge::Tls(endpoint) => match endpoint.accept(stream, peer).await {
                    Ok(accepted) => {
                        tracing::debug!(
                            peer = %accepted.peer_addr,
                            generation = accepted.trust_generation,
                            common_name = accepted.common_name.as_deref().unwrap_or("-"),
                            "TLS handshake complete"
                        );
                        (Box::new(accepted.stream), accepted.common_name)
                    }
                    Err(err) => {
                        edge::audit_rejection(peer, &err);
                        return;
                    }
                },
            };
            let meta = ConnectionMeta {
                peer,
                transport,
                certificate_common_name,
            };
            let outcome = run_session(io, meta, ctx, session_shutdown).await;
            tracing::debug!(%peer, reason = outcome.reason.as_str(), "connection finished");
        };
        let mut set = sessions.lock();
        while set.try_join_next().is_some() {}
        set.spawn(task);
        drop(set);
    }
    tracing::info!("{transport} listener stopped accepting");
}
