use super::broker::Broker;
use super::protocol::{
    read_connect, read_packet, write_connack, write_pingresp, write_puback, write_publish,
    write_suback, write_unsuback, ConnectPacket, ConnectReturnCode, ControlPacket, ProtocolError,
    PublishPacket, Qos, SubAckResult, Will, LEGACY_PROTOCOL_LEVEL,
};
use super::subscriptions::{Delivery, SessionId};
use crate::audit;
use crate::config::BrokerConfig;
use crate::listeners::{ProtocolIo, ProtocolTransport};
use crate::security::{AuthError, Authenticator, ConnectClaims, Principal};
use crate::time::SharedClock;
use anyhow::Result;
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{mpsc, oneshot, watch};
use uuid::Uuid;

/// Time a client gets to send CONNECT after the transport is up.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    AwaitingConnect,
    Authenticating,
    Established,
    Closing,
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// CONNECT was refused with the given return code.
    Rejected(ConnectReturnCode),
    Clean,
    KeepAliveTimeout,
    ConnectionLost,
    ProtocolError(String),
    TakenOver,
    Shutdown,
}

impl CloseReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            CloseReason::Rejected(_) => "rejected",
            CloseReason::Clean => "clean",
            CloseReason::KeepAliveTimeout => "keep_alive_timeout",
            CloseReason::ConnectionLost => "connection_lost",
            CloseReason::ProtocolError(_) => "protocol_error",
            CloseReason::TakenOver => "taken_over",
            CloseReason::Shutdown => "shutdown",
        }
    }

    /// Whether an established session closing this way publishes its will.
    pub fn publishes_will(&self) -> bool {
        matches!(
            self,
            CloseReason::KeepAliveTimeout
                | CloseReason::ConnectionLost
                | CloseReason::ProtocolError(_)
                | CloseReason::Shutdown
        )
    }
}

#[derive(Debug, Clone)]
pub struct SessionOutcome {
    pub phase: SessionPhase,
    pub principal: Option<Principal>,
    pub reason: CloseReason,
}

/// Transport facts established before the first MQTT byte.
#[derive(Debug, Clone)]
pub struct ConnectionMeta {
    pub peer: SocketAddr,
    pub transport: ProtocolTransport,
    /// Subject CN of the client certificate the TLS layer verified.
    pub certificate_common_name: Option<String>,
}

#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub max_packet_size: usize,
    pub outbound_queue: usize,
    pub retry_base: Duration,
    pub retry_max: Duration,
}

impl From<&BrokerConfig> for SessionSettings {
    fn from(cfg: &BrokerConfig) -> Self {
        Self {
            max_packet_size: cfg.max_packet_size,
            outbound_queue: cfg.outbound_queue.max(1),
            retry_base: cfg.retry_base(),
            retry_max: cfg.retry_max(),
        }
    }
}

/// Shared collaborators every session needs.
pub struct SessionContext {
    pub broker: Arc<Broker>,
    pub authenticator: Arc<dyn Authenticator>,
    pub settings: SessionSettings,
    pub clock: SharedClock,
}

#[derive(Debug, Clone)]
pub struct OutboundTracking {
    pub delivery: Delivery,
    pub mid: u16,
    pub retry_at: Instant,
    pub retry_delay: Duration,
}

struct Established<'a> {
    ctx: &'a SessionContext,
    meta: &'a ConnectionMeta,
    peer: String,
    principal: Principal,
    id: SessionId,
    keep_alive: Option<Duration>,
    last_seen: Instant,
    filters: HashSet<String>,
    outbound: HashMap<u16, OutboundTracking>,
    next_mid: u16,
    delivery_tx: mpsc::Sender<Delivery>,
}

enum SessionAction {
    Continue,
    Close(CloseReason),
}

/// Drive one client connection from CONNECT to close.
pub async fn run_session(
    io: ProtocolIo,
    meta: ConnectionMeta,
    ctx: Arc<SessionContext>,
    mut shutdown: watch::Receiver<bool>,
) -> SessionOutcome {
    let peer = meta.peer.to_string();
    let (reader, mut writer) = tokio::io::split(io);
    let mut reader = reader;

    let connect = match tokio::time::timeout(
        CONNECT_TIMEOUT,
        read_connect(&mut reader, ctx.settings.max_packet_size),
    )
    .await
    {
        Ok(Ok(connect)) => connect,
        Ok(Err(err)) => return refuse_unreadable_connect(&mut writer, &peer, err).await,
        Err(_) => {
            tracing::debug!(%peer, "no CONNECT before timeout");
            return SessionOutcome {
                phase: SessionPhase::Closed,
                principal: None,
                reason: CloseReason::ProtocolError("connect timeout".into()),
            };
        }
    };

    let (principal, client_id) = match admit(&ctx, &meta, &peer, &connect) {
        Ok(admitted) => admitted,
        Err((code, claimed, message)) => {
            let _ = write_connack(&mut writer, false, code).await;
            let _ = writer.shutdown().await;
            tracing::info!(%peer, identity = %claimed, reason = code.as_str(), "CONNECT refused: {message}");
            audit::emit(
                "connect_rejected",
                &claimed,
                &peer,
                &format!("{}: {message}", code.as_str()),
            );
            return SessionOutcome {
                phase: SessionPhase::Closed,
                principal: None,
                reason: CloseReason::Rejected(code),
            };
        }
    };

    let id = ctx.broker.router().next_session_id();
    let takeover = ctx.broker.register_session(&principal, &client_id, id);
    if let Err(err) = write_connack(&mut writer, false, ConnectReturnCode::Accepted).await {
        ctx.broker.deregister_session(&principal, &client_id, id);
        tracing::debug!(%peer, "CONNACK write failed: {err:#}");
        return SessionOutcome {
            phase: SessionPhase::Closed,
            principal: Some(principal),
            reason: CloseReason::ConnectionLost,
        };
    }
    tracing::info!(
        %peer,
        identity = %principal,
        client_id = %client_id,
        transport = meta.transport.as_str(),
        keep_alive = connect.keep_alive,
        "MQTT CONNECT accepted"
    );
    audit::emit(
        "session_connected",
        &principal.to_string(),
        &peer,
        &format!("client_id={client_id} transport={}", meta.transport),
    );

    let (delivery_tx, delivery_rx) = mpsc::channel(ctx.settings.outbound_queue);
    let mut session = Established {
        ctx: &ctx,
        meta: &meta,
        peer: peer.clone(),
        principal: principal.clone(),
        id,
        keep_alive: (connect.keep_alive > 0)
            .then(|| Duration::from_millis(u64::from(connect.keep_alive) * 1500)),
        last_seen: ctx.clock.now(),
        filters: HashSet::new(),
        outbound: HashMap::new(),
        next_mid: 1,
        delivery_tx,
    };
    let mut will = connect.will;
    let reason = session
        .process(reader, &mut writer, delivery_rx, takeover, &mut shutdown, &mut will)
        .await;

    // Closing
    ctx.broker.router().remove_session(id, &session.filters);
    ctx.broker.deregister_session(&principal, &client_id, id);
    let _ = writer.shutdown().await;
    tracing::info!(
        %peer,
        identity = %principal,
        client_id = %client_id,
        reason = reason.as_str(),
        "MQTT session closed"
    );
    // Audited before the will is published.
    audit::emit(
        "session_closed",
        &principal.to_string(),
        &peer,
        reason.as_str(),
    );
    if reason.publishes_will() {
        if let Some(will) = will.take() {
            ctx.broker.publish_will(&principal, &will, &peer).await;
        }
    }
    SessionOutcome {
        phase: SessionPhase::Closed,
        principal: Some(principal),
        reason,
    }
}

async fn refuse_unreadable_connect(
    writer: &mut WriteHalf<ProtocolIo>,
    peer: &str,
    err: anyhow::Error,
) -> SessionOutcome {
    let reason = match err.downcast_ref::<ProtocolError>() {
        Some(ProtocolError::UnsupportedLevel(level)) => {
            if *level == LEGACY_PROTOCOL_LEVEL {
                tracing::warn!(
                    %peer,
                    "client speaks MQTT 3.1; configure it with \
                     {{\"_type\":\"configuration\",\"mqttProtocolLevel\":4}}"
                );
            }
            let code = ConnectReturnCode::UnacceptableProtocolVersion;
            let _ = write_connack(writer, false, code).await;
            audit::emit("connect_rejected", "-", peer, &format!("{}: {err}", code.as_str()));
            CloseReason::Rejected(code)
        }
        _ if is_disconnect(&err) => CloseReason::ConnectionLost,
        _ => {
            audit::emit("connect_rejected", "-", peer, &format!("protocol_error: {err:#}"));
            CloseReason::ProtocolError(format!("{err:#}"))
        }
    };
    let _ = writer.shutdown().await;
    tracing::debug!(%peer, "unreadable CONNECT: {err:#}");
    SessionOutcome {
        phase: SessionPhase::Closed,
        principal: None,
        reason,
    }
}

/// Authenticating: map CONNECT claims to a principal and a client id.
fn admit(
    ctx: &SessionContext,
    meta: &ConnectionMeta,
    peer: &str,
    connect: &ConnectPacket,
) -> Result<(Principal, String), (ConnectReturnCode, String, String)> {
    let claimed = meta
        .certificate_common_name
        .clone()
        .or_else(|| connect.username.clone())
        .unwrap_or_else(|| "-".to_string());
    let client_id = if connect.client_id.is_empty() {
        if !connect.clean_session {
            return Err((
                ConnectReturnCode::IdentifierRejected,
                claimed,
                "empty client id requires clean session".into(),
            ));
        }
        let generated = format!("locus-{}", Uuid::new_v4().simple());
        tracing::debug!(peer, assigned = %generated, "assigned client id");
        generated
    } else {
        connect.client_id.clone()
    };
    let claims = ConnectClaims {
        certificate_common_name: meta.certificate_common_name.as_deref(),
        username: connect.username.as_deref(),
        password: connect.password.as_deref(),
    };
    match ctx.authenticator.authenticate(&claims) {
        Ok(principal) => Ok((principal, client_id)),
        Err(err) => {
            let code = match err {
                AuthError::InvalidCredentials => ConnectReturnCode::BadUsernameOrPassword,
                AuthError::IdentityUnresolved(_)
                | AuthError::AnonymousRejected
                | AuthError::InvalidIdentity(_) => ConnectReturnCode::NotAuthorized,
            };
            Err((code, claimed, format!("{} ({err})", err.reason())))
        }
    }
}

impl Established<'_> {
    async fn process(
        &mut self,
        reader: ReadHalf<ProtocolIo>,
        writer: &mut WriteHalf<ProtocolIo>,
        mut delivery_rx: mpsc::Receiver<Delivery>,
        mut takeover: oneshot::Receiver<()>,
        shutdown: &mut watch::Receiver<bool>,
        will: &mut Option<Will>,
    ) -> CloseReason {
        // Reads run in their own task; a partially read frame must never be
        // dropped by select! picking another branch.
        let (inbound_tx, mut inbound_rx) = mpsc::channel::<Result<ControlPacket>>(1);
        let max_packet_size = self.ctx.settings.max_packet_size;
        let read_task = tokio::spawn(async move {
            let mut reader = reader;
            loop {
                let frame = read_packet(&mut reader, max_packet_size).await;
                let failed = frame.is_err();
                if inbound_tx.send(frame).await.is_err() || failed {
                    break;
                }
            }
        });

        let reason = loop {
            if *shutdown.borrow() {
                break CloseReason::Shutdown;
            }
            let deadline = self.next_deadline();
            tokio::select! {
                biased;
                _ = shutdown.changed() => break CloseReason::Shutdown,
                _ = &mut takeover => break CloseReason::TakenOver,
                frame = inbound_rx.recv() => {
                    let packet = match frame {
                        Some(Ok(packet)) => packet,
                        Some(Err(err)) if is_disconnect(&err) => break CloseReason::ConnectionLost,
                        Some(Err(err)) => {
                            tracing::info!(peer = %self.peer, "closing on protocol error: {err:#}");
                            break CloseReason::ProtocolError(format!("{err:#}"));
                        }
                        None => break CloseReason::ConnectionLost,
                    };
                    self.last_seen = self.ctx.clock.now();
                    match self.handle_packet(writer, packet, will).await {
                        Ok(SessionAction::Continue) => {}
                        Ok(SessionAction::Close(reason)) => break reason,
                        Err(err) => {
                            tracing::debug!(peer = %self.peer, "write failed: {err:#}");
                            break CloseReason::ConnectionLost;
                        }
                    }
                }
                Some(delivery) = delivery_rx.recv() => {
                    if let Err(err) = self.send_delivery(writer, delivery).await {
                        tracing::debug!(peer = %self.peer, "delivery failed: {err:#}");
                        break CloseReason::ConnectionLost;
                    }
                }
                _ = tokio::time::sleep_until(tokio::time::Instant::from_std(deadline)) => {
                    let now = self.ctx.clock.now();
                    if self
                        .keep_alive
                        .is_some_and(|ka| now >= self.last_seen + ka)
                    {
                        tracing::info!(peer = %self.peer, identity = %self.principal, "keep-alive expired");
                        break CloseReason::KeepAliveTimeout;
                    }
                    if let Err(err) = self.resend_outbound(writer, now).await {
                        tracing::debug!(peer = %self.peer, "redelivery failed: {err:#}");
                        break CloseReason::ConnectionLost;
                    }
                }
            }
        };
        read_task.abort();
        reason
    }

    fn next_deadline(&self) -> Instant {
        let keepalive = self.keep_alive.map(|ka| self.last_seen + ka);
        let retry = self.outbound.values().map(|t| t.retry_at).min();
        match (keepalive, retry) {
            (Some(a), Some(b)) => a.min(b),
            (Some(a), None) => a,
            (None, Some(b)) => b,
            (None, None) => self.ctx.clock.now() + Duration::from_secs(3600),
        }
    }

    async fn handle_packet(
        &mut self,
        writer: &mut WriteHalf<ProtocolIo>,
        packet: ControlPacket,
        will: &mut Option<Will>,
    ) -> Result<SessionAction> {
        match packet {
            ControlPacket::Publish(publish) => {
                self.handle_publish(writer, publish).await?;
            }
            ControlPacket::PubAck(mid) => {
                if self.outbound.remove(&mid).is_none() {
                    tracing::debug!(peer = %self.peer, mid, "PUBACK for unknown packet id");
                }
            }
            ControlPacket::PubRec(_) | ControlPacket::PubRel(_) | ControlPacket::PubComp(_) => {
                return Ok(SessionAction::Close(CloseReason::ProtocolError(
                    "QoS 2 flow is not supported".into(),
                )));
            }
            ControlPacket::Subscribe(subscribe) => {
                let mut grants = Vec::with_capacity(subscribe.filters.len());
                for request in subscribe.filters {
                    let filter = request.topic_filter;
                    match self.ctx.broker.subscribe(
                        &self.principal,
                        self.id,
                        &filter,
                        request.qos,
                        self.delivery_tx.clone(),
                    ) {
                        Ok(granted) => {
                            tracing::debug!(peer = %self.peer, %filter, ?granted, "subscribed");
                            self.filters.insert(filter);
                            grants.push(SubAckResult::Granted(granted));
                        }
                        Err(denied) => {
                            tracing::warn!(peer = %self.peer, "{denied}");
                            audit::emit(
                                "subscribe_denied",
                                &self.principal.to_string(),
                                &self.peer,
                                &filter,
                            );
                            grants.push(SubAckResult::Failure);
                        }
                    }
                }
                write_suback(writer, subscribe.packet_id, &grants).await?;
            }
            ControlPacket::Unsubscribe(unsubscribe) => {
                for filter in &unsubscribe.topics {
                    self.ctx.broker.router().unsubscribe(self.id, filter);
                    self.filters.remove(filter);
                }
                write_unsuback(writer, unsubscribe.packet_id).await?;
            }
            ControlPacket::PingReq => write_pingresp(writer).await?,
            ControlPacket::Disconnect => {
                will.take();
                return Ok(SessionAction::Close(CloseReason::Clean));
            }
        }
        Ok(SessionAction::Continue)
    }

    async fn handle_publish(
        &mut self,
        writer: &mut WriteHalf<ProtocolIo>,
        publish: PublishPacket,
    ) -> Result<()> {
        if publish.retain {
            tracing::debug!(peer = %self.peer, topic = %publish.topic, "retain flag ignored");
        }
        let result = self
            .ctx
            .broker
            .publish(
                &self.principal,
                &publish.topic,
                Arc::from(publish.payload),
                publish.qos,
                Some(self.id),
            )
            .await;
        if let Err(denied) = result {
            tracing::warn!(peer = %self.peer, transport = self.meta.transport.as_str(), "{denied}");
            audit::emit(
                "publish_denied",
                &self.principal.to_string(),
                &self.peer,
                &publish.topic,
            );
        }
        // Denied QoS 1 publishes are acknowledged too, or the client resends forever.
        if let Some(mid) = publish.message_id {
            write_puback(writer, mid).await?;
        }
        Ok(())
    }

    async fn send_delivery(
        &mut self,
        writer: &mut WriteHalf<ProtocolIo>,
        delivery: Delivery,
    ) -> Result<()> {
        if delivery.qos == Qos::AtMostOnce {
            return write_publish(
                writer,
                &delivery.topic,
                &delivery.payload,
                Qos::AtMostOnce,
                false,
                false,
                None,
            )
            .await;
        }
        let Some(mid) = self.allocate_mid() else {
            tracing::warn!(peer = %self.peer, "no free packet identifiers; dropping delivery");
            return Ok(());
        };
        write_publish(
            writer,
            &delivery.topic,
            &delivery.payload,
            Qos::AtLeastOnce,
            false,
            false,
            Some(mid),
        )
        .await?;
        let retry_delay = self.ctx.settings.retry_base;
        self.outbound.insert(
            mid,
            OutboundTracking {
                delivery,
                mid,
                retry_at: self.ctx.clock.now() + retry_delay,
                retry_delay,
            },
        );
        Ok(())
    }

    fn allocate_mid(&mut self) -> Option<u16> {
        for _ in 0..u16::MAX {
            let mid = self.next_mid;
            self.next_mid = self.next_mid.checked_add(1).unwrap_or(1);
            if !self.outbound.contains_key(&mid) {
                return Some(mid);
            }
        }
        None
    }

    /// Resend unacknowledged QoS 1 deliveries whose timer expired, doubling
    /// each one's delay up to the configured maximum.
    async fn resend_outbound(
        &mut self,
        writer: &mut WriteHalf<ProtocolIo>,
        now: Instant,
    ) -> Result<()> {
        let max = self.ctx.settings.retry_max;
        let mut due: Vec<u16> = self
            .outbound
            .values()
            .filter(|t| t.retry_at <= now)
            .map(|t| t.mid)
            .collect();
        due.sort_unstable();
        for mid in due {
            let Some(tracking) = self.outbound.get_mut(&mid) else {
                continue;
            };
            write_publish(
                writer,
                &tracking.delivery.topic,
                &tracking.delivery.payload,
                Qos::AtLeastOnce,
                false,
                true,
                Some(mid),
            )
            .await?;
            tracking.retry_delay = (tracking.retry_delay * 2).min(max);
            tracking.retry_at = now + tracking.retry_delay;
            tracing::debug!(peer = %self.peer, mid, "redelivered unacknowledged publish");
        }
        Ok(())
    }
}

/// True when the error means the peer went away rather than misbehaved.
pub fn is_disconnect(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| {
        cause.downcast_ref::<std::io::Error>().is_some_and(|e| {
            matches!(
                e.kind(),
                std::io::ErrorKind::UnexpectedEof
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::BrokenPipe
            )
        })
    })
}
