use super::protocol::{Qos, Will};
use super::subscriptions::{Delivery, SessionId, SubscriptionRouter};
use crate::audit;
use crate::messaging::{MessageSink, RoutedMessage};
use crate::security::{Authorizer, NotAuthorized, Principal};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};

struct LiveSession {
    id: SessionId,
    takeover: oneshot::Sender<()>,
}

/// Authorization-gated publish/subscribe shared by every session and by
/// server-side publishers.
pub struct Broker {
    authorizer: Arc<dyn Authorizer>,
    sink: Arc<dyn MessageSink>,
    router: SubscriptionRouter,
    live: Mutex<HashMap<(String, String), LiveSession>>,
}

impl Broker {
    pub fn new(authorizer: Arc<dyn Authorizer>, sink: Arc<dyn MessageSink>) -> Self {
        Self {
            authorizer,
            sink,
            router: SubscriptionRouter::new(),
            live: Mutex::new(HashMap::new()),
        }
    }

    pub fn router(&self) -> &SubscriptionRouter {
        &self.router
    }

    /// Authorize, hand to the sink, then fan out. The returned future
    /// completes only after the sink has finished with the message.
    pub async fn publish(
        &self,
        principal: &Principal,
        topic: &str,
        payload: Arc<[u8]>,
        qos: Qos,
        origin: Option<SessionId>,
    ) -> Result<usize, NotAuthorized> {
        self.authorizer.authorize_publish(principal, topic)?;
        let message = RoutedMessage {
            topic: topic.to_string(),
            payload,
            qos: qos.capped(),
            publisher: principal.clone(),
        };
        let delivered = self.router.route(&message, origin);
        self.sink.deliver(&message).await;
        tracing::trace!(%principal, topic, delivered, "routed publish");
        Ok(delivered)
    }

    /// Publish a departed session's last-will on its behalf.
    pub async fn publish_will(&self, principal: &Principal, will: &Will, peer: &str) -> bool {
        let payload: Arc<[u8]> = Arc::from(will.payload.as_slice());
        match self
            .publish(principal, &will.topic, payload, will.qos, None)
            .await
        {
            Ok(delivered) => {
                audit::emit(
                    "will_published",
                    &principal.to_string(),
                    peer,
                    &format!("{} ({delivered} subscribers)", will.topic),
                );
                true
            }
            Err(denied) => {
                audit::emit(
                    "publish_denied",
                    &principal.to_string(),
                    peer,
                    &denied.to_string(),
                );
                false
            }
        }
    }

    pub fn subscribe(
        &self,
        principal: &Principal,
        session: SessionId,
        filter: &str,
        qos: Qos,
        tx: mpsc::Sender<Delivery>,
    ) -> Result<Qos, NotAuthorized> {
        self.authorizer.authorize_subscribe(principal, filter)?;
        let granted = qos.capped();
        self.router.subscribe(session, filter, granted, tx);
        Ok(granted)
    }

    /// Register a live session; an older session with the same identity and
    /// client id is told to close.
    pub fn register_session(
        &self,
        principal: &Principal,
        client_id: &str,
        session: SessionId,
    ) -> oneshot::Receiver<()> {
        let (tx, rx) = oneshot::channel();
        let key = (principal.to_string(), client_id.to_string());
        let previous = self.live.lock().insert(
            key,
            LiveSession {
                id: session,
                takeover: tx,
            },
        );
        if let Some(previous) = previous {
            tracing::info!(
                %principal,
                client_id,
                previous = previous.id,
                "session taken over"
            );
            let _ = previous.takeover.send(());
        }
        rx
    }

    pub fn deregister_session(&self, principal: &Principal, client_id: &str, session: SessionId) {
        let key = (principal.to_string(), client_id.to_string());
        let mut live = self.live.lock();
        if live.get(&key).is_some_and(|s| s.id == session) {
            live.remove(&key);
        }
    }

    pub fn live_sessions(&self) -> usize {
        self.live.lock().len()
    }
}
