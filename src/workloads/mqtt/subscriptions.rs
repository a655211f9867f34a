use super::protocol::Qos;
use crate::messaging::topics::TopicTrie;
use crate::messaging::RoutedMessage;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

pub type SessionId = u64;

/// A message queued for one subscriber at its granted QoS.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub topic: String,
    pub payload: Arc<[u8]>,
    pub qos: Qos,
}

#[derive(Debug, Clone)]
struct Subscriber {
    session: SessionId,
    qos: Qos,
    tx: mpsc::Sender<Delivery>,
}

/// Fan-out of published messages to subscribed sessions.
///
/// Subscribe, unsubscribe and route each take the trie lock once, so they are
/// individually atomic but may interleave.
#[derive(Debug, Default)]
pub struct SubscriptionRouter {
    trie: RwLock<TopicTrie<Subscriber>>,
    next_session: AtomicU64,
}

impl SubscriptionRouter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_session_id(&self) -> SessionId {
        self.next_session.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Add or replace `session`'s subscription to `filter`.
    pub fn subscribe(
        &self,
        session: SessionId,
        filter: &str,
        qos: Qos,
        tx: mpsc::Sender<Delivery>,
    ) {
        let mut trie = self.trie.write();
        trie.remove(filter, |s| s.session == session);
        trie.insert(
            filter,
            Subscriber {
                session,
                qos: qos.capped(),
                tx,
            },
        );
    }

    pub fn unsubscribe(&self, session: SessionId, filter: &str) -> bool {
        self.trie.write().remove(filter, |s| s.session == session) > 0
    }

    /// Drop every listed subscription held by `session`.
    pub fn remove_session<'a>(
        &self,
        session: SessionId,
        filters: impl IntoIterator<Item = &'a String>,
    ) -> usize {
        let mut trie = self.trie.write();
        filters
            .into_iter()
            .map(|f| trie.remove(f, |s| s.session == session))
            .sum()
    }

    pub fn subscription_count(&self) -> usize {
        self.trie.read().len()
    }

    /// Queue `message` for every matching session except `origin`. A session
    /// with overlapping filters receives one copy at its highest grant.
    /// Returns the number of sessions the message was queued for.
    pub fn route(&self, message: &RoutedMessage, origin: Option<SessionId>) -> usize {
        let targets: HashMap<SessionId, (Qos, mpsc::Sender<Delivery>)> = {
            let trie = self.trie.read();
            let mut targets: HashMap<SessionId, (Qos, mpsc::Sender<Delivery>)> = HashMap::new();
            for sub in trie.find(&message.topic) {
                if Some(sub.session) == origin {
                    continue;
                }
                targets
                    .entry(sub.session)
                    .and_modify(|(qos, _)| *qos = (*qos).max(sub.qos))
                    .or_insert_with(|| (sub.qos, sub.tx.clone()));
            }
            targets
        };
        let mut delivered = 0;
        for (session, (granted, tx)) in targets {
            let delivery = Delivery {
                topic: message.topic.clone(),
                payload: message.payload.clone(),
                qos: granted.min(message.qos),
            };
            match tx.try_send(delivery) {
                Ok(()) => delivered += 1,
                Err(TrySendError::Full(_)) => tracing::warn!(
                    session,
                    topic = %message.topic,
                    "outbound queue full; dropping delivery"
                ),
                Err(TrySendError::Closed(_)) => {
                    tracing::debug!(session, "subscriber closed before delivery")
                }
            }
        }
        delivered
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::security::Principal;

    fn message(topic: &str, qos: Qos) -> RoutedMessage {
        RoutedMessage {
            topic: topic.to_string(),
            payload: Arc::from(&b"{}"[..]),
            qos,
            publisher: Principal::User("alice".into()),
        }
    }

    #[tokio::test]
    async fn delivers_at_lesser_qos_once_per_session() {
        let router = SubscriptionRouter::new();
        let (tx, mut rx) = mpsc::channel(8);
        let a = router.next_session_id();
        router.subscribe(a, "owntracks/alice/#", Qos::AtMostOnce, tx.clone());
        router.subscribe(a, "owntracks/alice/+", Qos::ExactlyOnce, tx);
        assert_eq!(router.subscription_count(), 2);

        assert_eq!(router.route(&message("owntracks/alice/phone", Qos::AtLeastOnce), None), 1);
        let got = rx.recv().await.unwrap();
        assert_eq!(got.qos, Qos::AtLeastOnce);
        assert!(rx.try_recv().is_err());

        assert_eq!(router.route(&message("owntracks/alice/phone", Qos::AtMostOnce), None), 1);
        assert_eq!(rx.recv().await.unwrap().qos, Qos::AtMostOnce);
    }

    #[tokio::test]
    async fn origin_and_unsubscribed_sessions_are_skipped() {
        let router = SubscriptionRouter::new();
        let (tx_a, mut rx_a) = mpsc::channel(8);
        let (tx_b, mut rx_b) = mpsc::channel(8);
        let a = router.next_session_id();
        let b = router.next_session_id();
        router.subscribe(a, "owntracks/alice/#", Qos::AtLeastOnce, tx_a);
        router.subscribe(b, "owntracks/alice/#", Qos::AtLeastOnce, tx_b);

        assert_eq!(router.route(&message("owntracks/alice/phone", Qos::AtLeastOnce), Some(a)), 1);
        assert!(rx_a.try_recv().is_err());
        assert!(rx_b.try_recv().is_ok());

        assert!(router.unsubscribe(b, "owntracks/alice/#"));
        assert!(!router.unsubscribe(b, "owntracks/alice/#"));
        let filters = vec!["owntracks/alice/#".to_string()];
        assert_eq!(router.remove_session(a, &filters), 1);
        assert_eq!(router.route(&message("owntracks/alice/phone", Qos::AtMostOnce), None), 0);
    }

    #[tokio::test]
    async fn full_queues_drop_instead_of_blocking() {
        let router = SubscriptionRouter::new();
        let (tx, _rx) = mpsc::channel(1);
        let a = router.next_session_id();
        router.subscribe(a, "owntracks/alice/phone", Qos::AtMostOnce, tx);
        assert_eq!(router.route(&message("owntracks/alice/phone", Qos::AtMostOnce), None), 1);
        assert_eq!(router.route(&message("owntracks/alice/phone", Qos::AtMostOnce), None), 0);
    }
}
