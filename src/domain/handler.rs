use super::collaborators::{DeviceIdentity, RecordError, RecordStore};
use super::payload::{parse_payload, DomainMessage, Plausibility};
use super::DomainError;
use crate::config::DomainConfig;
use crate::messaging::{MessageSink, RoutedMessage, SinkFuture};
use crate::security::COMMAND_SUFFIX;
use crate::time::SharedClock;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};

/// What the handler did with one message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Handled {
    /// Persisted through the record store; carries the payload kind.
    Recorded(&'static str),
    /// Valid but not acted on (commands, unknown types, foreign topics).
    Ignored,
}

struct RecordJob {
    device: DeviceIdentity,
    message: DomainMessage,
    done: oneshot::Sender<Result<(), RecordError>>,
}

/// Turns device traffic into record-store calls.
///
/// Store calls are blocking, so they are queued to a single worker that runs
/// each one on the blocking pool. `handle` resolves only once the store call
/// has finished, which lets the broker hold back a PUBACK until then.
pub struct DomainHandler {
    root: String,
    clock: SharedClock,
    max_future_skew: chrono::Duration,
    jobs: mpsc::Sender<RecordJob>,
}

impl DomainHandler {
    /// Start the record worker. Must be called inside a tokio runtime.
    pub fn spawn(
        store: Arc<dyn RecordStore>,
        root: impl Into<String>,
        cfg: &DomainConfig,
        clock: SharedClock,
    ) -> Arc<Self> {
        let (jobs, rx) = mpsc::channel(cfg.queue_capacity.max(1));
        tokio::spawn(run_worker(store, rx));
        Arc::new(Self {
            root: root.into(),
            clock,
            max_future_skew: chrono::Duration::seconds(cfg.max_future_skew_secs),
            jobs,
        })
    }

    /// `root/{user}/{device}[/suffix...]` split into the device and its suffix.
    pub fn device_topic<'t>(&self, topic: &'t str) -> Option<(DeviceIdentity, Option<&'t str>)> {
        let mut levels = topic.splitn(4, '/');
        if levels.next()? != self.root {
            return None;
        }
        let user = levels.next().filter(|l| !l.is_empty())?;
        let device = levels.next().filter(|l| !l.is_empty())?;
        Some((DeviceIdentity::new(user, device), levels.next()))
    }

    pub async fn handle(&self, topic: &str, payload: &[u8]) -> Result<Handled, DomainError> {
        let Some((device, suffix)) = self.device_topic(topic) else {
            tracing::debug!(topic, "ignoring message outside the device namespace");
            return Ok(Handled::Ignored);
        };
        if suffix == Some(COMMAND_SUFFIX) {
            tracing::debug!(topic, "ignoring command echo");
            return Ok(Handled::Ignored);
        }
        let bounds = Plausibility {
            now: self.clock.utc_now(),
            max_future_skew: self.max_future_skew,
        };
        let message = parse_payload(payload, bounds)?;
        let kind = match &message {
            DomainMessage::Location(_) => "location",
            DomainMessage::Lwt(_) => "lwt",
            DomainMessage::Transition(_) => "transition",
            DomainMessage::Waypoints(_) => "waypoints",
            DomainMessage::Ignored(kind) => {
                tracing::debug!(topic, kind = %kind, "ignoring payload type");
                return Ok(Handled::Ignored);
            }
        };
        let (done, result) = oneshot::channel();
        self.jobs
            .send(RecordJob {
                device,
                message,
                done,
            })
            .await
            .map_err(|_| DomainError::QueueClosed)?;
        result.await.map_err(|_| DomainError::QueueClosed)??;
        Ok(Handled::Recorded(kind))
    }
}

impl MessageSink for DomainHandler {
    fn deliver<'a>(&'a self, message: &'a RoutedMessage) -> SinkFuture<'a> {
        Box::pin(async move {
            match self.handle(&message.topic, &message.payload).await {
                Ok(Handled::Recorded(kind)) => {
                    tracing::debug!(topic = %message.topic, kind, "recorded device message")
                }
                Ok(Handled::Ignored) => {}
                Err(err @ (DomainError::Malformed(_) | DomainError::Validation(_))) => {
                    tracing::warn!(
                        topic = %message.topic,
                        publisher = %message.publisher,
                        "dropping device payload: {err}"
                    )
                }
                Err(err) => tracing::error!(topic = %message.topic, "record store call failed: {err}"),
            }
        })
    }
}

async fn run_worker(store: Arc<dyn RecordStore>, mut rx: mpsc::Receiver<RecordJob>) {
    while let Some(job) = rx.recv().await {
        let RecordJob {
            device,
            message,
            done,
        } = job;
        let store = store.clone();
        let result = match tokio::task::spawn_blocking(move || apply(store.as_ref(), &device, &message)).await {
            Ok(result) => result,
            Err(join_err) => Err(RecordError::Unavailable(format!("record task failed: {join_err}"))),
        };
        let _ = done.send(result);
    }
    tracing::debug!("domain record worker stopped");
}

fn apply(
    store: &dyn RecordStore,
    device: &DeviceIdentity,
    message: &DomainMessage,
) -> Result<(), RecordError> {
    match message {
        DomainMessage::Location(fix) => {
            store.record_location(device, fix)?;
            store.mark_device_online(device, true, &serde_json::to_value(fix)?)
        }
        DomainMessage::Lwt(payload) => store.mark_device_online(device, false, payload),
        DomainMessage::Transition(transition) => store.record_transition(device, transition),
        DomainMessage::Waypoints(waypoints) => store.record_waypoints(device, waypoints),
        DomainMessage::Ignored(_) => Ok(()),
    }
}
