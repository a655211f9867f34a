use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use tracing::event;

/// One security-relevant event: handshake rejections, connect decisions,
/// authorization denials and PKI changes.
#[derive(Debug, Clone, Serialize)]
pub struct AuditEvent {
    pub event_type: String,
    pub identity: String,
    pub peer: String,
    pub message: String,
}

/// Bounded in-process trail of audit events.
#[derive(Clone)]
pub struct AuditSink {
    inner: Arc<Mutex<VecDeque<AuditEvent>>>,
    capacity: usize,
}

impl Default for AuditSink {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }
}

const DEFAULT_CAPACITY: usize = 10_000;

impl AuditSink {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(VecDeque::with_capacity(capacity.clamp(1, 1024)))),
            capacity: capacity.max(1),
        }
    }

    pub fn record(&self, event: AuditEvent) {
        let mut guard = self.inner.lock();
        while guard.len() >= self.capacity {
            guard.pop_front();
            evicted().fetch_add(1, Ordering::Relaxed);
        }
        guard.push_back(event);
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn events(&self) -> Vec<AuditEvent> {
        self.inner.lock().iter().cloned().collect()
    }
}

static AUDIT_SINK: OnceLock<AuditSink> = OnceLock::new();
static AUDIT_EVICTED: OnceLock<AtomicU64> = OnceLock::new();

fn evicted() -> &'static AtomicU64 {
    AUDIT_EVICTED.get_or_init(|| AtomicU64::new(0))
}

/// Install the process-wide sink. Only the first call wins.
pub fn install_sink(sink: AuditSink) {
    let _ = AUDIT_SINK.set(sink);
}

/// Mirrors audit events to an external destination.
pub trait AuditPublisher: Send + Sync {
    fn publish(&self, event: &AuditEvent);
}

static AUDIT_PUBLISHER: OnceLock<Mutex<Option<Arc<dyn AuditPublisher>>>> = OnceLock::new();

pub fn install_publisher(publisher: Arc<dyn AuditPublisher>) {
    let cell = AUDIT_PUBLISHER.get_or_init(|| Mutex::new(None));
    *cell.lock() = Some(publisher);
}

pub fn sink_len() -> usize {
    AUDIT_SINK.get().map(AuditSink::len).unwrap_or(0)
}

/// Return a copy of the recorded audit events.
pub fn snapshot() -> Vec<AuditEvent> {
    AUDIT_SINK
        .get()
        .map(AuditSink::events)
        .unwrap_or_default()
}

/// Events pushed out of the sink by its capacity bound.
pub fn evicted_count() -> u64 {
    evicted().load(Ordering::Relaxed)
}

/// Emit an immutable audit event; will fan out to an installed publisher when present.
pub fn emit(event_type: &str, identity: &str, peer: &str, message: &str) {
    event!(
        target: "audit",
        tracing::Level::INFO,
        %event_type,
        %identity,
        %peer,
        %message
    );
    let event = AuditEvent {
        event_type: event_type.to_string(),
        identity: identity.to_string(),
        peer: peer.to_string(),
        message: message.to_string(),
    };
    if let Some(lock) = AUDIT_PUBLISHER.get() {
        if let Some(publisher) = lock.lock().as_ref() {
            publisher.publish(&event);
        }
    }
    AUDIT_SINK.get_or_init(AuditSink::default).record(event);
}
