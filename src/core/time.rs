use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Instant;

/// Clock abstraction to enforce deterministic time sourcing in core paths.
///
/// `now` drives keep-alive and retry deadlines; `utc_now` drives certificate
/// validity windows and timestamp plausibility checks.
pub trait Clock: Send + Sync + 'static {
    fn now(&self) -> Instant;
    fn utc_now(&self) -> DateTime<Utc>;
}

pub type SharedClock = Arc<dyn Clock>;

/// System-backed clock; replaceable in tests or deterministic replay.
#[derive(Clone, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn utc_now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Wall clock shifted by an adjustable offset. Monotonic time is untouched.
#[derive(Default)]
pub struct OffsetClock {
    offset: RwLock<chrono::Duration>,
}

impl OffsetClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_offset(&self, offset: chrono::Duration) {
        *self.offset.write() = offset;
    }
}

impl Clock for OffsetClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn utc_now(&self) -> DateTime<Utc> {
        Utc::now() + *self.offset.read()
    }
}

pub fn system_clock() -> SharedClock {
    Arc::new(SystemClock)
}
