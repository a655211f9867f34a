//! Location-telemetry semantics layered on the broker.
//!
//! - `payload` - typed parsing and validation of device payloads
//! - `collaborators` - record-store and user-directory interfaces plus stock implementations
//! - `handler` - message sink that persists device traffic through a bounded worker
//! - `commands` - server-to-device command construction and publishing

pub mod collaborators;
pub mod commands;
pub mod handler;
pub mod payload;

use thiserror::Error;

pub use collaborators::{
    hash_password, DeviceIdentity, InMemoryRecordStore, JournalRecordStore, RecordError,
    RecordStore, StaticUserDirectory, UserDirectory,
};
pub use commands::{build_command, Command, CommandError, CommandPublisher, CommandVerb};
pub use handler::{DomainHandler, Handled};
pub use payload::{parse_payload, DomainMessage, LocationFix, Plausibility, Transition};

#[derive(Debug, Error)]
pub enum DomainError {
    #[error("malformed payload: {0}")]
    Malformed(String),
    #[error("invalid payload: {0}")]
    Validation(String),
    #[error(transparent)]
    Record(#[from] RecordError),
    #[error("domain handler queue closed")]
    QueueClosed,
}
