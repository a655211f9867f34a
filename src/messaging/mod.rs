//! Message handling infrastructure.
//!
//! - `topics` - Topic validation, wildcard matching and the subscription trie
//!
//! The [`MessageSink`] seam is how accepted publishes leave the broker for
//! application code; the domain handler is the production sink.

pub mod topics;

pub use topics::*;

use crate::mqtt::Qos;
use crate::security::Principal;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

/// A publish that passed authorization, as seen by sinks and subscribers.
#[derive(Debug, Clone)]
pub struct RoutedMessage {
    pub topic: String,
    pub payload: Arc<[u8]>,
    pub qos: Qos,
    pub publisher: Principal,
}

pub type SinkFuture<'a> = Pin<Box<dyn Future<Output = ()> + Send + 'a>>;

/// Receives every authorized publish before it is acknowledged.
///
/// Sinks own their failure handling; the broker never retries a delivery.
pub trait MessageSink: Send + Sync {
    fn deliver<'a>(&'a self, message: &'a RoutedMessage) -> SinkFuture<'a>;
}

/// Sink that accepts and discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl MessageSink for NullSink {
    fn deliver<'a>(&'a self, _message: &'a RoutedMessage) -> SinkFuture<'a> {
        Box::pin(async {})
    }
}
