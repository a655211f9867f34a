//! Networking layer.
//!
//! - `tls` - revocation-aware mTLS trust built from PKI state
//! - `security` - authentication gateway and topic authorizer
//! - `listeners` - plaintext and TLS listeners feeding MQTT sessions

pub mod listeners;
pub mod security;
pub mod tls;

pub use listeners::*;
pub use security::*;
pub use tls::*;
