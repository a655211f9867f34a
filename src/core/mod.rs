//! Core runtime infrastructure.
//!
//! This module contains the pieces every Locus process needs:
//! - `config` - Configuration parsing and validation
//! - `runtime` - Lifecycle and port management
//! - `time` - Clock abstraction used for issuance and expiry

pub mod config;
pub mod runtime;
pub mod time;

pub use config::*;
pub use runtime::*;
pub use time::*;
