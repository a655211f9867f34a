//! Locus CLI.
//!
//! Provides a single binary entry point for:
//! - `locus start` - Start the broker
//! - `locus pki` - Manage the certificate authority, server and client certificates
//! - `locus hash-password` - Hash an MQTT password for the user directory

mod args;
pub mod commands;

pub use args::{Cli, Commands, HashPasswordArgs, PkiAction, PkiArgs, StartArgs};
