//! CLI argument definitions using clap.

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

/// Locus - secure location-telemetry MQTT broker.
#[derive(Parser)]
#[command(name = "locus")]
#[command(version)]
#[command(about = "Locus location broker and PKI tools")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start the Locus broker
    Start(StartArgs),

    /// Manage certificates in the configured material store
    Pki(PkiArgs),

    /// Print an Argon2id PHC string for a `[[users]]` password_hash entry
    HashPassword(HashPasswordArgs),
}

#[derive(Args)]
pub struct HashPasswordArgs {
    /// Password to hash; read from the first line of stdin when omitted
    #[arg(long)]
    pub password: Option<String>,
}

// -----------------------------------------------------------------------------
// Start command
// -----------------------------------------------------------------------------

#[derive(Args)]
pub struct StartArgs {
    /// Path to configuration file
    #[arg(short, long, default_value = "config/locus.toml")]
    pub config: PathBuf,
}

// -----------------------------------------------------------------------------
// PKI commands
// -----------------------------------------------------------------------------

#[derive(Args)]
pub struct PkiArgs {
    /// Path to configuration file
    #[arg(short, long, default_value = "config/locus.toml", global = true)]
    pub config: PathBuf,

    #[command(subcommand)]
    pub action: PkiAction,
}

#[derive(Subcommand)]
pub enum PkiAction {
    /// Generate a new certificate authority and make it active
    InitCa(InitCaArgs),
    /// Generate a server certificate from the active authority
    ServerCert(ServerCertArgs),
    /// Issue a client certificate for an identity
    Issue(IssueArgs),
    /// Revoke a client certificate by serial number
    Revoke(RevokeArgs),
    /// Write the current revocation list as PEM
    Crl(CrlArgs),
    /// List authorities and certificates
    List(ListArgs),
}

impl PkiAction {
    /// Whether the action writes to the material store.
    pub fn mutates_store(&self) -> bool {
        match self {
            PkiAction::Crl(crl) => crl.regenerate,
            PkiAction::List(_) => false,
            _ => true,
        }
    }
}

#[derive(Args)]
pub struct InitCaArgs {
    /// Subject common name (defaults to pki.authority_subject)
    #[arg(long)]
    pub subject: Option<String>,

    /// Validity in days (defaults to pki.authority_validity_days)
    #[arg(long)]
    pub days: Option<u32>,

    /// Key size: RSA 2048, 3072 or 4096, ECDSA 256 or 384 (defaults to pki.key_size)
    #[arg(long)]
    pub key_size: Option<u32>,
}

#[derive(Args)]
pub struct ServerCertArgs {
    /// Common name (defaults to pki.server_common_name)
    #[arg(long)]
    pub common_name: Option<String>,

    /// Validity in days (defaults to pki.server_validity_days)
    #[arg(long)]
    pub days: Option<u32>,

    /// Key size: RSA 2048, 3072 or 4096, ECDSA 256 or 384 (defaults to pki.key_size)
    #[arg(long)]
    pub key_size: Option<u32>,

    /// Extra subject alternative names, added to pki.extra_sans (can be repeated)
    #[arg(long = "san", action = clap::ArgAction::Append)]
    pub sans: Vec<String>,
}

#[derive(Args)]
pub struct IssueArgs {
    /// Owner identity; becomes the certificate common name
    #[arg(long)]
    pub identity: String,

    /// Directory receiving <identity>.crt, <identity>.key and ca.crt
    #[arg(long, value_name = "DIR")]
    pub out_dir: PathBuf,

    /// Validity in days (defaults to pki.client_validity_days)
    #[arg(long)]
    pub days: Option<u32>,

    /// Key size: RSA 2048, 3072 or 4096, ECDSA 256 or 384 (defaults to pki.key_size)
    #[arg(long)]
    pub key_size: Option<u32>,
}

#[derive(Args)]
pub struct RevokeArgs {
    /// Hex serial number of the client certificate
    #[arg(long)]
    pub serial: String,
}

#[derive(Args)]
pub struct CrlArgs {
    /// Output path for the PEM revocation list
    #[arg(long, value_name = "PATH")]
    pub out: PathBuf,

    /// Re-sign the list before writing it
    #[arg(long)]
    pub regenerate: bool,
}

#[derive(Args)]
pub struct ListArgs {
    /// Only show client certificates for this identity
    #[arg(long)]
    pub owner: Option<String>,

    /// Emit JSON instead of table output
    #[arg(long)]
    pub json: bool,
}
