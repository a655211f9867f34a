//! Locus - unified CLI entrypoint.
//!
//! Usage:
//!   locus start --config config/locus.toml
//!   locus pki init-ca
//!   locus pki issue --identity alice --out-dir certs/
//!   locus pki revoke --serial <hex>
//!   locus hash-password --password <secret>

use anyhow::Result;
use clap::Parser;
use locus::cli::commands::{run_hash_password, run_pki, run_start};
use locus::cli::{Cli, Commands};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Start(args) => run_start(args).await,
        Commands::Pki(args) => run_pki(args),
        Commands::HashPassword(args) => run_hash_password(args),
    }
}
