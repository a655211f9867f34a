//! PKI commands operating on the configured material store.

use crate::cli::args::{CrlArgs, IssueArgs, ListArgs, PkiAction, PkiArgs};
use crate::config::Config;
use crate::pki::{
    AuthoritySummary, ClientCertificateSummary, FileMaterialStore, KeySealer, PkiManager,
    ServerCertificateSummary,
};
use crate::telemetry::{self, LogFormat};
use crate::time::system_clock;
use anyhow::{bail, Context, Result};
use serde::Serialize;
use std::fs;
use std::io::Write;
use std::path::Path;
use std::sync::Arc;

pub fn run_pki(args: PkiArgs) -> Result<()> {
    let mut config = Config::load(&args.config)?;
    config.apply_env_overrides()?;
    config.validate()?;
    // Console tooling logs warnings only, in human-readable form.
    let _ = telemetry::init_tracing(Some("warn"), LogFormat::Pretty);
    if args.action.mutates_store() {
        check_live_broker(&config)?;
    }
    let pki = open_pki(&config)?;
    let settings = &config.pki;
    match args.action {
        PkiAction::InitCa(ca) => {
            let summary = pki.generate_authority(
                ca.subject.as_deref().unwrap_or(&settings.authority_subject),
                ca.days.unwrap_or(settings.authority_validity_days),
                ca.key_size.unwrap_or(settings.key_size),
            )?;
            println!("Authority: {}", summary.subject);
            println!("Fingerprint: {}", summary.fingerprint);
            println!("Valid until: {}", summary.not_after.to_rfc3339());
            Ok(())
        }
        PkiAction::ServerCert(server) => {
            let mut sans = settings.extra_sans.clone();
            sans.extend(server.sans);
            let summary = pki.generate_server_certificate(
                server
                    .common_name
                    .as_deref()
                    .unwrap_or(&settings.server_common_name),
                server.days.unwrap_or(settings.server_validity_days),
                server.key_size.unwrap_or(settings.key_size),
                &sans,
            )?;
            println!("Server certificate: {}", summary.common_name);
            println!("Fingerprint: {}", summary.fingerprint);
            println!("SANs: {}", summary.subject_alt_names.join(", "));
            println!("Valid until: {}", summary.not_after.to_rfc3339());
            Ok(())
        }
        PkiAction::Issue(issue) => run_issue(&pki, &config, issue),
        PkiAction::Revoke(revoke) => {
            let crl = pki.revoke_client_certificate(&revoke.serial)?;
            println!("Revoked {}", revoke.serial);
            println!(
                "Revocation list #{} now lists {} serial(s)",
                crl.crl_number,
                crl.revoked_serials.len()
            );
            Ok(())
        }
        PkiAction::Crl(crl) => run_crl(&pki, crl),
        PkiAction::List(list) => run_list(&pki, list),
    }
}

/// A broker publishes its runtime file while it listens. It only sees this
/// command's writes when it polls the store.
pub(crate) fn check_live_broker(config: &Config) -> Result<()> {
    let Some(path) = config
        .listeners
        .runtime_file
        .as_deref()
        .filter(|p| p.exists())
    else {
        return Ok(());
    };
    match config.pki.reload_interval() {
        Some(every) => {
            tracing::warn!(
                runtime_file = %path.display(),
                "a broker is running; it applies this change within {every:?}"
            );
            Ok(())
        }
        None => bail!(
            "a broker is running ({} exists) and pki.reload_interval_ms is 0; \
             stop it or enable store reloading first",
            path.display()
        ),
    }
}

fn open_pki(config: &Config) -> Result<PkiManager> {
    let store = Arc::new(FileMaterialStore::new(config.pki.store_path.clone()));
    let sealer = KeySealer::from_secret(config.pki.secret.expose());
    PkiManager::open(store, sealer, system_clock())
        .with_context(|| format!("open pki store {}", config.pki.store_path.display()))
}

fn run_issue(pki: &PkiManager, config: &Config, args: IssueArgs) -> Result<()> {
    let issued = pki.issue_client_certificate(
        &args.identity,
        args.days.unwrap_or(config.pki.client_validity_days),
        args.key_size.unwrap_or(config.pki.key_size),
    )?;
    fs::create_dir_all(&args.out_dir)
        .with_context(|| format!("create {}", args.out_dir.display()))?;
    let cert_path = args.out_dir.join(format!("{}.crt", issued.owner_identity));
    let key_path = args.out_dir.join(format!("{}.key", issued.owner_identity));
    let ca_path = args.out_dir.join("ca.crt");
    fs::write(&cert_path, &issued.cert_pem)
        .with_context(|| format!("write {}", cert_path.display()))?;
    write_private(&key_path, issued.key_pem.as_bytes())?;
    fs::write(&ca_path, &issued.authority_pem)
        .with_context(|| format!("write {}", ca_path.display()))?;
    println!("Issued certificate for {}", issued.owner_identity);
    println!("Serial: {}", issued.serial_number);
    println!("Fingerprint: {}", issued.fingerprint);
    println!("Valid until: {}", issued.not_after.to_rfc3339());
    println!("Certificate: {}", cert_path.display());
    println!("Private key: {}", key_path.display());
    println!("Authority: {}", ca_path.display());
    Ok(())
}

fn write_private(path: &Path, contents: &[u8]) -> Result<()> {
    let mut options = fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    let mut file = options
        .open(path)
        .with_context(|| format!("open {}", path.display()))?;
    file.write_all(contents)
        .with_context(|| format!("write {}", path.display()))?;
    Ok(())
}

fn run_crl(pki: &PkiManager, args: CrlArgs) -> Result<()> {
    let crl = if args.regenerate {
        pki.regenerate_revocation_list()?
    } else {
        pki.current_revocation_list()
    };
    let pem = crl
        .pem
        .as_deref()
        .context("no active authority has signed a revocation list")?;
    fs::write(&args.out, pem).with_context(|| format!("write {}", args.out.display()))?;
    println!(
        "Wrote revocation list #{} ({} serial(s)) to {}",
        crl.crl_number,
        crl.revoked_serials.len(),
        args.out.display()
    );
    Ok(())
}

#[derive(Serialize)]
struct Inventory {
    authorities: Vec<AuthoritySummary>,
    server_certificates: Vec<ServerCertificateSummary>,
    client_certificates: Vec<ClientCertificateSummary>,
}

fn run_list(pki: &PkiManager, args: ListArgs) -> Result<()> {
    let inventory = Inventory {
        authorities: pki.list_authorities(),
        server_certificates: pki.list_server_certificates(),
        client_certificates: pki.list_client_certificates(args.owner.as_deref()),
    };
    if args.json {
        println!("{}", serde_json::to_string_pretty(&inventory)?);
    } else {
        print_inventory(&inventory);
    }
    Ok(())
}

fn print_inventory(inventory: &Inventory) {
    println!("{:<8} {:<24} {:<8} {:<25} fingerprint", "active", "authority", "key", "not_after");
    for ca in &inventory.authorities {
        println!(
            "{:<8} {:<24} {:<8} {:<25} {}",
            if ca.is_active { "*" } else { "" },
            ca.subject,
            ca.key_size,
            ca.not_after.to_rfc3339(),
            ca.fingerprint
        );
    }
    println!();
    println!("{:<8} {:<24} {:<8} {:<25} fingerprint", "active", "server", "key", "not_after");
    for server in &inventory.server_certificates {
        println!(
            "{:<8} {:<24} {:<8} {:<25} {}",
            if server.is_active { "*" } else { "" },
            server.common_name,
            server.key_size,
            server.not_after.to_rfc3339(),
            server.fingerprint
        );
    }
    println!();
    println!("{:<8} {:<24} {:<34} {:<25}", "revoked", "owner", "serial", "not_after");
    if inventory.client_certificates.is_empty() {
        println!("no client certificates");
    }
    for client in &inventory.client_certificates {
        println!(
            "{:<8} {:<24} {:<34} {:<25}",
            if client.revoked { "yes" } else { "" },
            client.owner_identity,
            client.serial_number,
            client.not_after.to_rfc3339()
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Secret;

    fn config_in(dir: &tempfile::TempDir) -> Config {
        let mut cfg = Config::default();
        cfg.pki.secret = Secret::new("s");
        cfg.listeners.runtime_file = Some(dir.path().join("ports.json"));
        cfg
    }

    #[test]
    fn live_broker_without_reloading_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = config_in(&dir);
        check_live_broker(&cfg).unwrap();

        fs::write(dir.path().join("ports.json"), b"{}").unwrap();
        check_live_broker(&cfg).unwrap();

        cfg.pki.reload_interval_ms = 0;
        let err = check_live_broker(&cfg).unwrap_err();
        assert!(err.to_string().contains("reload_interval_ms"));
    }
}
