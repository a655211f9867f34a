use anyhow::Context;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Root authority record; `sealed_key_pem` is the sealed PKCS#8 private key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthorityRecord {
    pub subject: String,
    pub cert_pem: String,
    pub sealed_key_pem: String,
    pub key_size: u32,
    pub fingerprint: String,
    pub not_before: DateTime<Utc>,
    pub not_after: DateTime<Utc>,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerCertificateRecord {
    pub common_name: String,
    pub subject_alt_names: Vec<String>,
    pub cert_pem: String,
    pub sealed_key_pem: String,
    pub key_size: u32,
    pub fingerprint: String,
    pub authority_fingerprint: String,
    pub not_before: DateTime<Utc>,
    pub not_after: DateTime<Utc>,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientCertificateRecord {
    pub owner_identity: String,
    pub common_name: String,
    pub serial_number: String,
    pub cert_pem: String,
    pub sealed_key_pem: String,
    pub key_size: u32,
    pub fingerprint: String,
    pub authority_fingerprint: String,
    pub not_before: DateTime<Utc>,
    pub not_after: DateTime<Utc>,
    pub revoked: bool,
    pub revoked_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl ClientCertificateRecord {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.not_after
    }
}

/// Last signed revocation list; regenerated, never appended to.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RevocationListRecord {
    pub authority_fingerprint: String,
    pub crl_number: u64,
    pub crl_pem: String,
    pub revoked_serials: Vec<String>,
    pub this_update: DateTime<Utc>,
    pub next_update: DateTime<Utc>,
}

/// Everything the PKI persists, in one document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PkiState {
    /// Incremented by every committed save.
    #[serde(default)]
    pub generation: u64,
    #[serde(default)]
    pub authorities: Vec<AuthorityRecord>,
    #[serde(default)]
    pub server_certificates: Vec<ServerCertificateRecord>,
    #[serde(default)]
    pub client_certificates: Vec<ClientCertificateRecord>,
    #[serde(default)]
    pub revocation_list: Option<RevocationListRecord>,
    #[serde(default)]
    pub crl_counter: u64,
}

impl PkiState {
    pub fn active_authority(&self) -> Option<&AuthorityRecord> {
        self.authorities.iter().find(|a| a.is_active)
    }

    pub fn active_server_certificate(&self) -> Option<&ServerCertificateRecord> {
        self.server_certificates.iter().find(|s| s.is_active)
    }

    pub fn serial_in_use(&self, serial: &str) -> bool {
        self.client_certificates
            .iter()
            .any(|c| c.serial_number == serial)
    }
}

/// A save was based on a generation that is no longer the stored one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("material store is at generation {found}, write was based on {expected}")]
pub struct StaleWrite {
    pub expected: u64,
    pub found: u64,
}

/// Persistence seam for PKI records. Implementations must never see
/// unsealed private keys.
pub trait MaterialStore: Send + Sync {
    fn load(&self) -> anyhow::Result<PkiState>;

    /// Replace the stored document if it is still at `expected_generation`,
    /// failing with [`StaleWrite`] otherwise.
    fn save(&self, state: &PkiState, expected_generation: u64) -> anyhow::Result<()>;
}

fn check_generation(found: u64, expected: u64) -> anyhow::Result<()> {
    if found != expected {
        return Err(StaleWrite { expected, found }.into());
    }
    Ok(())
}

/// JSON document on disk, replaced atomically on every save.
#[derive(Debug, Clone)]
pub struct FileMaterialStore {
    path: PathBuf,
}

impl FileMaterialStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl MaterialStore for FileMaterialStore {
    fn load(&self) -> anyhow::Result<PkiState> {
        if !self.path.exists() {
            return Ok(PkiState::default());
        }
        let data = fs::read_to_string(&self.path)
            .with_context(|| format!("read material store {}", self.path.display()))?;
        serde_json::from_str(&data)
            .with_context(|| format!("parse material store {}", self.path.display()))
    }

    fn save(&self, state: &PkiState, expected_generation: u64) -> anyhow::Result<()> {
        check_generation(self.load()?.generation, expected_generation)?;
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)
                    .with_context(|| format!("create store dir {}", parent.display()))?;
            }
        }
        let data = serde_json::to_vec_pretty(state).context("encode material store")?;
        let tmp = self.path.with_extension("tmp");
        fs::write(&tmp, data).with_context(|| format!("write {}", tmp.display()))?;
        fs::rename(&tmp, &self.path)
            .with_context(|| format!("replace material store {}", self.path.display()))?;
        Ok(())
    }
}

/// Volatile store for tests and embedders that persist elsewhere.
#[derive(Debug, Default)]
pub struct MemoryMaterialStore {
    state: Mutex<PkiState>,
}

impl MemoryMaterialStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl MaterialStore for MemoryMaterialStore {
    fn load(&self) -> anyhow::Result<PkiState> {
        Ok(self.state.lock().clone())
    }

    fn save(&self, state: &PkiState, expected_generation: u64) -> anyhow::Result<()> {
        let mut stored = self.state.lock();
        check_generation(stored.generation, expected_generation)?;
        *stored = state.clone();
        Ok(())
    }
}
