//! Certificate authority, listener identity and client certificates.
//!
//! - `seal` - encryption of private keys at rest
//! - `store` - persisted records and the material store seam
//! - `crl` - signed revocation lists
//! - `manager` - issuance, revocation and trust-change notification

pub mod crl;
pub mod manager;
pub mod seal;
pub mod store;

pub use crl::RevocationList;
pub use manager::*;
pub use seal::{KeySealer, SealError};
pub use store::{FileMaterialStore, MaterialStore, MemoryMaterialStore, PkiState, StaleWrite};

use rcgen::{
    KeyPair, RsaKeySize, SignatureAlgorithm, PKCS_ECDSA_P256_SHA256, PKCS_ECDSA_P384_SHA384,
    PKCS_RSA_SHA256,
};
use sha2::{Digest, Sha256};
use thiserror::Error;

pub const MIN_VALIDITY_DAYS: u32 = 1;
pub const MAX_VALIDITY_DAYS: u32 = 36_500;
/// RSA modulus sizes, then ECDSA curve sizes.
pub const SUPPORTED_KEY_SIZES: [u32; 5] = [2048, 3072, 4096, 256, 384];

#[derive(Debug, Error)]
pub enum PkiError {
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),
    #[error("no active certificate authority")]
    NoActiveAuthority,
    #[error("{owner} already holds an active client certificate (serial {serial})")]
    DuplicateActiveCertificate { owner: String, serial: String },
    #[error("{0} not found")]
    NotFound(String),
    #[error("{0} is still in use and cannot be deleted")]
    NotDeletable(String),
    #[error("certificate operation failed: {0}")]
    Crypto(#[from] rcgen::Error),
    #[error(transparent)]
    Seal(#[from] SealError),
    #[error("material store: {0}")]
    Store(String),
    #[error("material store changed concurrently (expected generation {expected}, found {found})")]
    Conflict { expected: u64, found: u64 },
}

/// Notified after the trust anchor, listener identity or revocation list
/// changes. Calls happen synchronously on the mutating thread, after the
/// new state is persisted.
pub trait TrustObserver: Send + Sync {
    fn trust_changed(&self, pki: &PkiManager);
}

/// Signature algorithm for a supported key size.
pub fn signature_algorithm(key_size: u32) -> Result<&'static SignatureAlgorithm, PkiError> {
    match key_size {
        2048 | 3072 | 4096 => Ok(&PKCS_RSA_SHA256),
        256 => Ok(&PKCS_ECDSA_P256_SHA256),
        384 => Ok(&PKCS_ECDSA_P384_SHA384),
        other => Err(PkiError::InvalidParameter(format!(
            "key size {other} is not one of {SUPPORTED_KEY_SIZES:?}"
        ))),
    }
}

/// Fresh key pair: RSA for modulus sizes, ECDSA for curve sizes.
pub fn generate_key(key_size: u32) -> Result<KeyPair, PkiError> {
    let alg = signature_algorithm(key_size)?;
    let rsa = match key_size {
        2048 => Some(RsaKeySize::_2048),
        3072 => Some(RsaKeySize::_3072),
        4096 => Some(RsaKeySize::_4096),
        _ => None,
    };
    let key = match rsa {
        Some(size) => KeyPair::generate_rsa_for(alg, size)?,
        None => KeyPair::generate_for(alg)?,
    };
    Ok(key)
}

pub fn validate_validity_days(days: u32) -> Result<(), PkiError> {
    if !(MIN_VALIDITY_DAYS..=MAX_VALIDITY_DAYS).contains(&days) {
        return Err(PkiError::InvalidParameter(format!(
            "validity_days {days} outside [{MIN_VALIDITY_DAYS}, {MAX_VALIDITY_DAYS}]"
        )));
    }
    Ok(())
}

/// SHA-256 over DER, as colon-separated uppercase hex.
pub fn fingerprint(der: &[u8]) -> String {
    Sha256::digest(der)
        .iter()
        .map(|b| format!("{b:02X}"))
        .collect::<Vec<_>>()
        .join(":")
}

/// Identities become certificate common names and topic levels, so they
/// must be a single printable topic level.
pub fn validate_identity(identity: &str) -> Result<(), PkiError> {
    if identity.is_empty() {
        return Err(PkiError::InvalidParameter("identity is empty".into()));
    }
    if identity
        .chars()
        .any(|c| matches!(c, '/' | '+' | '#') || c.is_control())
    {
        return Err(PkiError::InvalidParameter(format!(
            "identity {identity:?} contains a reserved character"
        )));
    }
    Ok(())
}
