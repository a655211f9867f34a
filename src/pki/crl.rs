use super::store::RevocationListRecord;
use super::PkiError;
use chrono::{DateTime, Duration, Utc};
use rcgen::{
    Certificate, CertificateRevocationListParams, KeyIdMethod, KeyPair, RevocationReason,
    RevokedCertParams, SerialNumber,
};
use rustls::pki_types::CertificateRevocationListDer;
use serde::Serialize;
use time::OffsetDateTime;

/// How long a freshly signed list is advertised as current.
pub const NEXT_UPDATE_AFTER_DAYS: i64 = 7;

/// A revoked serial as it is written into the signed list.
#[derive(Debug, Clone)]
pub(crate) struct RevokedEntry {
    pub serial_number: String,
    pub revoked_at: DateTime<Utc>,
}

/// Current revocation list as handed to administrative callers.
///
/// `pem` is `None` only when no authority exists to sign it; such a list
/// revokes nothing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RevocationList {
    pub authority_fingerprint: Option<String>,
    pub crl_number: u64,
    pub revoked_serials: Vec<String>,
    pub this_update: DateTime<Utc>,
    pub next_update: DateTime<Utc>,
    pub pem: Option<String>,
}

impl RevocationList {
    pub(crate) fn unsigned(now: DateTime<Utc>) -> Self {
        Self {
            authority_fingerprint: None,
            crl_number: 0,
            revoked_serials: Vec::new(),
            this_update: now,
            next_update: now + Duration::days(NEXT_UPDATE_AFTER_DAYS),
            pem: None,
        }
    }

    pub fn is_signed(&self) -> bool {
        self.pem.is_some()
    }

    pub fn contains(&self, serial_number: &str) -> bool {
        self.revoked_serials
            .iter()
            .any(|s| s.eq_ignore_ascii_case(serial_number))
    }

    /// DER form of the signed list, for the TLS verifier.
    pub fn der(&self) -> Option<CertificateRevocationListDer<'static>> {
        let pem = self.pem.as_ref()?;
        rustls_pemfile::crls(&mut pem.as_bytes())
            .next()
            .and_then(Result::ok)
    }
}

impl From<&RevocationListRecord> for RevocationList {
    fn from(record: &RevocationListRecord) -> Self {
        Self {
            authority_fingerprint: Some(record.authority_fingerprint.clone()),
            crl_number: record.crl_number,
            revoked_serials: record.revoked_serials.clone(),
            this_update: record.this_update,
            next_update: record.next_update,
            pem: Some(record.crl_pem.clone()),
        }
    }
}

pub(crate) fn to_offset(ts: DateTime<Utc>) -> Result<OffsetDateTime, PkiError> {
    OffsetDateTime::from_unix_timestamp(ts.timestamp())
        .map_err(|_| PkiError::InvalidParameter(format!("timestamp {ts} out of range")))
}

/// Big-endian bytes without redundant leading zeros, as DER integers want.
fn minimal_be_bytes(value: u64) -> Vec<u8> {
    let bytes = value.to_be_bytes();
    let first = bytes.iter().position(|b| *b != 0).unwrap_or(bytes.len() - 1);
    let mut out = bytes[first..].to_vec();
    if out[0] & 0x80 != 0 {
        out.insert(0, 0);
    }
    out
}

pub(crate) fn serial_from_hex(serial: &str) -> Option<SerialNumber> {
    hex::decode(serial).ok().map(SerialNumber::from)
}

/// Sign a complete list for `authority_fingerprint`. The serial set is
/// written in the order given.
pub(crate) fn sign(
    issuer: &Certificate,
    issuer_key: &KeyPair,
    authority_fingerprint: &str,
    crl_number: u64,
    now: DateTime<Utc>,
    entries: &[RevokedEntry],
) -> Result<RevocationListRecord, PkiError> {
    let next_update = now + Duration::days(NEXT_UPDATE_AFTER_DAYS);
    let mut revoked_certs = Vec::with_capacity(entries.len());
    for entry in entries {
        let Some(serial_number) = serial_from_hex(&entry.serial_number) else {
            tracing::warn!(
                "skipping malformed serial {} in revocation list",
                entry.serial_number
            );
            continue;
        };
        revoked_certs.push(RevokedCertParams {
            serial_number,
            revocation_time: to_offset(entry.revoked_at)?,
            reason_code: Some(RevocationReason::Unspecified),
            invalidity_date: None,
        });
    }
    let params = CertificateRevocationListParams {
        this_update: to_offset(now)?,
        next_update: to_offset(next_update)?,
        crl_number: SerialNumber::from(minimal_be_bytes(crl_number)),
        issuing_distribution_point: None,
        revoked_certs,
        key_identifier_method: KeyIdMethod::Sha256,
    };
    let crl = params.signed_by(issuer, issuer_key)?;
    Ok(RevocationListRecord {
        authority_fingerprint: authority_fingerprint.to_string(),
        crl_number,
        crl_pem: crl.pem()?,
        revoked_serials: entries.iter().map(|e| e.serial_number.clone()).collect(),
        this_update: now,
        next_update,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crl_numbers_are_minimal_positive_integers() {
        assert_eq!(minimal_be_bytes(0), vec![0]);
        assert_eq!(minimal_be_bytes(1), vec![1]);
        assert_eq!(minimal_be_bytes(0x80), vec![0, 0x80]);
        assert_eq!(minimal_be_bytes(0x0102), vec![1, 2]);
    }

    #[test]
    fn unsigned_list_revokes_nothing() {
        let list = RevocationList::unsigned(Utc::now());
        assert!(!list.is_signed());
        assert!(list.der().is_none());
        assert!(!list.contains("01"));
        assert_eq!(list.next_update - list.this_update, Duration::days(7));
    }
}
