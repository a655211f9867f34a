use super::crl::{self, RevocationList, RevokedEntry};
use super::seal::KeySealer;
use super::store::{
    AuthorityRecord, ClientCertificateRecord, MaterialStore, PkiState, ServerCertificateRecord,
    StaleWrite,
};
use super::{
    fingerprint, generate_key, signature_algorithm, validate_identity, validate_validity_days,
    PkiError, TrustObserver,
};
use crate::audit;
use crate::config::PkiConfig;
use crate::time::SharedClock;
use chrono::{DateTime, Duration, Utc};
use parking_lot::{Mutex, RwLock};
use rcgen::{
    BasicConstraints, Certificate, CertificateParams, DistinguishedName, DnType,
    ExtendedKeyUsagePurpose, IsCa, KeyPair, KeyUsagePurpose,
};
use rustls::pki_types::{
    CertificateDer, CertificateRevocationListDer, PrivateKeyDer, PrivatePkcs8KeyDer,
};
use serde::Serialize;
use std::collections::HashSet;
use std::fmt;
use std::net::{IpAddr, ToSocketAddrs, UdpSocket};
use std::sync::Arc;
use zeroize::Zeroizing;

const ORGANIZATION: &str = "Locus";

#[derive(Debug, Clone, Serialize)]
pub struct AuthoritySummary {
    pub subject: String,
    pub fingerprint: String,
    pub key_size: u32,
    pub not_before: DateTime<Utc>,
    pub not_after: DateTime<Utc>,
    pub is_active: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct ServerCertificateSummary {
    pub common_name: String,
    pub subject_alt_names: Vec<String>,
    pub fingerprint: String,
    pub authority_fingerprint: String,
    pub key_size: u32,
    pub not_before: DateTime<Utc>,
    pub not_after: DateTime<Utc>,
    pub is_active: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct ClientCertificateSummary {
    pub owner_identity: String,
    pub common_name: String,
    pub serial_number: String,
    pub fingerprint: String,
    pub authority_fingerprint: String,
    pub key_size: u32,
    pub not_before: DateTime<Utc>,
    pub not_after: DateTime<Utc>,
    pub revoked: bool,
    pub revoked_at: Option<DateTime<Utc>>,
}

/// Material handed to the client once; the private key is not retrievable
/// again in plaintext.
pub struct IssuedClientCertificate {
    pub owner_identity: String,
    pub serial_number: String,
    pub fingerprint: String,
    pub cert_pem: String,
    pub key_pem: Zeroizing<String>,
    pub authority_pem: String,
    pub not_after: DateTime<Utc>,
}

impl fmt::Debug for IssuedClientCertificate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IssuedClientCertificate")
            .field("owner_identity", &self.owner_identity)
            .field("serial_number", &self.serial_number)
            .field("fingerprint", &self.fingerprint)
            .field("key_pem", &"[REDACTED]")
            .field("not_after", &self.not_after)
            .finish_non_exhaustive()
    }
}

/// Decrypted listener material for one TLS configuration build.
pub struct TrustMaterial {
    pub authority: CertificateDer<'static>,
    pub server_chain: Vec<CertificateDer<'static>>,
    pub server_key: PrivateKeyDer<'static>,
    pub crl: Option<CertificateRevocationListDer<'static>>,
    pub authority_fingerprint: String,
    pub server_fingerprint: String,
}

/// Owns the persisted PKI state. Every mutation is persisted before it is
/// committed in memory, and observers are told about it afterwards.
///
/// The store is the source of truth: each mutation starts from the stored
/// document, and [`PkiManager::reload`] picks up writes made by another
/// manager on the same store.
pub struct PkiManager {
    store: Arc<dyn MaterialStore>,
    sealer: KeySealer,
    clock: SharedClock,
    state: Mutex<PkiState>,
    observers: RwLock<Vec<Arc<dyn TrustObserver>>>,
}

impl PkiManager {
    pub fn open(
        store: Arc<dyn MaterialStore>,
        sealer: KeySealer,
        clock: SharedClock,
    ) -> Result<Self, PkiError> {
        let state = store.load().map_err(store_error)?;
        tracing::debug!(
            generation = state.generation,
            authorities = state.authorities.len(),
            server_certificates = state.server_certificates.len(),
            client_certificates = state.client_certificates.len(),
            "loaded pki material"
        );
        Ok(Self {
            store,
            sealer,
            clock,
            state: Mutex::new(state),
            observers: RwLock::new(Vec::new()),
        })
    }

    /// Register an observer. Registering the same observer twice is a no-op.
    pub fn add_observer(&self, observer: Arc<dyn TrustObserver>) {
        let mut observers = self.observers.write();
        if observers.iter().any(|o| same_observer(o, &observer)) {
            return;
        }
        observers.push(observer);
    }

    pub fn observer_count(&self) -> usize {
        self.observers.read().len()
    }

    fn notify(&self) {
        let observers = self.observers.read().clone();
        for observer in observers {
            observer.trust_changed(self);
        }
    }

    /// Generation of the state this manager currently serves.
    pub fn generation(&self) -> u64 {
        self.state.lock().generation
    }

    /// Re-read the store and publish it when another writer changed it.
    /// Returns whether anything changed.
    pub fn reload(&self) -> Result<bool, PkiError> {
        let changed = {
            let mut guard = self.state.lock();
            let stored = self.store.load().map_err(store_error)?;
            if stored.generation == guard.generation {
                false
            } else {
                tracing::info!(
                    from = guard.generation,
                    to = stored.generation,
                    "pki material changed in the store; reloading"
                );
                *guard = stored;
                true
            }
        };
        if changed {
            audit::emit("pki_material_reloaded", "system", "-", "store changed");
            self.notify();
        }
        Ok(changed)
    }

    /// Apply `f` to the stored state, persist it under the next generation,
    /// then adopt it. Observers hear about external changes picked up on the
    /// way.
    fn mutate<T>(
        &self,
        f: impl FnOnce(&mut PkiState, DateTime<Utc>) -> Result<T, PkiError>,
    ) -> Result<T, PkiError> {
        let (result, refreshed) = {
            let mut guard = self.state.lock();
            let stored = self.store.load().map_err(store_error)?;
            let refreshed = stored.generation != guard.generation;
            if refreshed {
                *guard = stored.clone();
            }
            let base = stored.generation;
            let mut next = stored;
            let result = f(&mut next, self.clock.utc_now()).and_then(|out| {
                next.generation = base.wrapping_add(1);
                self.store.save(&next, base).map_err(store_error)?;
                Ok(out)
            });
            if result.is_ok() {
                *guard = next;
            }
            (result, refreshed)
        };
        if refreshed {
            self.notify();
        }
        result
    }

    fn load_issuer(&self, authority: &AuthorityRecord) -> Result<(Certificate, KeyPair), PkiError> {
        let key_pem = self.sealer.unseal_pem(&authority.sealed_key_pem)?;
        let key = KeyPair::from_pem(&key_pem)?;
        let cert = CertificateParams::from_ca_cert_pem(&authority.cert_pem)?.self_signed(&key)?;
        Ok((cert, key))
    }

    fn sign_crl_for(
        &self,
        state: &mut PkiState,
        authority: &AuthorityRecord,
        now: DateTime<Utc>,
    ) -> Result<(), PkiError> {
        let (issuer, issuer_key) = self.load_issuer(authority)?;
        let mut entries: Vec<RevokedEntry> = state
            .client_certificates
            .iter()
            .filter(|c| {
                c.revoked
                    && c.authority_fingerprint == authority.fingerprint
                    && !c.is_expired(now)
            })
            .map(|c| RevokedEntry {
                serial_number: c.serial_number.clone(),
                revoked_at: c.revoked_at.unwrap_or(now),
            })
            .collect();
        entries.sort_by(|a, b| a.serial_number.cmp(&b.serial_number));
        state.crl_counter = state.crl_counter.saturating_add(1);
        let record = crl::sign(
            &issuer,
            &issuer_key,
            &authority.fingerprint,
            state.crl_counter,
            now,
            &entries,
        )?;
        state.revocation_list = Some(record);
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Authority
    // ---------------------------------------------------------------------

    pub fn generate_authority(
        &self,
        subject: &str,
        validity_days: u32,
        key_size: u32,
    ) -> Result<AuthoritySummary, PkiError> {
        validate_validity_days(validity_days)?;
        signature_algorithm(key_size)?;
        if subject.trim().is_empty() {
            return Err(PkiError::InvalidParameter("authority subject is empty".into()));
        }
        let summary = self.mutate(|state, now| {
            let key = generate_key(key_size)?;
            let not_after = now + Duration::days(i64::from(validity_days));
            let mut params = CertificateParams::default();
            params.distinguished_name = distinguished_name(subject);
            params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
            params.key_usages = vec![
                KeyUsagePurpose::KeyCertSign,
                KeyUsagePurpose::CrlSign,
                KeyUsagePurpose::DigitalSignature,
            ];
            params.not_before = crl::to_offset(now)?;
            params.not_after = crl::to_offset(not_after)?;
            let cert = params.self_signed(&key)?;
            let record = AuthorityRecord {
                subject: subject.to_string(),
                cert_pem: cert.pem(),
                sealed_key_pem: self.sealer.seal(key.serialize_pem().as_bytes())?,
                key_size,
                fingerprint: fingerprint(cert.der()),
                not_before: now,
                not_after,
                is_active: true,
                created_at: now,
            };
            for previous in state.authorities.iter_mut() {
                previous.is_active = false;
            }
            self.sign_crl_for(state, &record, now)?;
            if state
                .active_server_certificate()
                .is_some_and(|s| s.authority_fingerprint != record.fingerprint)
            {
                tracing::warn!(
                    "active server certificate was issued by a previous authority; \
                     generate a new one so clients can verify the listener"
                );
            }
            let summary = authority_summary(&record);
            state.authorities.push(record);
            Ok(summary)
        })?;
        tracing::info!(
            subject,
            fingerprint = %summary.fingerprint,
            "generated certificate authority"
        );
        audit::emit(
            "pki_authority_generated",
            "system",
            "-",
            &summary.fingerprint,
        );
        self.notify();
        Ok(summary)
    }

    pub fn list_authorities(&self) -> Vec<AuthoritySummary> {
        self.state
            .lock()
            .authorities
            .iter()
            .map(authority_summary)
            .collect()
    }

    pub fn active_authority_pem(&self) -> Result<String, PkiError> {
        self.state
            .lock()
            .active_authority()
            .map(|a| a.cert_pem.clone())
            .ok_or(PkiError::NoActiveAuthority)
    }

    pub fn delete_authority(&self, fingerprint: &str) -> Result<(), PkiError> {
        self.mutate(|state, _| {
            let idx = state
                .authorities
                .iter()
                .position(|a| a.fingerprint == fingerprint)
                .ok_or_else(|| PkiError::NotFound(format!("authority {fingerprint}")))?;
            if state.authorities[idx].is_active {
                return Err(PkiError::NotDeletable(format!("authority {fingerprint}")));
            }
            state.authorities.remove(idx);
            Ok(())
        })?;
        audit::emit("pki_record_deleted", "system", "-", fingerprint);
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Server certificate
    // ---------------------------------------------------------------------

    pub fn generate_server_certificate(
        &self,
        common_name: &str,
        validity_days: u32,
        key_size: u32,
        extra_sans: &[String],
    ) -> Result<ServerCertificateSummary, PkiError> {
        validate_validity_days(validity_days)?;
        signature_algorithm(key_size)?;
        if common_name.trim().is_empty() {
            return Err(PkiError::InvalidParameter("server common name is empty".into()));
        }
        let sans = merge_subject_alt_names(local_subject_alt_names(), extra_sans);
        if sans.is_empty() {
            return Err(PkiError::InvalidParameter(
                "server certificate has no subject alternative names".into(),
            ));
        }
        let summary = self.mutate(|state, now| {
            let authority = state
                .active_authority()
                .cloned()
                .ok_or(PkiError::NoActiveAuthority)?;
            let (issuer, issuer_key) = self.load_issuer(&authority)?;
            let key = generate_key(key_size)?;
            let not_after = clamp_to_authority(
                now + Duration::days(i64::from(validity_days)),
                &authority,
            );
            let mut params = CertificateParams::new(sans.clone())?;
            params.distinguished_name = distinguished_name(common_name);
            params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
            params.key_usages = vec![
                KeyUsagePurpose::DigitalSignature,
                KeyUsagePurpose::KeyEncipherment,
            ];
            params.use_authority_key_identifier_extension = true;
            params.not_before = crl::to_offset(now)?;
            params.not_after = crl::to_offset(not_after)?;
            let cert = params.signed_by(&key, &issuer, &issuer_key)?;
            let record = ServerCertificateRecord {
                common_name: common_name.to_string(),
                subject_alt_names: sans.clone(),
                cert_pem: cert.pem(),
                sealed_key_pem: self.sealer.seal(key.serialize_pem().as_bytes())?,
                key_size,
                fingerprint: fingerprint(cert.der()),
                authority_fingerprint: authority.fingerprint.clone(),
                not_before: now,
                not_after,
                is_active: true,
                created_at: now,
            };
            for previous in state.server_certificates.iter_mut() {
                previous.is_active = false;
            }
            let summary = server_summary(&record);
            state.server_certificates.push(record);
            Ok(summary)
        })?;
        tracing::info!(
            common_name,
            sans = ?summary.subject_alt_names,
            fingerprint = %summary.fingerprint,
            "generated server certificate"
        );
        audit::emit(
            "pki_server_certificate_generated",
            "system",
            "-",
            &summary.fingerprint,
        );
        self.notify();
        Ok(summary)
    }

    pub fn list_server_certificates(&self) -> Vec<ServerCertificateSummary> {
        self.state
            .lock()
            .server_certificates
            .iter()
            .map(server_summary)
            .collect()
    }

    pub fn delete_server_certificate(&self, fingerprint: &str) -> Result<(), PkiError> {
        self.mutate(|state, _| {
            let idx = state
                .server_certificates
                .iter()
                .position(|s| s.fingerprint == fingerprint)
                .ok_or_else(|| PkiError::NotFound(format!("server certificate {fingerprint}")))?;
            if state.server_certificates[idx].is_active {
                return Err(PkiError::NotDeletable(format!(
                    "server certificate {fingerprint}"
                )));
            }
            state.server_certificates.remove(idx);
            Ok(())
        })?;
        audit::emit("pki_record_deleted", "system", "-", fingerprint);
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Client certificates
    // ---------------------------------------------------------------------

    pub fn issue_client_certificate(
        &self,
        owner_identity: &str,
        validity_days: u32,
        key_size: u32,
    ) -> Result<IssuedClientCertificate, PkiError> {
        validate_identity(owner_identity)?;
        validate_validity_days(validity_days)?;
        signature_algorithm(key_size)?;
        let issued = self.mutate(|state, now| {
            let authority = state
                .active_authority()
                .cloned()
                .ok_or(PkiError::NoActiveAuthority)?;
            if let Some(existing) = state.client_certificates.iter().find(|c| {
                c.owner_identity == owner_identity
                    && c.authority_fingerprint == authority.fingerprint
                    && !c.revoked
                    && !c.is_expired(now)
            }) {
                return Err(PkiError::DuplicateActiveCertificate {
                    owner: owner_identity.to_string(),
                    serial: existing.serial_number.clone(),
                });
            }
            let serial_number = fresh_serial(state);
            let serial = crl::serial_from_hex(&serial_number).ok_or_else(|| {
                PkiError::InvalidParameter(format!("serial {serial_number} is not hex"))
            })?;
            let (issuer, issuer_key) = self.load_issuer(&authority)?;
            let key = generate_key(key_size)?;
            let not_after = clamp_to_authority(
                now + Duration::days(i64::from(validity_days)),
                &authority,
            );
            let mut params = CertificateParams::default();
            params.distinguished_name = distinguished_name(&client_common_name(owner_identity));
            params.serial_number = Some(serial);
            params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ClientAuth];
            params.key_usages = vec![KeyUsagePurpose::DigitalSignature];
            params.use_authority_key_identifier_extension = true;
            params.not_before = crl::to_offset(now)?;
            params.not_after = crl::to_offset(not_after)?;
            let cert = params.signed_by(&key, &issuer, &issuer_key)?;
            let key_pem = Zeroizing::new(key.serialize_pem());
            let record = ClientCertificateRecord {
                owner_identity: owner_identity.to_string(),
                common_name: client_common_name(owner_identity),
                serial_number: serial_number.clone(),
                cert_pem: cert.pem(),
                sealed_key_pem: self.sealer.seal(key_pem.as_bytes())?,
                key_size,
                fingerprint: fingerprint(cert.der()),
                authority_fingerprint: authority.fingerprint.clone(),
                not_before: now,
                not_after,
                revoked: false,
                revoked_at: None,
                created_at: now,
            };
            let issued = IssuedClientCertificate {
                owner_identity: owner_identity.to_string(),
                serial_number,
                fingerprint: record.fingerprint.clone(),
                cert_pem: record.cert_pem.clone(),
                key_pem,
                authority_pem: authority.cert_pem.clone(),
                not_after,
            };
            state.client_certificates.push(record);
            Ok(issued)
        })?;
        tracing::info!(
            owner = owner_identity,
            serial = %issued.serial_number,
            "issued client certificate"
        );
        audit::emit(
            "pki_client_certificate_issued",
            owner_identity,
            "-",
            &issued.serial_number,
        );
        Ok(issued)
    }

    pub fn revoke_client_certificate(&self, serial_number: &str) -> Result<RevocationList, PkiError> {
        let serial_number = serial_number.to_ascii_lowercase();
        let (owner, list) = self.mutate(|state, now| {
            let cert = state
                .client_certificates
                .iter_mut()
                .find(|c| c.serial_number == serial_number && !c.revoked)
                .ok_or_else(|| PkiError::NotFound(format!("client certificate {serial_number}")))?;
            cert.revoked = true;
            cert.revoked_at = Some(now);
            let owner = cert.owner_identity.clone();
            if let Some(authority) = state.active_authority().cloned() {
                self.sign_crl_for(state, &authority, now)?;
            }
            let list = state
                .revocation_list
                .as_ref()
                .map(RevocationList::from)
                .unwrap_or_else(|| RevocationList::unsigned(now));
            Ok((owner, list))
        })?;
        tracing::info!(owner = %owner, serial = %serial_number, "revoked client certificate");
        audit::emit(
            "pki_client_certificate_revoked",
            &owner,
            "-",
            &serial_number,
        );
        self.notify();
        Ok(list)
    }

    pub fn list_client_certificates(&self, owner: Option<&str>) -> Vec<ClientCertificateSummary> {
        self.state
            .lock()
            .client_certificates
            .iter()
            .filter(|c| owner.map_or(true, |o| c.owner_identity == o))
            .map(client_summary)
            .collect()
    }

    pub fn delete_client_certificate(&self, serial_number: &str) -> Result<(), PkiError> {
        let serial_number = serial_number.to_ascii_lowercase();
        self.mutate(|state, _| {
            let idx = state
                .client_certificates
                .iter()
                .position(|c| c.serial_number == serial_number)
                .ok_or_else(|| PkiError::NotFound(format!("client certificate {serial_number}")))?;
            if !state.client_certificates[idx].revoked {
                return Err(PkiError::NotDeletable(format!(
                    "client certificate {serial_number}"
                )));
            }
            state.client_certificates.remove(idx);
            Ok(())
        })?;
        audit::emit("pki_record_deleted", "system", "-", &serial_number);
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Revocation list
    // ---------------------------------------------------------------------

    /// The list currently enforced by the listener. Never fails: without an
    /// authority the result is an unsigned, empty list.
    pub fn current_revocation_list(&self) -> RevocationList {
        let now = self.clock.utc_now();
        {
            let state = self.state.lock();
            let Some(authority) = state.active_authority() else {
                return RevocationList::unsigned(now);
            };
            if let Some(record) = state
                .revocation_list
                .as_ref()
                .filter(|r| r.authority_fingerprint == authority.fingerprint)
            {
                return RevocationList::from(record);
            }
        }
        match self.regenerate_revocation_list() {
            Ok(list) => list,
            Err(err) => {
                tracing::warn!("unable to sign revocation list: {err}");
                RevocationList::unsigned(now)
            }
        }
    }

    pub fn regenerate_revocation_list(&self) -> Result<RevocationList, PkiError> {
        let list = self.mutate(|state, now| {
            let authority = state
                .active_authority()
                .cloned()
                .ok_or(PkiError::NoActiveAuthority)?;
            self.sign_crl_for(state, &authority, now)?;
            Ok(state
                .revocation_list
                .as_ref()
                .map(RevocationList::from)
                .unwrap_or_else(|| RevocationList::unsigned(now)))
        })?;
        tracing::debug!(
            crl_number = list.crl_number,
            revoked = list.revoked_serials.len(),
            "regenerated revocation list"
        );
        self.notify();
        Ok(list)
    }

    // ---------------------------------------------------------------------
    // Listener material
    // ---------------------------------------------------------------------

    /// Decrypt the active listener identity together with its trust anchor
    /// and revocation list.
    pub fn trust_material(&self) -> Result<TrustMaterial, PkiError> {
        let (authority, server) = {
            let state = self.state.lock();
            let authority = state
                .active_authority()
                .cloned()
                .ok_or(PkiError::NoActiveAuthority)?;
            let server = state
                .active_server_certificate()
                .cloned()
                .ok_or_else(|| PkiError::NotFound("active server certificate".into()))?;
            (authority, server)
        };
        let crl = self.current_revocation_list().der();
        let authority_der = first_certificate(&authority.cert_pem)?;
        let server_der = first_certificate(&server.cert_pem)?;
        let key_pem = self.sealer.unseal_pem(&server.sealed_key_pem)?;
        let key = KeyPair::from_pem(&key_pem)?;
        let server_key =
            PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key.serialize_der()));
        let mut server_chain = vec![server_der];
        if server.authority_fingerprint == authority.fingerprint {
            server_chain.push(authority_der.clone());
        }
        Ok(TrustMaterial {
            authority: authority_der,
            server_chain,
            server_key,
            crl,
            authority_fingerprint: authority.fingerprint,
            server_fingerprint: server.fingerprint,
        })
    }

    /// Create whatever the listener needs to start: an authority when none
    /// is active, and a server certificate issued by it.
    pub fn ensure_bootstrap(&self, cfg: &PkiConfig) -> Result<(), PkiError> {
        let (has_authority, server_current) = {
            let state = self.state.lock();
            let authority = state.active_authority().map(|a| a.fingerprint.clone());
            let server_current = match (&authority, state.active_server_certificate()) {
                (Some(fp), Some(server)) => &server.authority_fingerprint == fp,
                _ => false,
            };
            (authority.is_some(), server_current)
        };
        if !has_authority {
            tracing::info!("no active certificate authority; generating one");
            self.generate_authority(
                &cfg.authority_subject,
                cfg.authority_validity_days,
                cfg.key_size,
            )?;
        }
        if !server_current {
            tracing::info!("no current server certificate; generating one");
            self.generate_server_certificate(
                &cfg.server_common_name,
                cfg.server_validity_days,
                cfg.key_size,
                &cfg.extra_sans,
            )?;
        }
        Ok(())
    }
}

fn store_error(err: anyhow::Error) -> PkiError {
    match err.downcast_ref::<StaleWrite>() {
        Some(stale) => PkiError::Conflict {
            expected: stale.expected,
            found: stale.found,
        },
        None => PkiError::Store(format!("{err:#}")),
    }
}

fn same_observer(a: &Arc<dyn TrustObserver>, b: &Arc<dyn TrustObserver>) -> bool {
    std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
}

/// Common name for a client certificate. The identity is used verbatim so
/// the reverse mapping is the identity itself.
pub fn client_common_name(owner_identity: &str) -> String {
    owner_identity.to_string()
}

fn distinguished_name(common_name: &str) -> DistinguishedName {
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, common_name);
    dn.push(DnType::OrganizationName, ORGANIZATION);
    dn
}

fn clamp_to_authority(not_after: DateTime<Utc>, authority: &AuthorityRecord) -> DateTime<Utc> {
    not_after.min(authority.not_after)
}

fn first_certificate(pem: &str) -> Result<CertificateDer<'static>, PkiError> {
    rustls_pemfile::certs(&mut pem.as_bytes())
        .next()
        .and_then(Result::ok)
        .ok_or_else(|| PkiError::InvalidParameter("stored certificate PEM is unreadable".into()))
}

/// 127 random bits, rendered as lowercase hex, unique within the store.
fn fresh_serial(state: &PkiState) -> String {
    loop {
        let mut bytes = *uuid::Uuid::new_v4().as_bytes();
        bytes[0] &= 0x7F;
        if bytes[0] == 0 {
            bytes[0] = 0x01;
        }
        let serial = hex::encode(bytes);
        if !state.serial_in_use(&serial) {
            return serial;
        }
    }
}

fn authority_summary(record: &AuthorityRecord) -> AuthoritySummary {
    AuthoritySummary {
        subject: record.subject.clone(),
        fingerprint: record.fingerprint.clone(),
        key_size: record.key_size,
        not_before: record.not_before,
        not_after: record.not_after,
        is_active: record.is_active,
    }
}

fn server_summary(record: &ServerCertificateRecord) -> ServerCertificateSummary {
    ServerCertificateSummary {
        common_name: record.common_name.clone(),
        subject_alt_names: record.subject_alt_names.clone(),
        fingerprint: record.fingerprint.clone(),
        authority_fingerprint: record.authority_fingerprint.clone(),
        key_size: record.key_size,
        not_before: record.not_before,
        not_after: record.not_after,
        is_active: record.is_active,
    }
}

fn client_summary(record: &ClientCertificateRecord) -> ClientCertificateSummary {
    ClientCertificateSummary {
        owner_identity: record.owner_identity.clone(),
        common_name: record.common_name.clone(),
        serial_number: record.serial_number.clone(),
        fingerprint: record.fingerprint.clone(),
        authority_fingerprint: record.authority_fingerprint.clone(),
        key_size: record.key_size,
        not_before: record.not_before,
        not_after: record.not_after,
        revoked: record.revoked,
        revoked_at: record.revoked_at,
    }
}

/// Names this host is reachable under: loopback, the host name and what it
/// resolves to, and the address of the default outbound interface.
pub fn local_subject_alt_names() -> Vec<String> {
    let mut names = vec![
        "localhost".to_string(),
        "127.0.0.1".to_string(),
        "::1".to_string(),
    ];
    if let Some(host) = hostname::get().ok().and_then(|h| h.into_string().ok()) {
        if !host.is_empty() && host.is_ascii() {
            if let Ok(addrs) = (host.as_str(), 0).to_socket_addrs() {
                names.extend(addrs.map(|a| a.ip().to_string()));
            }
            names.push(host);
        }
    }
    // Connecting a UDP socket only selects a route; nothing is sent.
    for (bind, target) in [("0.0.0.0:0", "192.0.2.1:9"), ("[::]:0", "[2001:db8::1]:9")] {
        if let Some(ip) = outbound_address(bind, target) {
            names.push(ip.to_string());
        }
    }
    names
}

fn outbound_address(bind: &str, target: &str) -> Option<IpAddr> {
    let socket = UdpSocket::bind(bind).ok()?;
    socket.connect(target).ok()?;
    let ip = socket.local_addr().ok()?.ip();
    (!ip.is_unspecified()).then_some(ip)
}

/// Merge auto-derived and operator-supplied names, keeping first-seen order.
pub fn merge_subject_alt_names(derived: Vec<String>, extra: &[String]) -> Vec<String> {
    let mut seen = HashSet::new();
    derived
        .into_iter()
        .chain(extra.iter().cloned())
        .map(|name| name.trim().to_string())
        .filter(|name| !name.is_empty())
        .filter(|name| seen.insert(name.to_ascii_lowercase()))
        .collect()
}
