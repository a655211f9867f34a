use super::payload::{LocationFix, Transition};
use crate::config::UserEntry;
use chrono::Utc;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use aes_gcm::aead::OsRng;
use argon2::password_hash::{self, PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use argon2::{Algorithm, Argon2, Params, Version};
use std::collections::HashMap;
use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// A device as addressed by the topic namespace `root/{user}/{device}`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct DeviceIdentity {
    pub user: String,
    pub device: String,
}

impl DeviceIdentity {
    pub fn new(user: impl Into<String>, device: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            device: device.into(),
        }
    }
}

impl fmt::Display for DeviceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.user, self.device)
    }
}

#[derive(Debug, Error)]
pub enum RecordError {
    #[error("record store unavailable: {0}")]
    Unavailable(String),
    #[error("record rejected: {0}")]
    Rejected(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Encode(#[from] serde_json::Error),
}

/// Persistence for devices, fixes and last-known state.
///
/// Calls are blocking; the domain handler runs them off the async runtime.
pub trait RecordStore: Send + Sync + 'static {
    fn record_location(&self, device: &DeviceIdentity, fix: &LocationFix) -> Result<(), RecordError>;

    fn mark_device_online(
        &self,
        device: &DeviceIdentity,
        online: bool,
        payload: &Value,
    ) -> Result<(), RecordError>;

    fn record_transition(
        &self,
        _device: &DeviceIdentity,
        _transition: &Transition,
    ) -> Result<(), RecordError> {
        Ok(())
    }

    fn record_waypoints(&self, _device: &DeviceIdentity, _waypoints: &Value) -> Result<(), RecordError> {
        Ok(())
    }
}

/// Maps certificate and credential claims to stable user identities.
pub trait UserDirectory: Send + Sync + 'static {
    fn resolve_owner(&self, common_name: &str) -> Option<String>;

    /// Identity for a valid username/password pair, `None` otherwise.
    fn validate_credentials(&self, username: &str, password: &[u8]) -> Option<String>;
}

/// One call observed by [`InMemoryRecordStore`].
#[derive(Debug, Clone, PartialEq)]
pub enum RecordedCall {
    Location {
        device: DeviceIdentity,
        fix: LocationFix,
    },
    Online {
        device: DeviceIdentity,
        online: bool,
        payload: Value,
    },
    Transition {
        device: DeviceIdentity,
        transition: Transition,
    },
    Waypoints {
        device: DeviceIdentity,
        waypoints: Value,
    },
}

#[derive(Debug, Default)]
pub struct InMemoryRecordStore {
    calls: Mutex<Vec<RecordedCall>>,
    online: Mutex<HashMap<DeviceIdentity, bool>>,
}

impl InMemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().clone()
    }

    pub fn locations(&self) -> Vec<(DeviceIdentity, LocationFix)> {
        self.calls
            .lock()
            .iter()
            .filter_map(|c| match c {
                RecordedCall::Location { device, fix } => Some((device.clone(), fix.clone())),
                _ => None,
            })
            .collect()
    }

    /// `(online, payload)` for every online-state change of `device`, in order.
    pub fn online_changes(&self, device: &DeviceIdentity) -> Vec<(bool, Value)> {
        self.calls
            .lock()
            .iter()
            .filter_map(|c| match c {
                RecordedCall::Online {
                    device: d,
                    online,
                    payload,
                } if d == device => Some((*online, payload.clone())),
                _ => None,
            })
            .collect()
    }

    pub fn is_online(&self, device: &DeviceIdentity) -> Option<bool> {
        self.online.lock().get(device).copied()
    }
}

impl RecordStore for InMemoryRecordStore {
    fn record_location(&self, device: &DeviceIdentity, fix: &LocationFix) -> Result<(), RecordError> {
        self.calls.lock().push(RecordedCall::Location {
            device: device.clone(),
            fix: fix.clone(),
        });
        Ok(())
    }

    fn mark_device_online(
        &self,
        device: &DeviceIdentity,
        online: bool,
        payload: &Value,
    ) -> Result<(), RecordError> {
        self.online.lock().insert(device.clone(), online);
        self.calls.lock().push(RecordedCall::Online {
            device: device.clone(),
            online,
            payload: payload.clone(),
        });
        Ok(())
    }

    fn record_transition(
        &self,
        device: &DeviceIdentity,
        transition: &Transition,
    ) -> Result<(), RecordError> {
        self.calls.lock().push(RecordedCall::Transition {
            device: device.clone(),
            transition: transition.clone(),
        });
        Ok(())
    }

    fn record_waypoints(&self, device: &DeviceIdentity, waypoints: &Value) -> Result<(), RecordError> {
        self.calls.lock().push(RecordedCall::Waypoints {
            device: device.clone(),
            waypoints: waypoints.clone(),
        });
        Ok(())
    }
}

#[derive(Serialize)]
struct JournalLine<'a, T: Serialize> {
    at: chrono::DateTime<Utc>,
    kind: &'a str,
    user: &'a str,
    device: &'a str,
    data: T,
}

/// Append-only JSON-lines journal of every record-store call.
pub struct JournalRecordStore {
    path: PathBuf,
    file: Mutex<File>,
}

impl JournalRecordStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, RecordError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            path,
            file: Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn append<T: Serialize>(&self, kind: &str, device: &DeviceIdentity, data: T) -> Result<(), RecordError> {
        let mut line = serde_json::to_vec(&JournalLine {
            at: Utc::now(),
            kind,
            user: &device.user,
            device: &device.device,
            data,
        })?;
        line.push(b'\n');
        let mut file = self.file.lock();
        file.write_all(&line)?;
        file.flush()?;
        Ok(())
    }
}

impl RecordStore for JournalRecordStore {
    fn record_location(&self, device: &DeviceIdentity, fix: &LocationFix) -> Result<(), RecordError> {
        self.append("location", device, fix)
    }

    fn mark_device_online(
        &self,
        device: &DeviceIdentity,
        online: bool,
        payload: &Value,
    ) -> Result<(), RecordError> {
        self.append(
            "online",
            device,
            serde_json::json!({ "online": online, "payload": payload }),
        )
    }

    fn record_transition(
        &self,
        device: &DeviceIdentity,
        transition: &Transition,
    ) -> Result<(), RecordError> {
        self.append("transition", device, transition)
    }

    fn record_waypoints(&self, device: &DeviceIdentity, waypoints: &Value) -> Result<(), RecordError> {
        self.append("waypoints", device, waypoints)
    }
}

/// Argon2id PHC string for `password` under `params`.
pub fn hash_password(password: &[u8], params: Params) -> Result<String, password_hash::Error> {
    let salt = SaltString::generate(&mut OsRng);
    let hasher = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);
    Ok(hasher.hash_password(password, &salt)?.to_string())
}

/// User directory built from configuration. Passwords are held as Argon2
/// PHC strings; verification takes its cost parameters from the string.
#[derive(Debug, Clone)]
pub struct StaticUserDirectory {
    owners: HashMap<String, String>,
    password_hashes: HashMap<String, String>,
    params: Params,
}

impl Default for StaticUserDirectory {
    fn default() -> Self {
        Self::with_params(Params::default())
    }
}

impl StaticUserDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Directory whose `set_password` hashes with `params`.
    pub fn with_params(params: Params) -> Self {
        Self {
            owners: HashMap::new(),
            password_hashes: HashMap::new(),
            params,
        }
    }

    pub fn from_entries(entries: &[UserEntry]) -> Self {
        let mut dir = Self::new();
        for entry in entries {
            dir.add_owner(&entry.identity, &entry.identity);
            for cn in &entry.common_names {
                dir.add_owner(cn, &entry.identity);
            }
            if let Some(hash) = entry.password_hash.as_deref() {
                match PasswordHash::new(hash.trim()) {
                    Ok(_) => {
                        dir.password_hashes
                            .insert(entry.identity.clone(), hash.trim().to_string());
                    }
                    Err(err) => tracing::warn!(
                        identity = %entry.identity,
                        "ignoring malformed password hash: {err}"
                    ),
                }
            }
        }
        dir
    }

    pub fn add_owner(&mut self, common_name: &str, identity: &str) {
        self.owners
            .insert(common_name.to_string(), identity.to_string());
    }

    pub fn set_password(&mut self, identity: &str, password: &[u8]) -> Result<(), password_hash::Error> {
        let hash = hash_password(password, self.params.clone())?;
        self.owners
            .entry(identity.to_string())
            .or_insert_with(|| identity.to_string());
        self.password_hashes.insert(identity.to_string(), hash);
        Ok(())
    }
}

impl UserDirectory for StaticUserDirectory {
    fn resolve_owner(&self, common_name: &str) -> Option<String> {
        self.owners.get(common_name).cloned()
    }

    fn validate_credentials(&self, username: &str, password: &[u8]) -> Option<String> {
        let stored = self.password_hashes.get(username)?;
        let parsed = PasswordHash::new(stored).ok()?;
        match Argon2::default().verify_password(password, &parsed) {
            Ok(()) => Some(username.to_string()),
            Err(password_hash::Error::Password) => None,
            Err(err) => {
                tracing::warn!(identity = username, "password verification failed: {err}");
                None
            }
        }
    }
}
