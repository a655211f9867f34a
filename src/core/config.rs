use crate::ops::telemetry::LogFormat;
use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const CONFIG_ENV: &str = "LOCUS_CONFIG";
pub const SECRET_ENV: &str = "LOCUS_SECRET";
pub const PLAIN_PORT_ENV: &str = "LOCUS_PLAIN_PORT";
pub const TLS_PORT_ENV: &str = "LOCUS_TLS_PORT";
const DEFAULT_CONFIG_PATH: &str = "config/locus.toml";

/// Top-level configuration for the Locus runtime.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub broker: BrokerConfig,
    #[serde(default)]
    pub listeners: ListenerConfig,
    #[serde(default)]
    pub pki: PkiConfig,
    #[serde(default)]
    pub domain: DomainConfig,
    #[serde(default)]
    pub telemetry: TelemetryConfig,
    #[serde(default)]
    pub users: Vec<UserEntry>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BrokerConfig {
    /// First topic level of every device topic.
    #[serde(default = "default_topic_root")]
    pub topic_root: String,
    #[serde(default)]
    pub allow_anonymous: bool,
    #[serde(default = "default_max_packet_size")]
    pub max_packet_size: usize,
    /// Per-session bound on queued outbound deliveries.
    #[serde(default = "default_outbound_queue")]
    pub outbound_queue: usize,
    #[serde(default = "default_retry_base_ms")]
    pub retry_base_ms: u64,
    #[serde(default = "default_retry_max_ms")]
    pub retry_max_ms: u64,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            topic_root: default_topic_root(),
            allow_anonymous: false,
            max_packet_size: default_max_packet_size(),
            outbound_queue: default_outbound_queue(),
            retry_base_ms: default_retry_base_ms(),
            retry_max_ms: default_retry_max_ms(),
        }
    }
}

impl BrokerConfig {
    pub fn retry_base(&self) -> Duration {
        Duration::from_millis(self.retry_base_ms)
    }

    pub fn retry_max(&self) -> Duration {
        Duration::from_millis(self.retry_max_ms.max(self.retry_base_ms))
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ListenerConfig {
    #[serde(default = "default_bind_host")]
    pub bind_host: String,
    /// Negative disables the listener, `0` asks the OS for a port.
    #[serde(default = "default_plain_port")]
    pub plain_port: i64,
    #[serde(default = "default_tls_port")]
    pub tls_port: i64,
    /// MQTT over WebSocket, for browser clients.
    #[serde(default = "default_ws_port")]
    pub ws_port: i64,
    #[serde(default = "default_true")]
    pub require_client_certificate: bool,
    #[serde(default = "default_drain_grace_ms")]
    pub drain_grace_ms: u64,
    /// Where bound ports are published for co-located tooling.
    #[serde(default)]
    pub runtime_file: Option<PathBuf>,
    #[serde(default)]
    pub alpn: Vec<String>,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            bind_host: default_bind_host(),
            plain_port: default_plain_port(),
            tls_port: default_tls_port(),
            ws_port: default_ws_port(),
            require_client_certificate: true,
            drain_grace_ms: default_drain_grace_ms(),
            runtime_file: None,
            alpn: Vec::new(),
        }
    }
}

impl ListenerConfig {
    pub fn plain(&self) -> Result<PortSetting> {
        PortSetting::from_raw(self.plain_port).context("listeners.plain_port")
    }

    pub fn tls(&self) -> Result<PortSetting> {
        PortSetting::from_raw(self.tls_port).context("listeners.tls_port")
    }

    pub fn ws(&self) -> Result<PortSetting> {
        PortSetting::from_raw(self.ws_port).context("listeners.ws_port")
    }

    pub fn drain_grace(&self) -> Duration {
        Duration::from_millis(self.drain_grace_ms)
    }
}

/// Port selection for one listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortSetting {
    Disabled,
    Ephemeral,
    Fixed(u16),
}

impl PortSetting {
    pub fn from_raw(raw: i64) -> Result<Self> {
        match raw {
            r if r < 0 => Ok(Self::Disabled),
            0 => Ok(Self::Ephemeral),
            r => u16::try_from(r)
                .map(Self::Fixed)
                .with_context(|| format!("port {r} is above 65535")),
        }
    }

    /// Port to hand to `bind`, or `None` when disabled.
    pub fn bind_port(self) -> Option<u16> {
        match self {
            Self::Disabled => None,
            Self::Ephemeral => Some(0),
            Self::Fixed(port) => Some(port),
        }
    }
}

/// Application secret; never printed.
#[derive(Clone, Default, Deserialize)]
#[serde(transparent)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[REDACTED]")
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PkiConfig {
    #[serde(default = "default_store_path")]
    pub store_path: PathBuf,
    #[serde(default)]
    pub secret: Secret,
    /// Create an authority and server certificate at startup when missing.
    #[serde(default = "default_true")]
    pub bootstrap: bool,
    #[serde(default = "default_authority_subject")]
    pub authority_subject: String,
    #[serde(default = "default_authority_validity_days")]
    pub authority_validity_days: u32,
    #[serde(default = "default_server_common_name")]
    pub server_common_name: String,
    #[serde(default = "default_server_validity_days")]
    pub server_validity_days: u32,
    #[serde(default = "default_client_validity_days")]
    pub client_validity_days: u32,
    #[serde(default = "default_key_size")]
    pub key_size: u32,
    #[serde(default)]
    pub extra_sans: Vec<String>,
    /// How often a running broker re-reads the store; `0` disables it.
    #[serde(default = "default_reload_interval_ms")]
    pub reload_interval_ms: u64,
}

impl PkiConfig {
    pub fn reload_interval(&self) -> Option<Duration> {
        (self.reload_interval_ms > 0).then(|| Duration::from_millis(self.reload_interval_ms))
    }
}

impl Default for PkiConfig {
    fn default() -> Self {
        Self {
            store_path: default_store_path(),
            secret: Secret::default(),
            bootstrap: true,
            authority_subject: default_authority_subject(),
            authority_validity_days: default_authority_validity_days(),
            server_common_name: default_server_common_name(),
            server_validity_days: default_server_validity_days(),
            client_validity_days: default_client_validity_days(),
            key_size: default_key_size(),
            extra_sans: Vec::new(),
            reload_interval_ms: default_reload_interval_ms(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DomainConfig {
    /// Bound on record-store calls waiting for the worker.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    #[serde(default = "default_max_future_skew_secs")]
    pub max_future_skew_secs: i64,
    /// JSON-lines journal used by the binary's record store.
    #[serde(default = "default_journal_path")]
    pub journal_path: PathBuf,
}

impl Default for DomainConfig {
    fn default() -> Self {
        Self {
            queue_capacity: default_queue_capacity(),
            max_future_skew_secs: default_max_future_skew_secs(),
            journal_path: default_journal_path(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct TelemetryConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub log_format: LogFormat,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_format: LogFormat::default(),
        }
    }
}

/// Static user directory entry.
#[derive(Debug, Clone, Deserialize)]
pub struct UserEntry {
    pub identity: String,
    /// Certificate common names owned by this identity besides the identity itself.
    #[serde(default)]
    pub common_names: Vec<String>,
    /// Argon2 PHC string of the MQTT password; absent disables the
    /// credential path.
    #[serde(default)]
    pub password_hash: Option<String>,
}

impl Config {
    /// Load configuration from a path resolved via LOCUS_CONFIG or defaults to `config/locus.toml`.
    /// Applies LOCUS_SECRET, LOCUS_PLAIN_PORT and LOCUS_TLS_PORT after parsing.
    pub fn load_from_env() -> Result<Self> {
        let path = env_config_path();
        let mut cfg = Self::load(&path)?;
        cfg.apply_env_overrides()?;
        Ok(cfg)
    }

    /// Load configuration from a specific file (TOML or JSON based on extension).
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path_ref = path.as_ref();
        let data = fs::read_to_string(path_ref)
            .with_context(|| format!("unable to read config {}", path_ref.display()))?;
        if is_json(path_ref) {
            Ok(serde_json::from_str(&data)
                .with_context(|| format!("invalid JSON config {}", path_ref.display()))?)
        } else {
            Ok(toml::from_str(&data)
                .with_context(|| format!("invalid TOML config {}", path_ref.display()))?)
        }
    }

    pub fn apply_env_overrides(&mut self) -> Result<()> {
        if let Ok(secret) = std::env::var(SECRET_ENV) {
            self.pki.secret = Secret::new(secret);
        }
        if let Ok(port) = std::env::var(PLAIN_PORT_ENV) {
            self.listeners.plain_port = port
                .trim()
                .parse()
                .with_context(|| format!("{PLAIN_PORT_ENV}={port} is not an integer"))?;
        }
        if let Ok(port) = std::env::var(TLS_PORT_ENV) {
            self.listeners.tls_port = port
                .trim()
                .parse()
                .with_context(|| format!("{TLS_PORT_ENV}={port} is not an integer"))?;
        }
        Ok(())
    }

    /// Validate schema-level invariants before startup.
    pub fn validate(&self) -> Result<()> {
        if self.pki.secret.is_empty() {
            bail!("pki.secret must be set (or provide {SECRET_ENV})");
        }
        let ports = [
            ("plain_port", self.listeners.plain()?),
            ("tls_port", self.listeners.tls()?),
            ("ws_port", self.listeners.ws()?),
        ];
        for (i, (name, setting)) in ports.iter().enumerate() {
            for (other, other_setting) in &ports[i + 1..] {
                if let (PortSetting::Fixed(a), PortSetting::Fixed(b)) = (setting, other_setting) {
                    if a == b {
                        bail!("listeners.{name} and listeners.{other} are both {a}");
                    }
                }
            }
        }
        let root = &self.broker.topic_root;
        if root.is_empty() || root.contains(['/', '+', '#']) {
            bail!("broker.topic_root {root:?} must be a single topic level");
        }
        if self.broker.outbound_queue == 0 {
            bail!("broker.outbound_queue must be > 0");
        }
        if self.broker.retry_base_ms == 0 {
            bail!("broker.retry_base_ms must be > 0");
        }
        if self.domain.queue_capacity == 0 {
            bail!("domain.queue_capacity must be > 0");
        }
        if !(0..=MAX_FUTURE_SKEW_SECS).contains(&self.domain.max_future_skew_secs) {
            bail!(
                "domain.max_future_skew_secs must be between 0 and {MAX_FUTURE_SKEW_SECS}"
            );
        }
        crate::pki::signature_algorithm(self.pki.key_size)?;
        for days in [
            self.pki.authority_validity_days,
            self.pki.server_validity_days,
            self.pki.client_validity_days,
        ] {
            crate::pki::validate_validity_days(days)?;
        }
        for user in &self.users {
            crate::pki::validate_identity(&user.identity)
                .with_context(|| format!("users entry {:?}", user.identity))?;
            if let Some(hash) = &user.password_hash {
                if let Err(err) = argon2::PasswordHash::new(hash.trim()) {
                    bail!("users.password_hash for {} is not a PHC string: {err}", user.identity);
                }
            }
        }
        Ok(())
    }
}

fn env_config_path() -> PathBuf {
    if let Ok(path) = std::env::var(CONFIG_ENV) {
        PathBuf::from(path)
    } else {
        PathBuf::from(DEFAULT_CONFIG_PATH)
    }
}

fn is_json(path: &Path) -> bool {
    matches!(path.extension().and_then(|s| s.to_str()), Some("json"))
}

fn default_true() -> bool {
    true
}

fn default_topic_root() -> String {
    "owntracks".into()
}

fn default_max_packet_size() -> usize {
    268_435_455
}

fn default_outbound_queue() -> usize {
    256
}

fn default_retry_base_ms() -> u64 {
    2_000
}

fn default_retry_max_ms() -> u64 {
    30_000
}

fn default_bind_host() -> String {
    "0.0.0.0".into()
}

fn default_plain_port() -> i64 {
    1883
}

fn default_tls_port() -> i64 {
    8883
}

fn default_ws_port() -> i64 {
    8083
}

fn default_drain_grace_ms() -> u64 {
    5_000
}

fn default_store_path() -> PathBuf {
    PathBuf::from("data/pki.json")
}

fn default_authority_subject() -> String {
    "Locus CA".into()
}

fn default_authority_validity_days() -> u32 {
    3650
}

fn default_server_common_name() -> String {
    "locus".into()
}

fn default_server_validity_days() -> u32 {
    365
}

fn default_client_validity_days() -> u32 {
    365
}

fn default_key_size() -> u32 {
    256
}

fn default_reload_interval_ms() -> u64 {
    1_000
}

fn default_queue_capacity() -> usize {
    256
}

/// Ten years.
const MAX_FUTURE_SKEW_SECS: i64 = 315_360_000;

fn default_max_future_skew_secs() -> i64 {
    86_400
}

fn default_journal_path() -> PathBuf {
    PathBuf::from("data/journal.jsonl")
}

fn default_log_level() -> String {
    "info".into()
}
