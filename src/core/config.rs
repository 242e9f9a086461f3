use crate::delivery::certs::{CertificateResolver, DEFAULT_CA_FILE};
use crate::delivery::connection::ConnectionSettings;
use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::warn;

const DEFAULT_CONFIG_PATH: &str = "config/meterlink.toml";
const DEVICE_ID_PLACEHOLDER: &str = "{device_id}";

/// Top-level configuration for the meterlink agent.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub device: DeviceConfig,
    pub broker: BrokerConfig,
    #[serde(default)]
    pub certs: CertsConfig,
    #[serde(default)]
    pub delivery: DeliveryConfig,
    #[serde(default)]
    pub household: HouseholdConfig,
    #[serde(default)]
    pub boot: BootConfig,
    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DeviceConfig {
    #[serde(default = "DeviceConfig::default_id_file")]
    pub device_id_file: PathBuf,
    #[serde(default = "DeviceConfig::default_fallback_id")]
    pub fallback_device_id: String,
}

impl DeviceConfig {
    fn default_id_file() -> PathBuf {
        PathBuf::from("/var/lib/device_id.txt")
    }

    fn default_fallback_id() -> String {
        "IM000000".into()
    }
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            device_id_file: Self::default_id_file(),
            fallback_device_id: Self::default_fallback_id(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct BrokerConfig {
    pub host: String,
    #[serde(default = "BrokerConfig::default_port")]
    pub port: u16,
    /// Publish topic; `{device_id}` is replaced with the resolved device id.
    #[serde(default = "BrokerConfig::default_topic")]
    pub topic: String,
    #[serde(default = "BrokerConfig::default_keep_alive")]
    pub keep_alive_seconds: u64,
    #[serde(default)]
    pub clean_session: bool,
    /// Bound on publishes waiting for the connection worker.
    #[serde(default = "BrokerConfig::default_request_capacity")]
    pub request_capacity: usize,
}

impl BrokerConfig {
    const fn default_port() -> u16 {
        8883
    }

    fn default_topic() -> String {
        "indi/AM/meter".into()
    }

    const fn default_keep_alive() -> u64 {
        60
    }

    const fn default_request_capacity() -> usize {
        64
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CertsConfig {
    #[serde(default = "CertsConfig::default_dir")]
    pub dir: PathBuf,
    #[serde(default = "CertsConfig::default_ca_file")]
    pub ca_file: String,
    /// Delay between provisioning checks while artifacts are missing.
    #[serde(default = "CertsConfig::default_retry")]
    pub retry_seconds: u64,
}

impl CertsConfig {
    fn default_dir() -> PathBuf {
        PathBuf::from("/opt/apm/certs")
    }

    fn default_ca_file() -> String {
        DEFAULT_CA_FILE.into()
    }

    const fn default_retry() -> u64 {
        10
    }
}

impl Default for CertsConfig {
    fn default() -> Self {
        Self {
            dir: Self::default_dir(),
            ca_file: Self::default_ca_file(),
            retry_seconds: Self::default_retry(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DeliveryConfig {
    #[serde(default = "DeliveryConfig::default_reconnect_base")]
    pub reconnect_base_seconds: u64,
    #[serde(default = "DeliveryConfig::default_reconnect_max")]
    pub reconnect_max_seconds: u64,
    #[serde(default = "DeliveryConfig::default_confirm_timeout")]
    pub confirm_timeout_ms: u64,
    #[serde(default = "DeliveryConfig::default_flush_interval")]
    pub flush_interval_seconds: u64,
    /// Persist the outbound queue here so offline events survive restarts.
    #[serde(default)]
    pub spool_path: Option<PathBuf>,
}

impl DeliveryConfig {
    const fn default_reconnect_base() -> u64 {
        5
    }

    const fn default_reconnect_max() -> u64 {
        60
    }

    const fn default_confirm_timeout() -> u64 {
        8_000
    }

    const fn default_flush_interval() -> u64 {
        30
    }

    pub fn confirm_timeout(&self) -> Duration {
        Duration::from_millis(self.confirm_timeout_ms)
    }
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            reconnect_base_seconds: Self::default_reconnect_base(),
            reconnect_max_seconds: Self::default_reconnect_max(),
            confirm_timeout_ms: Self::default_confirm_timeout(),
            flush_interval_seconds: Self::default_flush_interval(),
            spool_path: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct HouseholdConfig {
    #[serde(default = "HouseholdConfig::default_members_file")]
    pub members_file: PathBuf,
    #[serde(default = "HouseholdConfig::default_guests_file")]
    pub guests_file: PathBuf,
}

impl HouseholdConfig {
    fn default_members_file() -> PathBuf {
        PathBuf::from("/var/lib/meter_members.json")
    }

    fn default_guests_file() -> PathBuf {
        PathBuf::from("/var/lib/meter_guests.json")
    }
}

impl Default for HouseholdConfig {
    fn default() -> Self {
        Self {
            members_file: Self::default_members_file(),
            guests_file: Self::default_guests_file(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct BootConfig {
    #[serde(default = "BootConfig::default_marker_path")]
    pub marker_path: PathBuf,
    #[serde(default = "BootConfig::default_boot_id_path")]
    pub boot_id_path: PathBuf,
}

impl BootConfig {
    fn default_marker_path() -> PathBuf {
        PathBuf::from("/var/lib/meter_last_boot_id.txt")
    }

    fn default_boot_id_path() -> PathBuf {
        PathBuf::from(crate::household::boot::KERNEL_BOOT_ID_PATH)
    }
}

impl Default for BootConfig {
    fn default() -> Self {
        Self {
            marker_path: Self::default_marker_path(),
            boot_id_path: Self::default_boot_id_path(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct TelemetryConfig {
    pub log_level: Option<String>,
    /// Bind address for the status endpoint; disabled when unset.
    pub status_bind: Option<String>,
}

impl Config {
    /// Load configuration from a path resolved via METERLINK_CONFIG or defaults to
    /// `config/meterlink.toml`, then apply METERLINK_* overrides.
    pub fn load_from_env() -> Result<Self> {
        Self::load_with_overrides(env_config_path())
    }

    /// Load a specific file and apply METERLINK_* overrides.
    pub fn load_with_overrides(path: impl AsRef<Path>) -> Result<Self> {
        let mut cfg = Self::load(path)?;
        cfg.apply_env_overrides();
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

    /// Validate schema-level invariants before anything is started.
    pub fn validate(&self) -> Result<()> {
        if self.broker.host.trim().is_empty() {
            bail!("broker.host must be non-empty");
        }
        if self.broker.port == 0 {
            bail!("broker.port must be > 0");
        }
        if self.broker.topic.trim().is_empty() {
            bail!("broker.topic must be non-empty");
        }
        if self.broker.keep_alive_seconds < 5 {
            bail!("broker.keep_alive_seconds must be >= 5");
        }
        if self.broker.request_capacity == 0 {
            bail!("broker.request_capacity must be > 0");
        }
        if self.delivery.reconnect_base_seconds == 0 {
            bail!("delivery.reconnect_base_seconds must be > 0");
        }
        if self.delivery.reconnect_base_seconds > self.delivery.reconnect_max_seconds {
            bail!("delivery.reconnect_base_seconds must not exceed reconnect_max_seconds");
        }
        if self.delivery.confirm_timeout_ms == 0 {
            bail!("delivery.confirm_timeout_ms must be > 0");
        }
        if self.delivery.flush_interval_seconds == 0 {
            bail!("delivery.flush_interval_seconds must be > 0");
        }
        if let Some(bind) = &self.telemetry.status_bind {
            if bind.parse::<std::net::SocketAddr>().is_err() {
                bail!("telemetry.status_bind {bind} is not a socket address");
            }
        }
        Ok(())
    }

    /// First non-empty line of the device id file, else the configured fallback.
    pub fn resolve_device_id(&self) -> String {
        let path = &self.device.device_id_file;
        match fs::read_to_string(path) {
            Ok(raw) => {
                if let Some(id) = raw.lines().map(str::trim).find(|line| !line.is_empty()) {
                    return id.to_string();
                }
                warn!(path = %path.display(), "device id file is empty; using fallback id");
            }
            Err(err) => {
                warn!(path = %path.display(), "device id unavailable, using fallback id: {err}");
            }
        }
        self.device.fallback_device_id.clone()
    }

    pub fn topic_for(&self, device_id: &str) -> String {
        self.broker.topic.replace(DEVICE_ID_PLACEHOLDER, device_id)
    }

    pub fn resolver_for(&self, device_id: &str) -> CertificateResolver {
        CertificateResolver::new(&self.certs.dir, device_id).with_ca_file(&self.certs.ca_file)
    }

    pub fn connection_settings(&self, device_id: &str) -> ConnectionSettings {
        ConnectionSettings {
            host: self.broker.host.clone(),
            port: self.broker.port,
            client_id: device_id.to_string(),
            topic: self.topic_for(device_id),
            keep_alive: Duration::from_secs(self.broker.keep_alive_seconds),
            clean_session: self.broker.clean_session,
            request_capacity: self.broker.request_capacity,
            reconnect_base: Duration::from_secs(self.delivery.reconnect_base_seconds),
            reconnect_max: Duration::from_secs(self.delivery.reconnect_max_seconds),
            cert_retry: Duration::from_secs(self.certs.retry_seconds.max(1)),
            flush_interval: Duration::from_secs(self.delivery.flush_interval_seconds),
        }
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(host) = std::env::var("METERLINK_BROKER_HOST") {
            self.broker.host = host;
        }
        if let Ok(dir) = std::env::var("METERLINK_CERTS_DIR") {
            self.certs.dir = PathBuf::from(dir);
        }
        if let Ok(level) = std::env::var("METERLINK_LOG_LEVEL") {
            self.telemetry.log_level = Some(level);
        }
    }
}

fn env_config_path() -> PathBuf {
    if let Ok(path) = std::env::var("METERLINK_CONFIG") {
        PathBuf::from(path)
    } else {
        PathBuf::from(DEFAULT_CONFIG_PATH)
    }
}

fn is_json(path: &Path) -> bool {
    matches!(path.extension().and_then(|s| s.to_str()), Some("json"))
}
