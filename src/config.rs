use crate::error::{MeterError, Result};
use crate::metering::quota::QuotaConfig;
use crate::metering::PeerKey;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_CONFIG_PATH: &str = "/etc/wg-meter/config.toml";
const ENV_PREFIX: &str = "WG_METER_";

/// Top-level configuration, read from TOML with per-field defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub wireguard: WireguardConfig,
    pub storage: StorageConfig,
    pub quota: QuotaConfig,
    pub schedule: ScheduleConfig,
    /// Extra peer key → user mappings layered over the clients directory.
    pub identities: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WireguardConfig {
    pub interface: String,
    /// Directory with one `<user>/publickey` per provisioned client.
    pub clients_dir: PathBuf,
    /// Upper bound for `wg` / `wg-quick` invocations.
    pub command_timeout_secs: u64,
}

impl Default for WireguardConfig {
    fn default() -> Self {
        Self {
            interface: "wg0".into(),
            clients_dir: PathBuf::from("/etc/wireguard/clients"),
            command_timeout_secs: 30,
        }
    }
}

impl WireguardConfig {
    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs.max(1))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub db_path: String,
    /// Pending operations the writer thread will queue before refusing more.
    pub writer_queue: usize,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            db_path: "/etc/wg-meter/traffic.db".into(),
            writer_queue: 64,
        }
    }
}

impl StorageConfig {
    /// `db_path` with `~` and environment variables expanded.
    pub fn resolved_db_path(&self) -> Result<PathBuf> {
        let expanded = shellexpand::full(&self.db_path)
            .map_err(|e| MeterError::Config(format!("storage.db_path: {e}")))?;
        Ok(PathBuf::from(expanded.as_ref()))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScheduleConfig {
    pub snapshot_interval_secs: u64,
    /// Delay before the first metering cycle after startup.
    pub first_delay_secs: u64,
    pub reset_check_interval_secs: u64,
    /// Earliest UTC hour on the 1st at which the monthly reset may run.
    pub reset_hour_utc: u32,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            snapshot_interval_secs: 300,
            first_delay_secs: 60,
            reset_check_interval_secs: 3600,
            reset_hour_utc: 0,
        }
    }
}

impl ScheduleConfig {
    pub fn snapshot_interval(&self) -> Duration {
        Duration::from_secs(self.snapshot_interval_secs)
    }

    pub fn first_delay(&self) -> Duration {
        Duration::from_secs(self.first_delay_secs)
    }

    pub fn reset_check_interval(&self) -> Duration {
        Duration::from_secs(self.reset_check_interval_secs)
    }
}

impl Config {
    /// Load configuration.
    ///
    /// An explicit `path` must exist. Without one, the default location is
    /// used when present and built-in defaults otherwise. Environment
    /// overrides are applied last, then the result is validated.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => {
                let default = Path::new(DEFAULT_CONFIG_PATH);
                if default.exists() {
                    Self::from_file(default)?
                } else {
                    Self::default()
                }
            }
        };
        config.apply_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_toml(&raw).map_err(|e| match e {
            MeterError::Config(msg) => MeterError::Config(format!("{}: {msg}", path.display())),
            other => other,
        })
    }

    pub fn from_toml(raw: &str) -> Result<Self> {
        toml::from_str(raw).map_err(|e| MeterError::Config(e.to_string()))
    }

    /// Apply `WG_METER_*` overrides through `lookup`.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        let var = |name: &str| lookup(&format!("{ENV_PREFIX}{name}"));

        if let Some(interface) = var("INTERFACE") {
            self.wireguard.interface = interface;
        }
        if let Some(dir) = var("CLIENTS_DIR") {
            self.wireguard.clients_dir = PathBuf::from(dir);
        }
        if let Some(db_path) = var("DB_PATH") {
            self.storage.db_path = db_path;
        }
        if let Some(limit) = var("LIMIT_BYTES") {
            self.quota.limit_bytes = limit
                .trim()
                .parse()
                .map_err(|e| MeterError::Config(format!("{ENV_PREFIX}LIMIT_BYTES: {e}")))?;
        }
        Ok(())
    }

    /// Reject unusable values and normalize the threshold list.
    pub fn validate(&mut self) -> Result<()> {
        let iface = &self.wireguard.interface;
        let valid_iface = !iface.is_empty()
            && iface.len() <= 15
            && iface
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
        if !valid_iface {
            return Err(MeterError::Config(format!(
                "wireguard.interface {iface:?} is not a valid interface name"
            )));
        }
        if self.schedule.snapshot_interval_secs == 0 {
            return Err(MeterError::Config(
                "schedule.snapshot_interval_secs must be positive".into(),
            ));
        }
        if self.schedule.reset_check_interval_secs == 0 {
            return Err(MeterError::Config(
                "schedule.reset_check_interval_secs must be positive".into(),
            ));
        }
        if self.schedule.reset_hour_utc > 23 {
            return Err(MeterError::Config(
                "schedule.reset_hour_utc must be between 0 and 23".into(),
            ));
        }
        if self.quota.thresholds.contains(&0) {
            return Err(MeterError::Config(
                "quota.thresholds must be positive percentages".into(),
            ));
        }
        self.quota.normalize();
        Ok(())
    }

    pub fn static_identities(&self) -> Vec<(PeerKey, String)> {
        self.identities
            .iter()
            .map(|(key, user)| (PeerKey::new(key.as_str()), user.clone()))
            .collect()
    }
}
