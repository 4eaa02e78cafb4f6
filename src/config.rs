//! Polling configuration, persisted config entries and the stores that hold them.

use crate::error::{EcotrackerError, Result};
use serde_derive::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::env;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;
use tracing::{debug, info};

pub const MIN_SCAN_INTERVAL: u32 = 1;
pub const MAX_SCAN_INTERVAL: u32 = 3600;
pub const DEFAULT_SCAN_INTERVAL: u32 = 5;

/// Upper bound for a single device request
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

pub const DEFAULT_CONFIG_PATH: &str = "ecotracker.json";

/// Checks a user supplied interval (seconds) against the accepted range.
pub fn validate_interval(value: i64) -> Result<u32> {
    if value < i64::from(MIN_SCAN_INTERVAL) || value > i64::from(MAX_SCAN_INTERVAL) {
        return Err(EcotrackerError::validation(
            "scan_interval",
            format!(
                "{value} is outside {MIN_SCAN_INTERVAL}..={MAX_SCAN_INTERVAL} seconds"
            ),
        ));
    }
    Ok(value as u32)
}

/// Canonical form of a device address: trimmed and lowercased.
pub fn normalize_address(address: &str) -> String {
    address.trim().to_ascii_lowercase()
}

/// Address and cadence for one device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "StoredPollingConfig")]
pub struct PollingConfig {
    pub address: String,
    pub scan_interval: u32,
}

// On-disk shape, checked on the way in.
#[derive(Deserialize)]
struct StoredPollingConfig {
    address: String,
    #[serde(default = "default_scan_interval")]
    scan_interval: i64,
}

fn default_scan_interval() -> i64 {
    DEFAULT_SCAN_INTERVAL.into()
}

impl TryFrom<StoredPollingConfig> for PollingConfig {
    type Error = EcotrackerError;

    fn try_from(stored: StoredPollingConfig) -> Result<Self> {
        Self::new(stored.address, validate_interval(stored.scan_interval)?)
    }
}

impl PollingConfig {
    pub fn new(address: impl Into<String>, scan_interval: u32) -> Result<Self> {
        let config = Self {
            address: normalize_address(&address.into()),
            scan_interval,
        };
        config.validate()?;
        Ok(config)
    }

    /// Re-checks a config that may have been built field by field.
    pub fn validate(&self) -> Result<()> {
        if self.address.trim().is_empty() {
            return Err(EcotrackerError::validation(
                "ip_address",
                "address must not be empty",
            ));
        }
        validate_interval(i64::from(self.scan_interval))?;
        Ok(())
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(u64::from(self.scan_interval))
    }

    /// Request timeout used while polling: never longer than the interval itself.
    pub fn request_timeout(&self) -> Duration {
        self.interval().min(DEFAULT_REQUEST_TIMEOUT)
    }
}

/// Persisted record of one configured device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigEntry {
    pub entry_id: String,
    pub title: String,
    pub data: PollingConfig,
}

impl ConfigEntry {
    pub fn new(data: PollingConfig) -> Self {
        Self {
            entry_id: entry_id_for(&data.address),
            title: format!("Ecotracker ({})", data.address),
            data,
        }
    }
}

/// Stable identifier derived from the device address.
fn entry_id_for(address: &str) -> String {
    let slug: String = address
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_lowercase()
            } else {
                '_'
            }
        })
        .collect();
    format!("ecotracker_{slug}")
}

/// Key-value persistence for config entries, keyed by device address.
pub trait ConfigStore: Send + Sync {
    fn entries(&self) -> Result<Vec<ConfigEntry>>;

    fn find_by_address(&self, address: &str) -> Result<Option<ConfigEntry>> {
        let address = normalize_address(address);
        Ok(self
            .entries()?
            .into_iter()
            .find(|entry| entry.data.address == address))
    }

    fn find_by_entry_id(&self, entry_id: &str) -> Result<Option<ConfigEntry>> {
        Ok(self
            .entries()?
            .into_iter()
            .find(|entry| entry.entry_id == entry_id))
    }

    /// Inserts the entry or replaces the one stored under the same address.
    fn save(&self, entry: &ConfigEntry) -> Result<()>;

    fn remove(&self, address: &str) -> Result<bool>;
}

#[derive(Debug, Default)]
pub struct MemoryConfigStore {
    entries: Mutex<BTreeMap<String, ConfigEntry>>,
}

impl MemoryConfigStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, BTreeMap<String, ConfigEntry>>> {
        self.entries
            .lock()
            .map_err(|_| EcotrackerError::storage("config store lock poisoned"))
    }
}

impl ConfigStore for MemoryConfigStore {
    fn entries(&self) -> Result<Vec<ConfigEntry>> {
        Ok(self.lock()?.values().cloned().collect())
    }

    fn save(&self, entry: &ConfigEntry) -> Result<()> {
        self.lock()?
            .insert(entry.data.address.clone(), entry.clone());
        Ok(())
    }

    fn remove(&self, address: &str) -> Result<bool> {
        Ok(self.lock()?.remove(address).is_some())
    }
}

/// Stores entries as a pretty-printed JSON object keyed by address.
#[derive(Debug)]
pub struct JsonFileConfigStore {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonFileConfigStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn load(&self) -> Result<BTreeMap<String, ConfigEntry>> {
        if !self.path.exists() {
            debug!(path = %self.path.display(), "No config store file yet");
            return Ok(BTreeMap::new());
        }
        let contents = std::fs::read_to_string(&self.path)?;
        if contents.trim().is_empty() {
            return Ok(BTreeMap::new());
        }
        Ok(serde_json::from_str(&contents)?)
    }

    fn write(&self, entries: &BTreeMap<String, ConfigEntry>) -> Result<()> {
        let contents = serde_json::to_string_pretty(entries)?;
        std::fs::write(&self.path, contents)?;
        Ok(())
    }

    fn modify<T>(&self, f: impl FnOnce(&mut BTreeMap<String, ConfigEntry>) -> T) -> Result<T> {
        let _guard = self
            .write_lock
            .lock()
            .map_err(|_| EcotrackerError::storage("config store lock poisoned"))?;
        let mut entries = self.load()?;
        let out = f(&mut entries);
        self.write(&entries)?;
        Ok(out)
    }
}

impl ConfigStore for JsonFileConfigStore {
    fn entries(&self) -> Result<Vec<ConfigEntry>> {
        Ok(self.load()?.into_values().collect())
    }

    fn save(&self, entry: &ConfigEntry) -> Result<()> {
        self.modify(|entries| {
            entries.insert(entry.data.address.clone(), entry.clone());
        })?;
        info!(path = %self.path.display(), address = %entry.data.address, "Saved config entry");
        Ok(())
    }

    fn remove(&self, address: &str) -> Result<bool> {
        self.modify(|entries| entries.remove(address).is_some())
    }
}

/// Runtime settings for the host binary, read from the environment.
#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    pub ip_address: Option<String>,
    pub scan_interval: Option<u32>,
    pub config_path: PathBuf,
}

impl Settings {
    pub fn from_env() -> Result<Self> {
        Self::from_values(
            env::var("ECOTRACKER_IP_ADDRESS").ok(),
            env::var("ECOTRACKER_SCAN_INTERVAL").ok(),
            env::var("ECOTRACKER_CONFIG").ok(),
        )
    }

    fn from_values(
        ip_address: Option<String>,
        scan_interval: Option<String>,
        config_path: Option<String>,
    ) -> Result<Self> {
        Ok(Self {
            ip_address: non_empty(ip_address),
            scan_interval: parse_interval(scan_interval)?,
            config_path: non_empty(config_path)
                .unwrap_or_else(|| DEFAULT_CONFIG_PATH.to_string())
                .into(),
        })
    }
}

fn non_empty(val: Option<String>) -> Option<String> {
    val.map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

/// Parses an optional interval variable; unset or blank means "not given".
fn parse_interval(val: Option<String>) -> Result<Option<u32>> {
    let Some(raw) = non_empty(val) else {
        return Ok(None);
    };
    let value: i64 = raw.parse().map_err(|_| {
        EcotrackerError::validation("scan_interval", format!("'{raw}' is not a whole number"))
    })?;
    validate_interval(value).map(Some)
}
