/// Configuration persistence for the test bench
///
/// The configuration lives in a single JSON file keyed by server name.
/// A missing file is recreated with the documented defaults; a malformed
/// file surfaces a configuration error so the caller can fall back to
/// defaults and regenerate it. Saves go through a temp-file-then-rename
/// sequence so a crash never leaves a truncated config behind.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use log::{info, warn};
use serde::{Deserialize, Serialize};

use crate::error::{TestbedError, TestbedResult};

/// Default bind host for both servers
pub const DEFAULT_HOST: &str = "127.0.0.1";

/// Default port for the battery server
pub const DEFAULT_BATTERY_PORT: u16 = 5020;

/// Default port for the master server
pub const DEFAULT_MASTER_PORT: u16 = 502;

/// Default unit id for both servers
pub const DEFAULT_UNIT_ID: u8 = 1;

/// Default location of the persisted configuration file
pub const DEFAULT_CONFIG_PATH: &str = "resources/config.json";

/// Network configuration for a single Modbus server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_battery_port")]
    pub port: u16,
    #[serde(default = "default_unit_id")]
    pub unit_id: u8,
}

fn default_host() -> String {
    DEFAULT_HOST.to_string()
}

fn default_battery_port() -> u16 {
    DEFAULT_BATTERY_PORT
}

fn default_unit_id() -> u8 {
    DEFAULT_UNIT_ID
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: DEFAULT_BATTERY_PORT,
            unit_id: DEFAULT_UNIT_ID,
        }
    }
}

impl ServerConfig {
    /// Create a config with an explicit port, defaults elsewhere
    pub fn with_port(port: u16) -> Self {
        Self { port, ..Default::default() }
    }

    /// The `host:port` endpoint string this config binds
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Validate field ranges (port 1-65535, unit id 0-247)
    pub fn validate(&self) -> TestbedResult<()> {
        if self.host.trim().is_empty() {
            return Err(TestbedError::configuration("Host must not be empty"));
        }
        if self.port == 0 {
            return Err(TestbedError::configuration(
                "Port must be between 1 and 65535",
            ));
        }
        if self.unit_id > 247 {
            return Err(TestbedError::configuration(format!(
                "Unit ID must be between 0 and 247, got {}",
                self.unit_id
            )));
        }
        Ok(())
    }
}

/// Initial register values, keyed by human-readable register number
///
/// Holding registers count from 40001, input registers from 30001, coils
/// from 00001 and discrete inputs from 10001. Bit kinds take 0/1 values.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InitialRegisters {
    #[serde(default)]
    pub holding: BTreeMap<u32, u16>,
    #[serde(default)]
    pub input: BTreeMap<u32, u16>,
    #[serde(default)]
    pub coils: BTreeMap<u32, u16>,
    #[serde(default)]
    pub discrete: BTreeMap<u32, u16>,
}

/// Top-level persisted configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub battery_server: ServerConfig,
    #[serde(default = "default_master_config")]
    pub master_server: ServerConfig,
    #[serde(default = "default_initial_registers")]
    pub initial_registers: InitialRegisters,
}

fn default_master_config() -> ServerConfig {
    ServerConfig::with_port(DEFAULT_MASTER_PORT)
}

fn default_initial_registers() -> InitialRegisters {
    InitialRegisters {
        holding: BTreeMap::from([(40001, 1), (40002, 0), (40010, 1234)]),
        input: BTreeMap::from([(30001, 3700), (30002, 251)]),
        coils: BTreeMap::from([(1, 1), (2, 0)]),
        discrete: BTreeMap::from([(10001, 1), (10002, 0)]),
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            battery_server: ServerConfig::default(),
            master_server: default_master_config(),
            initial_registers: default_initial_registers(),
        }
    }
}

impl AppConfig {
    /// Validate both server sections
    pub fn validate(&self) -> TestbedResult<()> {
        self.battery_server.validate()?;
        self.master_server.validate()?;
        Ok(())
    }
}

/// Loads and persists the application configuration
#[derive(Debug, Clone)]
pub struct ConfigStore {
    path: PathBuf,
}

impl ConfigStore {
    /// Create a store bound to the given file path
    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        Self { path: path.into() }
    }

    /// The path this store reads and writes
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the configuration from disk
    ///
    /// A missing file is created with defaults and the defaults are
    /// returned. A file that exists but does not parse, or that parses
    /// into invalid field values, yields a `Configuration` error; the
    /// caller decides whether to call [`ConfigStore::regenerate_defaults`].
    pub fn load(&self) -> TestbedResult<AppConfig> {
        if !self.path.exists() {
            info!("No configuration at {}, creating defaults", self.path.display());
            let defaults = AppConfig::default();
            self.save(&defaults)?;
            return Ok(defaults);
        }

        let raw = fs::read_to_string(&self.path).map_err(|e| {
            TestbedError::configuration(format!(
                "Failed to read {}: {}",
                self.path.display(),
                e
            ))
        })?;
        let config: AppConfig = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Persist the configuration atomically
    ///
    /// Writes to a sibling temp file, then renames over the target, so a
    /// crash mid-save leaves either the old or the new file, never a
    /// truncated one.
    pub fn save(&self, config: &AppConfig) -> TestbedResult<()> {
        config.validate()?;

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(|e| {
                    TestbedError::configuration(format!(
                        "Failed to create {}: {}",
                        parent.display(),
                        e
                    ))
                })?;
            }
        }

        let json = serde_json::to_string_pretty(config)?;
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, json).map_err(|e| {
            TestbedError::configuration(format!("Failed to write {}: {}", tmp.display(), e))
        })?;
        fs::rename(&tmp, &self.path).map_err(|e| {
            TestbedError::configuration(format!(
                "Failed to replace {}: {}",
                self.path.display(),
                e
            ))
        })?;
        Ok(())
    }

    /// Overwrite the persisted file with defaults and return them
    ///
    /// Recovery path for a malformed file reported by [`ConfigStore::load`].
    pub fn regenerate_defaults(&self) -> TestbedResult<AppConfig> {
        warn!(
            "Regenerating {} with default configuration",
            self.path.display()
        );
        let defaults = AppConfig::default();
        self.save(&defaults)?;
        Ok(defaults)
    }
}

impl Default for ConfigStore {
    fn default() -> Self {
        Self::new(DEFAULT_CONFIG_PATH)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_defaults_match_documented_values() {
        let config = AppConfig::default();
        assert_eq!(config.battery_server.host, "127.0.0.1");
        assert_eq!(config.battery_server.port, 5020);
        assert_eq!(config.battery_server.unit_id, 1);
        assert_eq!(config.master_server.port, 502);
        assert_eq!(config.initial_registers.holding.get(&40010), Some(&1234));
        assert_eq!(config.initial_registers.input.get(&30001), Some(&3700));
    }

    #[test]
    fn test_first_run_creates_file_with_defaults() {
        let dir = tempdir().unwrap();
        let store = ConfigStore::new(dir.path().join("resources/config.json"));

        let loaded = store.load().unwrap();
        assert_eq!(loaded, AppConfig::default());
        assert!(store.path().exists());

        // the file on disk parses back to the same defaults
        let reloaded = store.load().unwrap();
        assert_eq!(reloaded, loaded);
    }

    #[test]
    fn test_save_and_reload_round_trip() {
        let dir = tempdir().unwrap();
        let store = ConfigStore::new(dir.path().join("config.json"));

        let mut config = AppConfig::default();
        config.battery_server.port = 5021;
        config.battery_server.unit_id = 7;
        store.save(&config).unwrap();

        let loaded = store.load().unwrap();
        assert_eq!(loaded.battery_server.port, 5021);
        assert_eq!(loaded.battery_server.unit_id, 7);

        // no temp file left behind
        assert!(!dir.path().join("config.json.tmp").exists());
    }

    #[test]
    fn test_malformed_file_is_a_config_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, "{ not json").unwrap();

        let store = ConfigStore::new(&path);
        assert!(matches!(
            store.load(),
            Err(TestbedError::Configuration { .. })
        ));

        let regenerated = store.regenerate_defaults().unwrap();
        assert_eq!(regenerated, AppConfig::default());
        assert_eq!(store.load().unwrap(), regenerated);
    }

    #[test]
    fn test_invalid_field_values_rejected() {
        let bad_port = ServerConfig { host: "127.0.0.1".into(), port: 0, unit_id: 1 };
        assert!(bad_port.validate().is_err());

        let bad_unit = ServerConfig { host: "127.0.0.1".into(), port: 5020, unit_id: 248 };
        assert!(bad_unit.validate().is_err());

        let dir = tempdir().unwrap();
        let store = ConfigStore::new(dir.path().join("config.json"));
        let mut config = AppConfig::default();
        config.master_server.unit_id = 255;
        assert!(store.save(&config).is_err());
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{"battery_server": {"port": 6020}}"#).unwrap();

        let loaded = ConfigStore::new(&path).load().unwrap();
        assert_eq!(loaded.battery_server.port, 6020);
        assert_eq!(loaded.battery_server.host, "127.0.0.1");
        assert_eq!(loaded.master_server.port, 502);
        assert!(!loaded.initial_registers.holding.is_empty());
    }
}
