// Configuration management for the fobkey CLI
//
// Cross-platform config stored in:
// - macOS: ~/Library/Application Support/fobkey/config.json
// - Linux: ~/.config/fobkey/config.json
// - Windows: %APPDATA%\fobkey\config.json

use anyhow::{Context, Result};
use fobkey_core::crypto::SharedKey;
use fobkey_core::session::{self, OrchestratorConfig};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// 64 hex characters; provisioned out of band
    pub key_hex: Option<String>,

    /// Storage path for the nonce database
    pub storage_path: Option<String>,

    /// Upper bound in seconds for one-shot commands (auth, battery)
    pub scan_duration: u64,

    /// Event loop tick, drives the challenge timeout
    pub tick_interval_ms: u64,

    /// Last fob we connected to; reconnect target
    pub known_peripheral: Option<String>,

    /// Handshake and GATT settings
    pub session: OrchestratorConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            key_hex: None,
            storage_path: None,
            scan_duration: 30,
            tick_interval_ms: session::DEFAULT_TICK_INTERVAL.as_millis() as u64,
            known_peripheral: None,
            session: OrchestratorConfig::default(),
        }
    }
}

impl Config {
    /// Get the config directory path (cross-platform)
    pub fn config_dir() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .context("Failed to determine config directory")?
            .join("fobkey");

        std::fs::create_dir_all(&config_dir).context("Failed to create config directory")?;

        Ok(config_dir)
    }

    /// Get the data directory path (cross-platform)
    pub fn data_dir() -> Result<PathBuf> {
        let data_dir = dirs::data_local_dir()
            .context("Failed to determine data directory")?
            .join("fobkey");

        std::fs::create_dir_all(&data_dir).context("Failed to create data directory")?;

        Ok(data_dir)
    }

    pub fn config_file() -> Result<PathBuf> {
        Ok(Self::config_dir()?.join("config.json"))
    }

    /// Load config from file, or create default if not exists
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_file()?)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if path.exists() {
            let contents = std::fs::read_to_string(path).context("Failed to read config file")?;
            let config: Config =
                serde_json::from_str(&contents).context("Failed to parse config file")?;
            Ok(config)
        } else {
            let config = Config::default();
            config.save_to(path)?;
            Ok(config)
        }
    }

    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_file()?)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        let contents = serde_json::to_string_pretty(self).context("Failed to serialize config")?;
        std::fs::write(path, contents).context("Failed to write config file")?;
        Ok(())
    }

    /// Nonce database location: explicit path or `<data dir>/nonce.db`
    pub fn nonce_db_path(&self) -> Result<PathBuf> {
        match &self.storage_path {
            Some(path) => Ok(PathBuf::from(path)),
            None => Ok(Self::data_dir()?.join("nonce.db")),
        }
    }

    pub fn shared_key(&self) -> Result<SharedKey> {
        let hex_key = self
            .key_hex
            .as_deref()
            .context("No key configured; run `fobkey config set key <64 hex chars>`")?;
        SharedKey::from_hex(hex_key).context("Invalid key")
    }

    /// Set a config value (does not save)
    pub fn set(&mut self, key: &str, value: &str) -> Result<()> {
        match key {
            "key" => {
                SharedKey::from_hex(value).context("Invalid key")?;
                self.key_hex = Some(value.to_string());
            }
            "storage_path" => {
                self.storage_path = if value.is_empty() {
                    None
                } else {
                    Some(value.to_string())
                };
            }
            "scan_duration" => {
                self.scan_duration = value.parse().context("Invalid number")?;
            }
            "tick_interval_ms" => {
                self.tick_interval_ms = value.parse().context("Invalid number")?;
            }
            "known_peripheral" => {
                self.known_peripheral = if value.is_empty() {
                    None
                } else {
                    Some(value.to_string())
                };
            }
            "handshake_mode" => {
                self.session.handshake_mode = value.parse().map_err(anyhow::Error::msg)?;
            }
            "challenge" => {
                self.session.challenge = value.to_string();
            }
            "auto_reconnect" => {
                self.session.auto_reconnect = value.parse().context("Invalid boolean value")?;
            }
            "read_battery_on_connect" => {
                self.session.read_battery_on_connect =
                    value.parse().context("Invalid boolean value")?;
            }
            "challenge_timeout_ms" => {
                self.session.challenge_timeout_ms = if value.is_empty() || value == "none" {
                    None
                } else {
                    Some(value.parse().context("Invalid number")?)
                };
            }
            "default_mtu" => {
                self.session.default_mtu = value.parse().context("Invalid number")?;
            }
            _ => anyhow::bail!("Unknown config key: {}", key),
        }
        self.session.validate().context("Invalid session settings")?;
        Ok(())
    }

    /// Get a config value; the key itself is never printed
    pub fn get(&self, key: &str) -> Option<String> {
        match key {
            "key" => Some(
                if self.key_hex.is_some() {
                    "(set)"
                } else {
                    "(unset)"
                }
                .to_string(),
            ),
            "storage_path" => self.storage_path.clone(),
            "scan_duration" => Some(self.scan_duration.to_string()),
            "tick_interval_ms" => Some(self.tick_interval_ms.to_string()),
            "known_peripheral" => self.known_peripheral.clone(),
            "handshake_mode" => Some(self.session.handshake_mode.to_string()),
            "challenge" => Some(self.session.challenge.clone()),
            "auto_reconnect" => Some(self.session.auto_reconnect.to_string()),
            "read_battery_on_connect" => Some(self.session.read_battery_on_connect.to_string()),
            "challenge_timeout_ms" => self.session.challenge_timeout_ms.map(|ms| ms.to_string()),
            "default_mtu" => Some(self.session.default_mtu.to_string()),
            _ => None,
        }
    }

    /// List all config values
    pub fn list(&self) -> Vec<(String, String)> {
        let keys = [
            "key",
            "storage_path",
            "scan_duration",
            "tick_interval_ms",
            "known_peripheral",
            "handshake_mode",
            "challenge",
            "auto_reconnect",
            "read_battery_on_connect",
            "challenge_timeout_ms",
            "default_mtu",
        ];
        keys.iter()
            .map(|key| {
                let value = self.get(key).unwrap_or_else(|| "(auto)".to_string());
                (key.to_string(), value)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fobkey_core::session::HandshakeMode;

    const KEY_HEX: &str = "000102030405060708090a0b0c0d0e0f101112131415161718191a1b1c1d1e1f";

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.scan_duration, 30);
        assert!(config.key_hex.is_none());
        assert_eq!(config.session.handshake_mode, HandshakeMode::Reactive);
    }

    #[test]
    fn test_load_creates_default_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");

        let config = Config::load_from(&path).unwrap();
        assert!(path.exists());
        assert_eq!(config.tick_interval_ms, 250);
    }

    #[test]
    fn test_set_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");

        let mut config = Config::load_from(&path).unwrap();
        config.set("key", KEY_HEX).unwrap();
        config.set("handshake_mode", "eager").unwrap();
        config.set("challenge_timeout_ms", "1500").unwrap();
        config.save_to(&path).unwrap();

        let config = Config::load_from(&path).unwrap();
        assert!(config.shared_key().is_ok());
        assert_eq!(config.session.handshake_mode, HandshakeMode::Eager);
        assert_eq!(config.get("challenge_timeout_ms"), Some("1500".to_string()));
        assert_eq!(config.get("key"), Some("(set)".to_string()));
    }

    #[test]
    fn test_set_rejects_bad_values() {
        let mut config = Config::default();
        assert!(config.set("key", "abcd").is_err());
        assert!(config.set("default_mtu", "0").is_err());
        assert!(config.set("handshake_mode", "lazy").is_err());
        assert!(config.set("listen_port", "80").is_err());
    }

    #[test]
    fn test_missing_key_is_an_error() {
        assert!(Config::default().shared_key().is_err());
    }
}
