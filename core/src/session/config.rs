//! Orchestrator settings
//!
//! Which identifiers to look for, when to fire the handshake, and how to
//! recover from a lost link.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

use crate::transport::ble::{
    ADVERTISED_SERVICE_UUID, BATTERY_LEVEL_CHAR_UUID, BATTERY_SERVICE_UUID, DEFAULT_MTU,
    UART_RX_CHAR_UUID, UART_SERVICE_UUID, UART_TX_CHAR_UUID,
};

/// Challenge text the fob notifies when it wants a fresh handshake
pub const DEFAULT_CHALLENGE: &str = "authChallenge";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Challenge text must not be empty")]
    EmptyChallenge,

    #[error("Default MTU must be > 0")]
    InvalidMtu,

    #[error("Challenge timeout must be > 0 ms")]
    InvalidChallengeTimeout,

    #[error("Write and notify characteristics must differ")]
    DuplicateCharacteristics,
}

/// When the handshake packet is sent
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum HandshakeMode {
    /// As soon as the write characteristic is resolved
    Eager,
    /// Only after the fob notifies the challenge text
    #[default]
    Reactive,
}

impl std::fmt::Display for HandshakeMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Eager => write!(f, "eager"),
            Self::Reactive => write!(f, "reactive"),
        }
    }
}

impl std::str::FromStr for HandshakeMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "eager" => Ok(Self::Eager),
            "reactive" => Ok(Self::Reactive),
            other => Err(format!("Unknown handshake mode: {}", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    pub handshake_mode: HandshakeMode,

    /// Scan filter
    pub advertised_service: Uuid,

    pub uart_service: Uuid,
    pub write_characteristic: Uuid,
    pub notify_characteristic: Uuid,

    pub battery_service: Uuid,
    pub battery_characteristic: Uuid,

    pub challenge: String,

    /// Reconnect to the last known fob after link loss
    pub auto_reconnect: bool,

    /// Read the battery level as soon as its characteristic is resolved
    pub read_battery_on_connect: bool,

    /// Reactive mode: drop the link if no challenge arrives in time
    pub challenge_timeout_ms: Option<u64>,

    /// Chunk size used when the transport reports no usable write length
    pub default_mtu: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            handshake_mode: HandshakeMode::default(),
            advertised_service: ADVERTISED_SERVICE_UUID,
            uart_service: UART_SERVICE_UUID,
            write_characteristic: UART_RX_CHAR_UUID,
            notify_characteristic: UART_TX_CHAR_UUID,
            battery_service: BATTERY_SERVICE_UUID,
            battery_characteristic: BATTERY_LEVEL_CHAR_UUID,
            challenge: DEFAULT_CHALLENGE.to_string(),
            auto_reconnect: true,
            read_battery_on_connect: true,
            challenge_timeout_ms: None,
            default_mtu: DEFAULT_MTU,
        }
    }
}

impl OrchestratorConfig {
    pub fn with_mode(mut self, mode: HandshakeMode) -> Self {
        self.handshake_mode = mode;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.challenge.is_empty() {
            return Err(ConfigError::EmptyChallenge);
        }
        if self.default_mtu == 0 {
            return Err(ConfigError::InvalidMtu);
        }
        if self.challenge_timeout_ms == Some(0) {
            return Err(ConfigError::InvalidChallengeTimeout);
        }
        if self.write_characteristic == self.notify_characteristic {
            return Err(ConfigError::DuplicateCharacteristics);
        }
        Ok(())
    }

    pub fn challenge_timeout(&self) -> Option<Duration> {
        self.challenge_timeout_ms.map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = OrchestratorConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.handshake_mode, HandshakeMode::Reactive);
        assert_eq!(config.challenge, "authChallenge");
        assert!(config.auto_reconnect);
        assert!(config.read_battery_on_connect);
    }

    #[test]
    fn test_validation_errors() {
        let mut config = OrchestratorConfig::default();
        config.challenge.clear();
        assert_eq!(config.validate(), Err(ConfigError::EmptyChallenge));

        let mut config = OrchestratorConfig::default();
        config.default_mtu = 0;
        assert_eq!(config.validate(), Err(ConfigError::InvalidMtu));

        let mut config = OrchestratorConfig::default();
        config.challenge_timeout_ms = Some(0);
        assert_eq!(config.validate(), Err(ConfigError::InvalidChallengeTimeout));

        let mut config = OrchestratorConfig::default();
        config.notify_characteristic = config.write_characteristic;
        assert_eq!(config.validate(), Err(ConfigError::DuplicateCharacteristics));
    }

    #[test]
    fn test_handshake_mode_parse() {
        assert_eq!("Eager".parse::<HandshakeMode>(), Ok(HandshakeMode::Eager));
        assert_eq!("reactive".parse::<HandshakeMode>(), Ok(HandshakeMode::Reactive));
        assert!("lazy".parse::<HandshakeMode>().is_err());
    }

    #[test]
    fn test_config_serialization_fills_defaults() {
        let config: OrchestratorConfig =
            serde_json::from_str(r#"{"handshake_mode":"Eager"}"#).unwrap();
        assert_eq!(config.handshake_mode, HandshakeMode::Eager);
        assert_eq!(config.uart_service, UART_SERVICE_UUID);

        let json = serde_json::to_string(&config).unwrap();
        let restored: OrchestratorConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(config, restored);
    }
}
