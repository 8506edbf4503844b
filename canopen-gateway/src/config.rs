use std::fs;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::path::{Path, PathBuf};
use std::time::Duration;

use canopen_common::CobIdMatch;
use log::{info, warn};
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub bridge_address: String,
    pub bridge_port: u16,
    pub local_bind: String,
    pub handshake_timeout_ms: u64,
    pub poll_interval_ms: u64,
    pub sdo_timeout_ms: u64,
    pub cob_id_match: CobIdMatch,
    pub heartbeat: HeartbeatConfig,
    pub recorder: RecorderConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HeartbeatConfig {
    pub node_id: u8,
    pub state: u8,
    pub period_ms: u64,
    pub start_on_connect: bool,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RecorderConfig {
    pub enabled: bool,
    pub directory: Option<String>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            bridge_address: "127.0.0.1".to_string(),
            bridge_port: 9999,
            local_bind: "0.0.0.0:0".to_string(),
            handshake_timeout_ms: 2000,
            poll_interval_ms: 20,
            sdo_timeout_ms: 1000,
            cob_id_match: CobIdMatch::Additive,
            heartbeat: HeartbeatConfig::default(),
            recorder: RecorderConfig::default(),
        }
    }
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            node_id: 0x78,
            state: 0x05,
            period_ms: 1000,
            start_on_connect: false,
        }
    }
}

impl GatewayConfig {
    /// Get the path to the config file
    pub fn config_file_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("com", "canopen", "canopen-gateway")
            .map(|proj_dirs| proj_dirs.config_dir().join("config.toml"))
    }

    /// Load configuration from the default location, falling back to defaults on any error
    pub fn load() -> Self {
        if let Some(config_path) = Self::config_file_path() {
            if config_path.exists() {
                match Self::load_from(&config_path) {
                    Ok(config) => {
                        info!("Loaded configuration from {:?}", config_path);
                        return config;
                    }
                    Err(e) => warn!("Ignoring config file {:?}: {}", config_path, e),
                }
            }
        }

        info!("Using default configuration");
        Self::default()
    }

    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path)?;
        let config: Self = toml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to the default location
    pub fn save(&self) -> Result<PathBuf, ConfigError> {
        let config_path = Self::config_file_path().ok_or(ConfigError::NoConfigDir)?;
        self.save_to(&config_path)?;
        Ok(config_path)
    }

    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let toml_string = toml::to_string_pretty(self)?;
        fs::write(path, toml_string)?;
        info!("Saved configuration to {:?}", path);
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.bridge_addr()?;
        self.local_addr()?;
        if self.poll_interval_ms == 0 {
            return Err(ConfigError::Invalid("poll_interval_ms must be positive".into()));
        }
        if self.heartbeat.period_ms == 0 {
            return Err(ConfigError::Invalid("heartbeat.period_ms must be positive".into()));
        }
        if self.heartbeat.node_id > 0x7F {
            return Err(ConfigError::Invalid(format!(
                "heartbeat.node_id 0x{:02X} is outside 0x00..=0x7F",
                self.heartbeat.node_id
            )));
        }
        Ok(())
    }

    pub fn bridge_addr(&self) -> Result<SocketAddr, ConfigError> {
        let ip: Ipv4Addr = self
            .bridge_address
            .parse()
            .map_err(|_| ConfigError::Invalid(format!("'{}' is not an IPv4 address", self.bridge_address)))?;
        Ok(SocketAddr::V4(SocketAddrV4::new(ip, self.bridge_port)))
    }

    pub fn local_addr(&self) -> Result<SocketAddr, ConfigError> {
        match self.local_bind.parse::<SocketAddr>() {
            Ok(addr @ SocketAddr::V4(_)) => Ok(addr),
            _ => Err(ConfigError::Invalid(format!(
                "'{}' is not an IPv4 socket address",
                self.local_bind
            ))),
        }
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    pub fn sdo_timeout(&self) -> Duration {
        Duration::from_millis(self.sdo_timeout_ms)
    }

    pub fn heartbeat_period(&self) -> Duration {
        Duration::from_millis(self.heartbeat.period_ms.max(1))
    }

    /// Get the default recording directory
    pub fn default_recording_directory() -> Option<PathBuf> {
        directories::ProjectDirs::from("com", "canopen", "canopen-gateway")
            .map(|proj_dirs| proj_dirs.data_local_dir().join("recordings"))
    }

    /// Recording directory, using the platform default if not set
    pub fn recording_directory(&self) -> Option<PathBuf> {
        match self.recorder.directory {
            Some(ref dir) => Some(PathBuf::from(dir)),
            None => Self::default_recording_directory(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_bridge_conventions() {
        let config = GatewayConfig::default();
        assert_eq!(config.bridge_addr().unwrap(), "127.0.0.1:9999".parse().unwrap());
        assert_eq!(config.handshake_timeout(), Duration::from_millis(2000));
        assert_eq!(config.sdo_timeout(), Duration::from_millis(1000));
        assert_eq!(config.heartbeat.node_id, 0x78);
        assert_eq!(config.heartbeat.state, 0x05);
        assert_eq!(config.cob_id_match, CobIdMatch::Additive);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn save_and_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        let mut config = GatewayConfig::default();
        config.bridge_port = 10_000;
        config.cob_id_match = CobIdMatch::Bitwise;
        config.heartbeat.start_on_connect = true;
        config.save_to(&path).unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.contains("cob_id_match = \"bitwise\""));
        assert_eq!(GatewayConfig::load_from(&path).unwrap(), config);
    }

    #[test]
    fn partial_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "bridge_port = 5000\n[heartbeat]\nperiod_ms = 250\n").unwrap();

        let config = GatewayConfig::load_from(&path).unwrap();
        assert_eq!(config.bridge_port, 5000);
        assert_eq!(config.heartbeat.period_ms, 250);
        assert_eq!(config.heartbeat.node_id, 0x78);
        assert_eq!(config.sdo_timeout_ms, 1000);
    }

    #[test]
    fn rejects_non_ipv4_bridge() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "bridge_address = \"::1\"\n").unwrap();
        assert!(matches!(GatewayConfig::load_from(&path), Err(ConfigError::Invalid(_))));

        std::fs::write(&path, "bridge_port = \"nope\"\n").unwrap();
        assert!(matches!(GatewayConfig::load_from(&path), Err(ConfigError::Parse(_))));
    }
}
