//! Configuration module
//!
//! Handles loading and saving PartyWatch configuration.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::network::NetworkConfig as NetConfig;
use crate::poller::PollerConfig;
use crate::protocol::{FramingMode, DEFAULT_PORT};
use crate::team::{TeamError, TeamLayout};

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Serialize error: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("Config file not found: {0}")]
    NotFound(PathBuf),

    #[error("Invalid team layout: {0}")]
    Layout(#[from] TeamError),
}

pub type ConfigResult<T> = Result<T, ConfigError>;

/// Offsets file of the older YAML-based tool
const LEGACY_YAML_PATH: &str = "./config/offsets.yaml";

/// Main application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Host running the memory stub
    #[serde(default = "default_host")]
    pub host: String,

    /// Port of the memory stub
    #[serde(default = "default_port")]
    pub port: u16,

    /// Address of the first team slot
    #[serde(default)]
    pub team_base_offset: u64,

    /// Size of one team slot in bytes
    #[serde(default = "default_struct_size")]
    pub pokemon_struct_size: usize,

    /// Polling settings
    #[serde(default)]
    pub poll: PollConfig,

    /// Network settings
    #[serde(default)]
    pub network: NetworkConfig,

    /// Display settings
    #[serde(default)]
    pub display: DisplayConfig,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_struct_size() -> usize {
    100
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            team_base_offset: 0,
            pokemon_struct_size: default_struct_size(),
            poll: PollConfig::default(),
            network: NetworkConfig::default(),
            display: DisplayConfig::default(),
        }
    }
}

/// Polling configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollConfig {
    /// Delay between poll cycles in ms
    #[serde(default = "default_interval")]
    pub interval_ms: u64,
    /// Stop polling after this many failed cycles in a row (0 = never)
    #[serde(default)]
    pub max_consecutive_failures: u32,
}

fn default_interval() -> u64 {
    1000
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_interval(),
            max_consecutive_failures: 0,
        }
    }
}

/// Network configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// Connection timeout in ms
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,
    /// Per-response timeout in ms (0 waits forever)
    #[serde(default)]
    pub read_timeout_ms: u64,
    /// Response framing
    #[serde(default)]
    pub framing: FramingMode,
}

fn default_connect_timeout() -> u64 {
    5000
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: default_connect_timeout(),
            read_timeout_ms: 0,
            framing: FramingMode::default(),
        }
    }
}

/// Display configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DisplayConfig {
    /// Directory holding `<image_index>.png` sprites
    #[serde(default = "default_sprite_dir")]
    pub sprite_dir: PathBuf,
}

fn default_sprite_dir() -> PathBuf {
    PathBuf::from("sprites/sprites")
}

impl Default for DisplayConfig {
    fn default() -> Self {
        Self {
            sprite_dir: default_sprite_dir(),
        }
    }
}

impl Config {
    /// Load configuration from a file
    pub fn load(path: &Path) -> ConfigResult<Self> {
        if !path.exists() {
            return Err(ConfigError::NotFound(path.to_path_buf()));
        }

        let contents = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Load configuration from the default location
    pub fn load_default() -> ConfigResult<Self> {
        let config_paths: Vec<PathBuf> = [
            dirs::config_dir().map(|p| p.join("partywatch/config.toml")),
            Some(PathBuf::from("./partywatch.toml")),
            Some(PathBuf::from("./config/offsets.toml")),
        ]
        .into_iter()
        .flatten()
        .collect();

        Self::load_first(&config_paths, Path::new(LEGACY_YAML_PATH))
    }

    /// Load the first existing file of `candidates`, or the defaults
    fn load_first(candidates: &[PathBuf], legacy_yaml: &Path) -> ConfigResult<Self> {
        if legacy_yaml.exists() {
            tracing::warn!(
                "Ignoring {}: YAML is not read, move its keys to a TOML config",
                legacy_yaml.display()
            );
        }

        for path in candidates {
            if path.exists() {
                tracing::debug!("Using config {}", path.display());
                return Self::load(path);
            }
        }

        // Return default config if no file found
        Ok(Self::default())
    }

    /// Sample configuration pointing at the usual team block
    pub fn sample() -> Self {
        Self {
            team_base_offset: 0x2024284,
            ..Default::default()
        }
    }

    /// Save configuration to a file
    pub fn save(&self, path: &Path) -> ConfigResult<()> {
        let contents = toml::to_string_pretty(self)?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        std::fs::write(path, contents)?;
        Ok(())
    }

    /// Team location, validated against the record layout
    pub fn team_layout(&self) -> ConfigResult<TeamLayout> {
        Ok(TeamLayout::new(
            self.team_base_offset,
            self.pokemon_struct_size,
        )?)
    }

    /// Settings for the memory client
    pub fn net_config(&self) -> NetConfig {
        NetConfig {
            connect_timeout_ms: self.network.connect_timeout_ms,
            read_timeout_ms: self.network.read_timeout_ms,
            framing: self.network.framing,
        }
    }

    /// Settings for the poll loop
    pub fn poller_config(&self) -> PollerConfig {
        PollerConfig {
            interval: Duration::from_millis(self.poll.interval_ms),
            max_consecutive_failures: self.poll.max_consecutive_failures,
        }
    }
}

/// Generate a sample configuration file
pub fn generate_sample_config() -> ConfigResult<String> {
    Ok(toml::to_string_pretty(&Config::sample())?)
}
