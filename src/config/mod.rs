pub mod rule;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;

pub use rule::RuleMode;

/// xrayctl application configuration.
///
/// Every field has a default, so a stored file only needs the overrides
/// the user actually changed (default-merge on load).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Local SOCKS listen port
    #[serde(default = "default_socks_port")]
    pub socks_port: u16,

    /// Local HTTP listen port
    #[serde(default = "default_http_port")]
    pub http_port: u16,

    /// Expose the local inbounds to the LAN
    #[serde(default)]
    pub allow_lan: bool,

    /// Subscription auto-update interval, minutes
    #[serde(default = "default_sub_update_interval")]
    pub sub_update_interval: u32,

    /// Endpoint auto-test interval, minutes
    #[serde(default = "default_ep_test_interval")]
    pub ep_test_interval: u32,

    /// Concurrent latency tests
    #[serde(default = "default_ep_test_concurrency")]
    pub ep_test_concurrency: u32,

    /// URL probed through each candidate endpoint
    #[serde(default = "default_ep_test_url")]
    pub ep_test_url: String,

    /// Routing-rule profile for the live instance
    #[serde(default)]
    pub rule: RuleMode,

    /// Engine binary; bare name resolves through PATH
    #[serde(default = "default_xray_bin")]
    pub xray_bin: PathBuf,

    /// Directory handed to the engine as XRAY_LOCATION_ASSET
    #[serde(default = "default_asset_dir")]
    pub asset_dir: PathBuf,

    /// Subscription definitions; synced endpoints live in the store
    #[serde(default)]
    pub subscriptions: Vec<crate::store::Subscription>,
}

fn default_socks_port() -> u16 {
    1089
}

fn default_http_port() -> u16 {
    1090
}

fn default_sub_update_interval() -> u32 {
    60
}

fn default_ep_test_interval() -> u32 {
    3
}

fn default_ep_test_concurrency() -> u32 {
    32
}

fn default_ep_test_url() -> String {
    "https://www.google.com/generate_204".to_string()
}

fn default_xray_bin() -> PathBuf {
    PathBuf::from("xray")
}

fn default_asset_dir() -> PathBuf {
    dirs::data_dir()
        .map(|dir| dir.join("xrayctl"))
        .unwrap_or_else(|| PathBuf::from("."))
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            socks_port: default_socks_port(),
            http_port: default_http_port(),
            allow_lan: false,
            sub_update_interval: default_sub_update_interval(),
            ep_test_interval: default_ep_test_interval(),
            ep_test_concurrency: default_ep_test_concurrency(),
            ep_test_url: default_ep_test_url(),
            rule: RuleMode::default(),
            xray_bin: default_xray_bin(),
            asset_dir: default_asset_dir(),
            subscriptions: Vec::new(),
        }
    }
}

impl AppConfig {
    /// Get the default config file path
    pub fn default_path() -> Result<PathBuf> {
        let config_dir =
            dirs::config_dir().ok_or_else(|| anyhow::anyhow!("Could not find config directory"))?;

        Ok(config_dir.join("xrayctl").join("config.yaml"))
    }

    /// Per-instance engine config files live next to the app config.
    pub fn instance_dir() -> Result<PathBuf> {
        let config_dir =
            dirs::config_dir().ok_or_else(|| anyhow::anyhow!("Could not find config directory"))?;

        Ok(config_dir.join("xrayctl").join("instances"))
    }

    /// Load configuration from file, merging defaults under any stored
    /// overrides.
    pub fn load() -> Result<Self> {
        let path = Self::default_path()?;

        if !path.exists() {
            return Ok(Self::default());
        }

        let contents = fs::read_to_string(&path)?;
        let config: AppConfig = serde_yaml::from_str(&contents)?;
        Ok(config)
    }

    /// Save configuration to file
    pub fn save(&self) -> Result<()> {
        let path = Self::default_path()?;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let contents = serde_yaml::to_string(self)?;
        fs::write(&path, contents)?;

        Ok(())
    }
}
