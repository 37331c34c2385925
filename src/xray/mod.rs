pub mod config;
pub mod log;
pub mod process;
pub mod stats;

use std::path::PathBuf;

use crate::config::AppConfig;

pub use log::LogSink;
pub use process::Xray;

/// Where the engine binary lives and where per-instance files go.
#[derive(Debug, Clone)]
pub struct Engine {
    pub bin: PathBuf,
    /// Handed to the engine as XRAY_LOCATION_ASSET.
    pub asset_dir: PathBuf,
    /// Per-endpoint config files, keyed by endpoint id.
    pub instance_dir: PathBuf,
}

impl Engine {
    pub fn from_config(config: &AppConfig) -> anyhow::Result<Self> {
        Ok(Self {
            bin: config.xray_bin.clone(),
            asset_dir: config.asset_dir.clone(),
            instance_dir: AppConfig::instance_dir()?,
        })
    }

    /// Restarting the same endpoint overwrites its previous file.
    pub fn config_path(&self, endpoint_id: &str) -> PathBuf {
        self.instance_dir.join(format!("{}.json", endpoint_id))
    }
}
