use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::debug;

use judgeflow_taskgraph::EngineConfig;

/// Default config file location.
fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("judgeflow").join("config.toml"))
}

/// Load engine config: `.env`, then the config file (explicit path, or the
/// default location if it exists), then environment overrides.
pub fn load(path: Option<&Path>) -> Result<EngineConfig> {
    dotenvy::dotenv().ok();

    let path = match path {
        Some(p) => Some(p.to_path_buf()),
        None => default_config_path().filter(|p| p.exists()),
    };
    match path {
        Some(path) => {
            debug!(path = %path.display(), "loading config");
            EngineConfig::from_file(&path)
                .with_context(|| format!("failed to load config from {}", path.display()))
        }
        None => EngineConfig::from_env().context("invalid configuration in environment"),
    }
}
