//! Configuration file parsing for xsnap.toml.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use xsnap_core::Creation;
use xsnap_snapshot::SnapshotOptions;

use crate::host;

/// Main configuration structure.
#[derive(Debug, Default, Deserialize)]
pub struct Config {
    /// Creation parameters of new machines
    #[serde(default)]
    pub creation: Creation,

    /// Snapshot settings
    #[serde(default)]
    pub snapshot: SnapshotConfig,
}

/// Snapshot configuration.
#[derive(Debug, Deserialize)]
pub struct SnapshotConfig {
    /// Signature written to and expected from snapshots
    #[serde(default = "default_signature")]
    pub signature: String,
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            signature: default_signature(),
        }
    }
}

fn default_signature() -> String {
    String::from_utf8_lossy(xsnap_snapshot::SIGNATURE).into_owned()
}

impl Config {
    /// Snapshot options with the host callback table
    pub fn snapshot_options(&self) -> SnapshotOptions {
        SnapshotOptions::new(host::callbacks()).with_signature(self.snapshot.signature.as_bytes())
    }
}

/// Load configuration from a file or search for default config files.
pub fn load_config(path: Option<&Path>) -> anyhow::Result<Config> {
    let config_path = path.map(PathBuf::from).or_else(find_config_file);

    match config_path {
        Some(path) if path.exists() => {
            let content = std::fs::read_to_string(&path)?;
            let config: Config = toml::from_str(&content)
                .map_err(|e| anyhow::anyhow!("Failed to parse {}: {}", path.display(), e))?;
            config
                .creation
                .validate()
                .map_err(|e| anyhow::anyhow!("Invalid [creation] in {}: {}", path.display(), e))?;
            tracing::debug!(path = %path.display(), "configuration loaded");
            Ok(config)
        }
        Some(path) => Err(anyhow::anyhow!("Config file {} not found", path.display())),
        None => Ok(Config::default()),
    }
}

/// Search for xsnap.toml in the current directory and parent directories.
fn find_config_file() -> Option<PathBuf> {
    let cwd = std::env::current_dir().ok()?;

    let mut dir = Some(cwd.as_path());
    while let Some(current) = dir {
        let path = current.join("xsnap.toml");
        if path.exists() {
            return Some(path);
        }
        dir = current.parent();
    }

    None
}
