use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;

fn default_connect_timeout() -> u64 {
    15
}

fn default_stall_timeout() -> u64 {
    180
}

fn default_resource_timeout() -> u64 {
    600
}

/// Global configuration loaded from `~/.config/msave/config.toml`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SaverConfig {
    /// Connect timeout in seconds.
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    /// Abort the transfer when no data arrives for this many seconds.
    #[serde(default = "default_stall_timeout")]
    pub stall_timeout_secs: u64,
    /// Hard cap on one whole transfer, in seconds.
    #[serde(default = "default_resource_timeout")]
    pub resource_timeout_secs: u64,
    /// Private directory for in-flight and placed payloads
    /// (None = `$TMPDIR/msave`).
    #[serde(default)]
    pub scratch_dir: Option<PathBuf>,
    /// Directory the folder store commits into (None = XDG data home).
    #[serde(default)]
    pub library_dir: Option<PathBuf>,
}

impl Default for SaverConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: default_connect_timeout(),
            stall_timeout_secs: default_stall_timeout(),
            resource_timeout_secs: default_resource_timeout(),
            scratch_dir: None,
            library_dir: None,
        }
    }
}

impl SaverConfig {
    /// Scratch directory for in-flight and placed payloads.
    pub fn scratch_dir(&self) -> PathBuf {
        self.scratch_dir
            .clone()
            .unwrap_or_else(|| std::env::temp_dir().join("msave"))
    }

    /// Library directory for the folder store.
    pub fn library_dir(&self) -> Result<PathBuf> {
        if let Some(dir) = &self.library_dir {
            return Ok(dir.clone());
        }
        let xdg_dirs = xdg::BaseDirectories::with_prefix("msave")?;
        Ok(xdg_dirs.get_data_home().join("library"))
    }
}

pub fn config_path() -> Result<PathBuf> {
    let xdg_dirs = xdg::BaseDirectories::with_prefix("msave")?;
    Ok(xdg_dirs.place_config_file("config.toml")?)
}

/// Load configuration from disk, creating a default file if none exists.
pub fn load_or_init() -> Result<SaverConfig> {
    let path = config_path()?;
    if !path.exists() {
        let default_cfg = SaverConfig::default();
        let toml = toml::to_string_pretty(&default_cfg)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&path, toml)?;
        tracing::info!("created default config at {}", path.display());
        return Ok(default_cfg);
    }

    let data = fs::read_to_string(&path)?;
    let cfg: SaverConfig = toml::from_str(&data)?;
    Ok(cfg)
}
