use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};
use crate::motion::branches;

pub const CONFIG_FILE: &str = "sentrycast.json";
pub const CONFIG_DIR_ENV: &str = "SENTRYCAST_CONFIG_DIR";
pub const DATA_DIR_ENV: &str = "SENTRYCAST_DATA_DIR";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Description of the capture element(s) heading the backbone
    pub source: String,
    /// Seconds without movement before motion counts as finished
    pub motion_gap: u64,
    /// Where snapshots and recordings are written
    pub output_dir: PathBuf,
    /// Backbone template; `{src}` and `{motion_gap}` are substituted
    pub backbone: String,
    /// Fan-out stage the branches are attached to
    pub junction: String,
    /// Stage whose element events drive the automation
    pub analysis_stage: String,
    /// Branch descriptions replacing or adding to the built-in ones
    pub branches: HashMap<String, String>,
    /// React to motion by taking snapshots, recording and previewing
    pub automation: bool,
    /// Seconds between flow statistics log lines, 0 to disable
    pub stats_interval: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            source: "testsrc motion-period=100 motion-length=10".to_string(),
            motion_gap: 3,
            output_dir: data_dir(),
            backbone: branches::BACKBONE.to_string(),
            junction: branches::DEFAULT_JUNCTION.to_string(),
            analysis_stage: branches::DEFAULT_ANALYSIS.to_string(),
            branches: HashMap::new(),
            automation: true,
            stats_interval: 10,
        }
    }
}

impl Config {
    /// Load from `path`, or from the default location when `None`.
    ///
    /// A missing file at the default location yields the defaults; an
    /// explicitly named file must exist.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let (path, required) = match path {
            Some(path) => (path.to_path_buf(), true),
            None => (config_dir().join(CONFIG_FILE), false),
        };

        if !required && !path.exists() {
            debug!("Config: {} not found, using defaults", path.display());
            return Ok(Self::default());
        }

        let raw = std::fs::read_to_string(&path)?;
        let config: Config = serde_json::from_str(&raw)
            .map_err(|e| Error::config(format!("{}: {}", path.display(), e)))?;
        info!("Config: loaded {}", path.display());
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.source.trim().is_empty() {
            return Err(Error::config("source must not be empty"));
        }
        if self.junction.is_empty() || self.analysis_stage.is_empty() {
            return Err(Error::config("junction and analysis_stage must be named"));
        }
        Ok(())
    }

    /// Substitution map for the backbone template
    pub fn backbone_params(&self) -> HashMap<String, String> {
        HashMap::from([
            ("src".to_string(), self.source.clone()),
            ("motion_gap".to_string(), self.motion_gap.to_string()),
        ])
    }
}

/// `$SENTRYCAST_CONFIG_DIR`, else the XDG config directory
pub fn config_dir() -> PathBuf {
    dir_from_env(CONFIG_DIR_ENV, "XDG_CONFIG_HOME", ".config")
}

/// `$SENTRYCAST_DATA_DIR`, else the XDG data directory
pub fn data_dir() -> PathBuf {
    dir_from_env(DATA_DIR_ENV, "XDG_DATA_HOME", ".local/share")
}

fn dir_from_env(own: &str, xdg: &str, home_relative: &str) -> PathBuf {
    if let Some(dir) = std::env::var_os(own).filter(|d| !d.is_empty()) {
        return PathBuf::from(dir);
    }
    let base = std::env::var_os(xdg)
        .filter(|d| !d.is_empty())
        .map(PathBuf::from)
        .or_else(|| std::env::var_os("HOME").map(|home| PathBuf::from(home).join(home_relative)))
        .unwrap_or_else(|| PathBuf::from("."));
    base.join(app_name())
}

/// Returns a version as specified in Cargo.toml
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

pub fn app_name() -> &'static str {
    env!("CARGO_PKG_NAME")
}
