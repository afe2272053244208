//! incusflow settings
//!
//! Settings are optional: when no file is found every field takes its
//! built-in default.

pub mod error;

pub use error::*;

use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Environment variable naming a settings file directly
pub const CONFIG_ENV: &str = "INCUSFLOW_CONFIG";

const CANDIDATES: [&str; 4] = [
    "incusflow.local.yml",
    ".incusflow.local.yml",
    "incusflow.yml",
    ".incusflow.yml",
];

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// incus client binary
    pub binary: String,
    /// Locale forced on the client so its output parses the same everywhere
    pub locale: String,
    /// Remote used when a request names none
    pub remote: Option<String>,
    /// Project used when a request names none
    pub project: Option<String>,
    pub cache: CacheSettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            binary: "incus".to_string(),
            locale: "C".to_string(),
            remote: None,
            project: None,
            cache: CacheSettings::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct CacheSettings {
    pub enabled: bool,
    /// Defaults to `<cache dir>/incusflow`
    pub dir: Option<PathBuf>,
    pub ttl_secs: u64,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            dir: None,
            ttl_secs: 300,
        }
    }
}

impl CacheSettings {
    pub fn resolved_dir(&self) -> Result<PathBuf> {
        match &self.dir {
            Some(dir) => Ok(dir.clone()),
            None => Ok(dirs::cache_dir()
                .ok_or(ConfigError::ConfigDirNotFound)?
                .join("incusflow")),
        }
    }
}

/// incusflow's directory under the user config dir
pub fn get_config_dir() -> Result<PathBuf> {
    Ok(dirs::config_dir()
        .ok_or(ConfigError::ConfigDirNotFound)?
        .join("incusflow"))
}

/// Locate the settings file
///
/// Search order:
/// 1. `INCUSFLOW_CONFIG` (direct path)
/// 2. current directory: incusflow.local.yml, .incusflow.local.yml,
///    incusflow.yml, .incusflow.yml
/// 3. ~/.config/incusflow/config.yml
pub fn find_config_file() -> Result<Option<PathBuf>> {
    if let Ok(config_path) = std::env::var(CONFIG_ENV) {
        let path = PathBuf::from(config_path);
        if path.exists() {
            return Ok(Some(path));
        }
    }

    let current_dir = std::env::current_dir()?;
    for filename in &CANDIDATES {
        let path = current_dir.join(filename);
        if path.exists() {
            return Ok(Some(path));
        }
    }

    if let Ok(config_dir) = get_config_dir() {
        let global = config_dir.join("config.yml");
        if global.exists() {
            return Ok(Some(global));
        }
    }

    Ok(None)
}

/// Read settings from `path`
pub fn load_from(path: &Path) -> Result<Settings> {
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    if content.trim().is_empty() {
        return Ok(Settings::default());
    }
    serde_yaml::from_str(&content).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

/// Settings from `explicit`, or from the discovered file, or defaults
pub fn load(explicit: Option<&Path>) -> Result<Settings> {
    match explicit {
        Some(path) => load_from(path),
        None => match find_config_file()? {
            Some(path) => load_from(&path),
            None => Ok(Settings::default()),
        },
    }
}
