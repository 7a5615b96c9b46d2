// src/settings.rs
//
// Read-only TOML settings: named port profiles and the default log filter.
//
//   log_filter = "info"
//
//   [[profiles]]
//   name = "bench-psu"
//   path = "/dev/ttyUSB0"
//   baud_rate = 115200
//   write_termination = "\r\n"

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::io::ConnectionConfig;

const APP_DIR: &str = "serialtap";
const SETTINGS_FILE: &str = "settings.toml";

/// A named connection configuration
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct PortProfile {
    pub name: String,
    #[serde(flatten)]
    pub connection: ConnectionConfig,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct AppSettings {
    #[serde(default)]
    pub profiles: Vec<PortProfile>,
    /// `EnvFilter` directive used when `RUST_LOG` is unset
    #[serde(default = "default_log_filter")]
    pub log_filter: String,
    /// Directory for log files (None = stderr only)
    #[serde(default)]
    pub reports_dir: Option<PathBuf>,
}

fn default_log_filter() -> String {
    "info".to_string()
}

impl Default for AppSettings {
    fn default() -> Self {
        Self {
            profiles: Vec::new(),
            log_filter: default_log_filter(),
            reports_dir: None,
        }
    }
}

impl AppSettings {
    pub fn find_profile(&self, name: &str) -> Option<&PortProfile> {
        self.profiles.iter().find(|p| p.name == name)
    }
}

/// Default settings location: `<config dir>/serialtap/settings.toml`
pub fn settings_path() -> Result<PathBuf, String> {
    dirs::config_dir()
        .map(|dir| dir.join(APP_DIR).join(SETTINGS_FILE))
        .ok_or_else(|| "Failed to resolve config directory".to_string())
}

/// Load settings from `path`. A missing file yields defaults.
pub fn load_settings(path: &Path) -> Result<AppSettings, String> {
    if !path.exists() {
        return Ok(AppSettings::default());
    }

    let contents = std::fs::read_to_string(path)
        .map_err(|e| format!("Failed to read settings {}: {}", path.display(), e))?;
    let settings: AppSettings = toml::from_str(&contents)
        .map_err(|e| format!("Failed to parse settings {}: {}", path.display(), e))?;

    let mut seen = std::collections::HashSet::new();
    for profile in &settings.profiles {
        if !seen.insert(profile.name.as_str()) {
            return Err(format!("Duplicate profile name: {}", profile.name));
        }
    }
    Ok(settings)
}

/// Load settings from the default location
pub fn load_default_settings() -> Result<AppSettings, String> {
    load_settings(&settings_path()?)
}
