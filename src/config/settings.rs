use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use shadowspawn::Verbosity;

/// Defaults for `shadowspawn`, read from `config.json`. Command-line flags win over these.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(default)]
pub struct Settings {
    pub verbosity: Verbosity,
    pub simulate: bool,
    /// Per-phase wait limit; absent means wait indefinitely.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub wait_timeout_secs: Option<u64>,
}

impl Settings {
    pub fn wait_timeout(&self) -> Option<Duration> {
        self.wait_timeout_secs.map(Duration::from_secs)
    }
}

fn config_dir() -> Result<PathBuf> {
    if cfg!(windows) {
        if let Ok(appdata) = std::env::var("APPDATA") {
            return Ok(PathBuf::from(appdata).join("shadowspawn"));
        }
        if let Ok(home) = std::env::var("USERPROFILE") {
            return Ok(PathBuf::from(home).join("AppData\\Roaming").join("shadowspawn"));
        }
        Err(anyhow!("APPDATA not set; cannot determine config directory"))
    } else {
        if let Ok(home) = std::env::var("HOME") {
            return Ok(PathBuf::from(home).join(".shadowspawn"));
        }
        Err(anyhow!("HOME not set; cannot determine config directory"))
    }
}

pub fn default_config_path() -> Result<PathBuf> {
    Ok(config_dir()?.join("config.json"))
}

/// Loads settings from `explicit`, or from the per-user config file when none is given.
///
/// A missing per-user file means defaults; a missing explicit file is an error.
pub fn load_settings(explicit: Option<&Path>) -> Result<Settings> {
    let path = match explicit {
        Some(p) => {
            if !p.exists() {
                return Err(anyhow!("config file '{}' not found", p.display()));
            }
            p.to_path_buf()
        }
        None => match default_config_path() {
            Ok(p) if p.exists() => p,
            _ => return Ok(Settings::default()),
        },
    };
    parse_file(&path)
}

fn parse_file(path: &Path) -> Result<Settings> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("failed to read config file '{}'", path.display()))?;
    if content.trim().is_empty() {
        return Ok(Settings::default());
    }
    serde_json::from_str(&content).with_context(|| format!("invalid config file '{}'", path.display()))
}
