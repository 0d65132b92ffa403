//! Settings resolution
//!
//! Every path setting is resolved in priority order:
//! 1. Command-line argument or its environment variable (handled by the CLI)
//! 2. TOML config file
//! 3. Platform default
//!
//! The backup directory must lie outside the Tags directory and must not
//! contain it.

use crate::backup::paths_overlap;
use crate::error::ConfigError;
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};

pub const APP_NAME: &str = "plugtag";
pub const CONFIG_FILE_NAME: &str = "config.toml";

/// Host store location, relative to the home directory.
const DEFAULT_TAGS_DIR: &str = "Music/Audio Music Apps/Databases/Tags";
const SYSTEM_COMPONENTS_DIR: &str = "/Library/Audio/Plug-Ins/Components";
const USER_COMPONENTS_DIR: &str = "Library/Audio/Plug-Ins/Components";

/// Contents of `config.toml`. Every key is optional.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FileConfig {
    pub tags_dir: Option<PathBuf>,
    pub backup_dir: Option<PathBuf>,
    pub rules: Option<PathBuf>,
    pub components_dirs: Vec<PathBuf>,
    pub report_dir: Option<PathBuf>,
}

impl FileConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&content).map_err(|source| ConfigError::ConfigFile {
            path: path.to_path_buf(),
            source,
        })
    }

    /// An explicit path must exist. Without one, the default location is
    /// used when present and an empty config otherwise.
    pub fn resolve(explicit: Option<&Path>) -> Result<Self, ConfigError> {
        match explicit {
            Some(path) => Self::load(&expand_tilde(path)),
            None => match default_config_path() {
                Some(path) if path.is_file() => Self::load(&path),
                _ => Ok(Self::default()),
            },
        }
    }
}

/// Values given on the command line (or through their environment
/// variables). Empty means "not given".
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub tags_dir: Option<PathBuf>,
    pub backup_dir: Option<PathBuf>,
    pub rules: Option<PathBuf>,
    pub components_dirs: Vec<PathBuf>,
}

/// Fully resolved settings.
#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    pub tags_dir: PathBuf,
    pub backup_dir: PathBuf,
    pub rules_path: PathBuf,
    pub components_dirs: Vec<PathBuf>,
    pub report_dir: Option<PathBuf>,
}

impl Settings {
    pub fn resolve(overrides: Overrides, file: FileConfig) -> Result<Self, ConfigError> {
        let tags_dir = match overrides.tags_dir.or(file.tags_dir) {
            Some(path) => path,
            None => default_tags_dir()?,
        };
        let backup_dir = overrides
            .backup_dir
            .or(file.backup_dir)
            .unwrap_or_else(default_backup_dir);
        let rules_path = overrides
            .rules
            .or(file.rules)
            .unwrap_or_else(default_rules_path);
        let components_dirs = if !overrides.components_dirs.is_empty() {
            overrides.components_dirs
        } else if !file.components_dirs.is_empty() {
            file.components_dirs
        } else {
            default_components_dirs()
        };

        let tags_dir = expand_tilde(&tags_dir);
        let backup_dir = expand_tilde(&backup_dir);
        if paths_overlap(&tags_dir, &backup_dir) {
            return Err(ConfigError::invalid(
                "backup_dir",
                format!("{:?} and tags_dir {:?} must not contain each other", backup_dir, tags_dir),
            ));
        }

        Ok(Self {
            tags_dir,
            backup_dir,
            rules_path: expand_tilde(&rules_path),
            components_dirs: components_dirs.iter().map(|p| expand_tilde(p)).collect(),
            report_dir: file.report_dir.map(|p| expand_tilde(&p)),
        })
    }
}

/// Replace a leading `~` with the home directory.
pub fn expand_tilde(path: &Path) -> PathBuf {
    let Ok(rest) = path.strip_prefix("~") else {
        return path.to_path_buf();
    };
    match dirs::home_dir() {
        Some(home) => home.join(rest),
        None => path.to_path_buf(),
    }
}

/// `<config dir>/plugtag/config.toml`
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join(APP_NAME).join(CONFIG_FILE_NAME))
}

fn default_tags_dir() -> Result<PathBuf, ConfigError> {
    dirs::home_dir()
        .map(|home| home.join(DEFAULT_TAGS_DIR))
        .ok_or_else(|| ConfigError::invalid("tags_dir", "no home directory; set it explicitly"))
}

fn default_backup_dir() -> PathBuf {
    dirs::data_local_dir()
        .map(|d| d.join(APP_NAME).join("backups"))
        .unwrap_or_else(|| PathBuf::from("./backup"))
}

fn default_rules_path() -> PathBuf {
    dirs::config_dir()
        .map(|d| d.join(APP_NAME).join("rules.json"))
        .unwrap_or_else(|| PathBuf::from("./rules.json"))
}

/// System and user Audio Unit folders.
pub fn default_components_dirs() -> Vec<PathBuf> {
    let mut dirs = vec![PathBuf::from(SYSTEM_COMPONENTS_DIR)];
    if let Some(home) = dirs::home_dir() {
        dirs.push(home.join(USER_COMPONENTS_DIR));
    }
    dirs
}
