//! Client configuration management.
//!
//! Configuration is stored as JSON:
//! - Linux: `$XDG_CONFIG_HOME/pcs/config.json` (or `~/.config/pcs/config.json`)
//! - Windows: `%APPDATA%/pcs/config.json`
//!
//! The same directory holds the account list, the directory cache mirror and
//! the download resume records (see [`StatePaths`]).

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Errors from configuration operations.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("unknown option: {0}")]
    UnknownOption(String),

    #[error("invalid value for {option}: {reason}")]
    InvalidValue { option: String, reason: String },

    #[error("no configuration directory available")]
    NoConfigDir,
}

/// Option names accepted by [`PcsConfig::set`] and [`PcsConfig::get`].
pub const OPTIONS: &[&str] = &[
    "appid",
    "user_agent",
    "cache_size",
    "max_parallel",
    "savedir",
    "cache_ttl_secs",
];

const MIN_CACHE_SIZE_KIB: u32 = 64;
const MAX_CACHE_SIZE_KIB: u32 = 64 * 1024;
const MAX_PARALLEL: usize = 500;

/// Client tunables.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PcsConfig {
    /// Application id sent with every remote call.
    #[serde(default = "default_appid")]
    pub appid: u32,

    #[serde(default = "default_user_agent")]
    pub user_agent: String,

    /// Transfer chunk size in KiB.
    #[serde(default = "default_cache_size")]
    pub cache_size: u32,

    /// Worker pool size per transfer.
    #[serde(default = "default_max_parallel")]
    pub max_parallel: usize,

    /// Root directory for downloads.
    #[serde(default = "default_savedir")]
    pub savedir: PathBuf,

    /// Directory cache TTL in seconds.
    #[serde(default = "default_cache_ttl_secs")]
    pub cache_ttl_secs: u64,
}

fn default_appid() -> u32 {
    266719
}

fn default_user_agent() -> String {
    "netdisk;pcs-rs".into()
}

fn default_cache_size() -> u32 {
    4096
}

fn default_max_parallel() -> usize {
    8
}

fn default_savedir() -> PathBuf {
    data_dir()
        .map(|d| d.join("pcs").join("download"))
        .unwrap_or_else(|| PathBuf::from("download"))
}

fn default_cache_ttl_secs() -> u64 {
    60
}

impl Default for PcsConfig {
    fn default() -> Self {
        Self {
            appid: default_appid(),
            user_agent: default_user_agent(),
            cache_size: default_cache_size(),
            max_parallel: default_max_parallel(),
            savedir: default_savedir(),
            cache_ttl_secs: default_cache_ttl_secs(),
        }
    }
}

impl PcsConfig {
    /// Loads configuration from the default location.
    pub fn load() -> Result<Self, ConfigError> {
        let paths = StatePaths::default_paths().ok_or(ConfigError::NoConfigDir)?;
        Ok(Self::load_from(&paths.config))
    }

    /// Loads configuration from `path`. A missing file yields defaults; a
    /// malformed one is logged and also yields defaults.
    pub fn load_from(path: &Path) -> Self {
        let data = match std::fs::read_to_string(path) {
            Ok(d) => d,
            Err(e) => {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!(path = %path.display(), error = %e, "failed to read config, using defaults");
                }
                return Self::default();
            }
        };

        match serde_json::from_str(&data) {
            Ok(config) => config,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "malformed config, using defaults");
                Self::default()
            }
        }
    }

    /// Saves to the default location.
    pub fn save(&self) -> Result<(), ConfigError> {
        let paths = StatePaths::default_paths().ok_or(ConfigError::NoConfigDir)?;
        self.save_to(&paths.config)
    }

    /// Writes the configuration to `path` through a temporary file.
    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        let json = serde_json::to_string_pretty(self)?;
        write_atomic(path, json.as_bytes())?;
        debug!(path = %path.display(), "configuration saved");
        Ok(())
    }

    /// Updates one option by name.
    pub fn set(&mut self, option: &str, value: &str) -> Result<(), ConfigError> {
        let invalid = |reason: &str| ConfigError::InvalidValue {
            option: option.to_string(),
            reason: reason.to_string(),
        };

        match option {
            "appid" => {
                let v: u32 = value.trim().parse().map_err(|_| invalid("not an integer"))?;
                if v == 0 {
                    return Err(invalid("must be positive"));
                }
                self.appid = v;
            }
            "user_agent" => {
                if value.trim().is_empty() {
                    return Err(invalid("must not be empty"));
                }
                self.user_agent = value.to_string();
            }
            "cache_size" => {
                let v: u32 = value.trim().parse().map_err(|_| invalid("not an integer"))?;
                if !(MIN_CACHE_SIZE_KIB..=MAX_CACHE_SIZE_KIB).contains(&v) {
                    return Err(invalid(&format!(
                        "must be between {MIN_CACHE_SIZE_KIB} and {MAX_CACHE_SIZE_KIB} KiB"
                    )));
                }
                self.cache_size = v;
            }
            "max_parallel" => {
                let v: usize = value.trim().parse().map_err(|_| invalid("not an integer"))?;
                if !(1..=MAX_PARALLEL).contains(&v) {
                    return Err(invalid(&format!("must be between 1 and {MAX_PARALLEL}")));
                }
                self.max_parallel = v;
            }
            "savedir" => {
                if value.trim().is_empty() {
                    return Err(invalid("must not be empty"));
                }
                self.savedir = PathBuf::from(value);
            }
            "cache_ttl_secs" => {
                let v: u64 = value.trim().parse().map_err(|_| invalid("not an integer"))?;
                if v == 0 {
                    return Err(invalid("must be at least 1"));
                }
                self.cache_ttl_secs = v;
            }
            _ => return Err(ConfigError::UnknownOption(option.to_string())),
        }
        Ok(())
    }

    /// Renders one option's current value.
    pub fn get(&self, option: &str) -> Result<String, ConfigError> {
        Ok(match option {
            "appid" => self.appid.to_string(),
            "user_agent" => self.user_agent.clone(),
            "cache_size" => self.cache_size.to_string(),
            "max_parallel" => self.max_parallel.to_string(),
            "savedir" => self.savedir.display().to_string(),
            "cache_ttl_secs" => self.cache_ttl_secs.to_string(),
            _ => return Err(ConfigError::UnknownOption(option.to_string())),
        })
    }

    /// Chunk size in bytes.
    pub fn chunk_size(&self) -> u64 {
        self.cache_size as u64 * 1024
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }
}

/// Locations of the files the client owns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatePaths {
    pub root: PathBuf,
    pub config: PathBuf,
    pub accounts: PathBuf,
    pub dircache: PathBuf,
    pub resume: PathBuf,
}

impl StatePaths {
    /// Lays out state files under `root`.
    pub fn in_dir(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        Self {
            config: root.join("config.json"),
            accounts: root.join("accounts.json"),
            dircache: root.join("dircache.json"),
            resume: root.join("resume"),
            root,
        }
    }

    /// Platform default: `<config dir>/pcs`.
    pub fn default_paths() -> Option<Self> {
        config_dir().map(|d| Self::in_dir(d.join("pcs")))
    }
}

/// Writes `data` to a sibling temp file and renames it over `path`, so a
/// reader never observes a partial file.
pub fn write_atomic(path: &Path, data: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut tmp_name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    tmp_name.push(".tmp");
    let tmp = path.with_file_name(tmp_name);

    std::fs::write(&tmp, data)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&tmp, std::fs::Permissions::from_mode(0o600))?;
    }
    std::fs::rename(&tmp, path)
}

/// Returns the platform-specific config directory.
fn config_dir() -> Option<PathBuf> {
    #[cfg(target_os = "linux")]
    {
        std::env::var("XDG_CONFIG_HOME")
            .ok()
            .map(PathBuf::from)
            .or_else(|| {
                std::env::var("HOME")
                    .ok()
                    .map(|h| PathBuf::from(h).join(".config"))
            })
    }

    #[cfg(target_os = "windows")]
    {
        std::env::var("APPDATA").ok().map(PathBuf::from)
    }

    #[cfg(not(any(target_os = "linux", target_os = "windows")))]
    {
        std::env::var("HOME")
            .ok()
            .map(|h| PathBuf::from(h).join(".config"))
    }
}

/// Returns the platform-specific data directory.
fn data_dir() -> Option<PathBuf> {
    #[cfg(target_os = "linux")]
    {
        std::env::var("XDG_DATA_HOME")
            .ok()
            .map(PathBuf::from)
            .or_else(|| {
                std::env::var("HOME")
                    .ok()
                    .map(|h| PathBuf::from(h).join(".local").join("share"))
            })
    }

    #[cfg(target_os = "windows")]
    {
        std::env::var("LOCALAPPDATA").ok().map(PathBuf::from)
    }

    #[cfg(not(any(target_os = "linux", target_os = "windows")))]
    {
        std::env::var("HOME").ok().map(PathBuf::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let config = PcsConfig::default();
        assert_eq!(config.appid, 266719);
        assert_eq!(config.user_agent, "netdisk;pcs-rs");
        assert_eq!(config.cache_size, 4096);
        assert_eq!(config.chunk_size(), 4 * 1024 * 1024);
        assert_eq!(config.max_parallel, 8);
        assert_eq!(config.cache_ttl(), Duration::from_secs(60));
        assert!(config.savedir.ends_with("download"));
    }

    #[test]
    fn missing_fields_use_defaults() {
        let config: PcsConfig = serde_json::from_str(r#"{"max_parallel": 3}"#).unwrap();
        assert_eq!(config.max_parallel, 3);
        assert_eq!(config.cache_size, 4096);
        assert_eq!(config.appid, 266719);
    }

    #[test]
    fn save_and_reload() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("nested").join("config.json");

        let mut config = PcsConfig::default();
        config.set("max_parallel", "16").unwrap();
        config.set("savedir", "/data/pcs").unwrap();
        config.save_to(&path).unwrap();

        let loaded = PcsConfig::load_from(&path);
        assert_eq!(loaded, config);
        assert!(!path.with_file_name("config.json.tmp").exists());
    }

    #[test]
    fn malformed_file_falls_back_to_defaults() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("config.json");
        std::fs::write(&path, "{not json").unwrap();
        assert_eq!(PcsConfig::load_from(&path), PcsConfig::default());
    }

    #[test]
    fn set_validates_ranges() {
        let mut config = PcsConfig::default();
        assert!(matches!(
            config.set("cache_size", "32"),
            Err(ConfigError::InvalidValue { .. })
        ));
        assert!(matches!(
            config.set("max_parallel", "0"),
            Err(ConfigError::InvalidValue { .. })
        ));
        assert!(matches!(
            config.set("max_parallel", "many"),
            Err(ConfigError::InvalidValue { .. })
        ));
        assert!(matches!(
            config.set("colour", "blue"),
            Err(ConfigError::UnknownOption(_))
        ));

        config.set("cache_size", "256").unwrap();
        assert_eq!(config.chunk_size(), 256 * 1024);
        assert_eq!(config.get("cache_size").unwrap(), "256");
    }

    #[test]
    fn every_option_is_readable() {
        let config = PcsConfig::default();
        for option in OPTIONS {
            assert!(config.get(option).is_ok(), "{option}");
        }
    }

    #[test]
    fn state_paths_layout() {
        let paths = StatePaths::in_dir("/cfg/pcs");
        assert_eq!(paths.config, PathBuf::from("/cfg/pcs/config.json"));
        assert_eq!(paths.accounts, PathBuf::from("/cfg/pcs/accounts.json"));
        assert_eq!(paths.dircache, PathBuf::from("/cfg/pcs/dircache.json"));
        assert_eq!(paths.resume, PathBuf::from("/cfg/pcs/resume"));
    }
}
