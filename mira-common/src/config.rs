//! Configuration loading and filesystem root resolution
//!
//! Configuration is resolved once at startup and injected into the
//! processing context; nothing in the pipeline reads ambient state.

use crate::{Error, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Environment variable naming the archive filesystem root.
pub const ROOT_ENV_VAR: &str = "MIRA_ROOT";

/// Settings injected into every reconcile processing context.
#[derive(Debug, Clone)]
pub struct ReconcileConfig {
    /// Archive filesystem root; partition folders live directly under it.
    pub filesystem_root: PathBuf,
    /// SQLite database path.
    pub db_path: PathBuf,
}

impl ReconcileConfig {
    pub fn new(filesystem_root: impl Into<PathBuf>, db_path: impl Into<PathBuf>) -> Self {
        Self {
            filesystem_root: filesystem_root.into(),
            db_path: db_path.into(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct ConfigFile {
    filesystem_root: Option<String>,
    db_path: Option<String>,
}

/// Resolve the archive filesystem root.
///
/// Priority order:
/// 1. Command-line argument (highest priority)
/// 2. `MIRA_ROOT` environment variable
/// 3. `mira/config.toml` under the platform config directory
/// 4. Compiled default (`/var/lib/mira` on unix, `C:\mira` elsewhere)
pub fn resolve_root_folder(cli_arg: Option<&Path>) -> PathBuf {
    if let Some(path) = cli_arg {
        return path.to_path_buf();
    }

    if let Ok(path) = std::env::var(ROOT_ENV_VAR) {
        return PathBuf::from(path);
    }

    if let Ok(file) = load_config_file() {
        if let Some(root) = file.filesystem_root {
            return PathBuf::from(root);
        }
    }

    default_root_folder()
}

/// Resolve the database path: CLI argument, config file, then
/// `<filesystem-root>/mira.db`.
pub fn resolve_db_path(cli_arg: Option<&Path>, filesystem_root: &Path) -> PathBuf {
    if let Some(path) = cli_arg {
        return path.to_path_buf();
    }

    if let Ok(file) = load_config_file() {
        if let Some(db) = file.db_path {
            return PathBuf::from(db);
        }
    }

    filesystem_root.join("mira.db")
}

fn load_config_file() -> Result<ConfigFile> {
    let path = dirs::config_dir()
        .map(|d| d.join("mira").join("config.toml"))
        .ok_or_else(|| Error::Config("Could not determine config directory".to_string()))?;

    if !path.exists() {
        return Err(Error::Config("No config file found".to_string()));
    }

    let content = std::fs::read_to_string(&path)?;
    toml::from_str(&content).map_err(|e| Error::Config(format!("Invalid config file: {}", e)))
}

fn default_root_folder() -> PathBuf {
    if cfg!(unix) {
        PathBuf::from("/var/lib/mira")
    } else {
        PathBuf::from("C:\\mira")
    }
}
