use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::db::checkpoint::DEFAULT_RETENTION;
use crate::{AppError, AppResult};

pub const ENV_DB_PATH: &str = "HOMEDASH_DB_PATH";
pub const ENV_DATA_DIR: &str = "HOMEDASH_DATA_DIR";
pub const ENV_BACKUP_DIR: &str = "HOMEDASH_BACKUP_DIR";
pub const ENV_RETENTION: &str = "HOMEDASH_BACKUP_RETENTION";
pub const ENV_LOG: &str = "HOMEDASH_LOG";

pub const APP_DIR_NAME: &str = "homedash";
pub const DB_FILE_NAME: &str = "homedash.sqlite3";
pub const BACKUP_DIR_NAME: &str = "backups";
pub const MAX_RETENTION: usize = 100;

/// Values given on the command line; each one wins over the environment.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub db_path: Option<PathBuf>,
    pub backup_dir: Option<PathBuf>,
    pub retention: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolkitConfig {
    pub db_path: PathBuf,
    pub backup_dir: PathBuf,
    pub retention: usize,
}

impl ToolkitConfig {
    /// Resolve against the process environment.
    pub fn from_env(overrides: &ConfigOverrides) -> AppResult<Self> {
        Self::resolve(overrides, |key| std::env::var(key).ok())
    }

    /// CLI flag, then environment, then defaults. `env` looks up one
    /// variable by name.
    pub fn resolve<F>(overrides: &ConfigOverrides, env: F) -> AppResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = |key: &str| env(key).filter(|value| !value.trim().is_empty());

        let db_path = match (&overrides.db_path, env(ENV_DB_PATH), env(ENV_DATA_DIR)) {
            (Some(path), _, _) => path.clone(),
            (None, Some(path), _) => PathBuf::from(path),
            (None, None, Some(dir)) => PathBuf::from(dir).join(DB_FILE_NAME),
            (None, None, None) => default_db_path()?,
        };

        let backup_dir = match (&overrides.backup_dir, env(ENV_BACKUP_DIR)) {
            (Some(dir), _) => dir.clone(),
            (None, Some(dir)) => PathBuf::from(dir),
            (None, None) => default_backup_dir(&db_path),
        };

        let retention = match (overrides.retention, env(ENV_RETENTION)) {
            (Some(value), _) => normalize_retention(value),
            (None, Some(raw)) => match raw.trim().parse::<usize>() {
                Ok(value) => normalize_retention(value),
                Err(_) => {
                    tracing::warn!(
                        target: "homedash",
                        event = "config_invalid_retention",
                        value = %raw,
                        fallback = DEFAULT_RETENTION
                    );
                    DEFAULT_RETENTION
                }
            },
            (None, None) => DEFAULT_RETENTION,
        };

        Ok(Self {
            db_path,
            backup_dir,
            retention,
        })
    }
}

/// Zero means "unset"; anything above the ceiling is capped.
pub fn normalize_retention(value: usize) -> usize {
    match value {
        0 => DEFAULT_RETENTION,
        value => value.min(MAX_RETENTION),
    }
}

fn default_db_path() -> AppResult<PathBuf> {
    let base = dirs::data_dir()
        .or_else(|| std::env::current_dir().ok())
        .ok_or_else(|| {
            AppError::new(
                "CONFIG/NO_DATA_DIR",
                "Failed to resolve the application data directory",
            )
        })?;
    Ok(base.join(APP_DIR_NAME).join(DB_FILE_NAME))
}

fn default_backup_dir(db_path: &Path) -> PathBuf {
    db_path
        .parent()
        .map(|parent| parent.join(BACKUP_DIR_NAME))
        .unwrap_or_else(|| PathBuf::from(BACKUP_DIR_NAME))
}
