use std::env;
use std::path::PathBuf;

use crate::legacy::DEFAULT_COLLECTION;
use crate::{AppError, AppResult};

pub const ENV_LEGACY_DIR: &str = "METIS_LEGACY_DIR";
pub const ENV_COLLECTION: &str = "METIS_COLLECTION";
pub const ENV_TARGET_DB: &str = "METIS_TARGET_DB";
pub const ENV_OUTPUT_DIR: &str = "METIS_OUTPUT_DIR";

const APP_DIR_NAME: &str = "metis";
const LEGACY_DIR_NAME: &str = "legacy";
const TARGET_DB_NAME: &str = "metis.sqlite3";
const BACKUP_DIR_NAME: &str = "backups";

/// Values given on the command line; they win over the environment.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub legacy_root: Option<PathBuf>,
    pub collection: Option<String>,
    pub target_db: Option<PathBuf>,
    pub output_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationConfig {
    pub legacy_root: PathBuf,
    pub collection: String,
    pub target_db: PathBuf,
    /// Report and `migration.log` land here.
    pub output_dir: PathBuf,
    pub backup_root: PathBuf,
}

impl MigrationConfig {
    pub fn resolve(overrides: ConfigOverrides) -> AppResult<Self> {
        Self::resolve_with(overrides, |key| env::var(key).ok())
    }

    pub fn resolve_with<F>(overrides: ConfigOverrides, lookup: F) -> AppResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let from_env = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());

        let legacy_root = match overrides
            .legacy_root
            .or_else(|| from_env(ENV_LEGACY_DIR).map(PathBuf::from))
        {
            Some(path) => path,
            None => data_root()?.join(LEGACY_DIR_NAME),
        };
        let target_db = match overrides
            .target_db
            .or_else(|| from_env(ENV_TARGET_DB).map(PathBuf::from))
        {
            Some(path) => path,
            None => data_root()?.join(TARGET_DB_NAME),
        };
        let output_dir = match overrides
            .output_dir
            .or_else(|| from_env(ENV_OUTPUT_DIR).map(PathBuf::from))
        {
            Some(path) => path,
            None => env::current_dir().map_err(|err| {
                AppError::from(err).with_context("operation", "current_dir")
            })?,
        };
        let collection = overrides
            .collection
            .or_else(|| from_env(ENV_COLLECTION))
            .unwrap_or_else(|| DEFAULT_COLLECTION.to_string());

        Ok(Self {
            backup_root: output_dir.join(BACKUP_DIR_NAME),
            legacy_root,
            collection,
            target_db,
            output_dir,
        })
    }
}

fn data_root() -> AppResult<PathBuf> {
    let base = match dirs::data_dir() {
        Some(dir) => dir,
        None => env::current_dir()
            .map_err(|err| AppError::from(err).with_context("operation", "current_dir"))?,
    };
    Ok(base.join(APP_DIR_NAME))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn flags_win_over_environment() {
        let overrides = ConfigOverrides {
            legacy_root: Some(PathBuf::from("/flag/legacy")),
            output_dir: Some(PathBuf::from("/flag/out")),
            ..ConfigOverrides::default()
        };
        let cfg = MigrationConfig::resolve_with(
            overrides,
            lookup(&[
                (ENV_LEGACY_DIR, "/env/legacy"),
                (ENV_TARGET_DB, "/env/target.sqlite3"),
                (ENV_COLLECTION, "personas"),
            ]),
        )
        .unwrap();
        assert_eq!(cfg.legacy_root, PathBuf::from("/flag/legacy"));
        assert_eq!(cfg.target_db, PathBuf::from("/env/target.sqlite3"));
        assert_eq!(cfg.collection, "personas");
        assert_eq!(cfg.backup_root, PathBuf::from("/flag/out/backups"));
    }

    #[test]
    fn blank_environment_values_fall_back_to_defaults() {
        let cfg = MigrationConfig::resolve_with(
            ConfigOverrides::default(),
            lookup(&[(ENV_COLLECTION, "  ")]),
        )
        .unwrap();
        assert_eq!(cfg.collection, DEFAULT_COLLECTION);
        assert!(cfg.legacy_root.ends_with("metis/legacy"));
        assert!(cfg.target_db.ends_with("metis/metis.sqlite3"));
    }
}
