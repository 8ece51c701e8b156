use std::env;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use fs2::available_space;
use rusqlite::{backup::Backup, Connection, OpenFlags};
use serde::{Deserialize, Serialize};
use walkdir::WalkDir;

use crate::{util, AppError, AppResult};

pub const MANIFEST_FILE_NAME: &str = "manifest.json";
pub const LEGACY_SUBDIR: &str = "legacy";
pub const TARGET_SNAPSHOT_NAME: &str = "target.sqlite3";
const PARTIAL_SUFFIX: &str = ".partial";
const REQUIRED_FREE_MULTIPLIER: f64 = 1.2;
const FAKE_FREE_BYTES_ENV: &str = "METIS_BACKUP_FAKE_FREE_BYTES";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupFile {
    pub relative_path: String,
    pub size_bytes: u64,
    pub sha256: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupManifest {
    pub tool_version: String,
    pub created_at: String,
    pub legacy_root: String,
    pub source_missing: bool,
    pub files: Vec<BackupFile>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_snapshot: Option<BackupFile>,
}

#[derive(Debug, Clone)]
pub struct BackupOutcome {
    pub directory: PathBuf,
    pub manifest_path: PathBuf,
    pub files_copied: usize,
    pub bytes_copied: u64,
    pub target_snapshot: Option<PathBuf>,
    pub source_missing: bool,
}

/// Copies the legacy store (and the target database, when present) into a
/// fresh `<backup_root>/<timestamp>` directory.
pub fn create_backup(
    legacy_root: &Path,
    target_db: Option<&Path>,
    backup_root: &Path,
) -> AppResult<BackupOutcome> {
    fs::create_dir_all(backup_root).map_err(|err| {
        AppError::from(err)
            .with_context("operation", "create_backups_dir")
            .with_context("path", backup_root.display().to_string())
    })?;

    let source_missing = !legacy_root.exists();
    if source_missing {
        tracing::warn!(
            target: "metis_migrate",
            event = "backup_source_missing",
            path = %legacy_root.display()
        );
    }
    let sources = if source_missing {
        Vec::new()
    } else {
        collect_sources(legacy_root, backup_root)?
    };
    let target_db = target_db.filter(|path| path.exists());

    let mut required: u64 = sources.iter().map(|(_, size)| *size).sum();
    if let Some(db) = target_db {
        required = required.saturating_add(fs::metadata(db).map(|m| m.len()).unwrap_or(0));
    }
    let required = ((required as f64) * REQUIRED_FREE_MULTIPLIER).ceil() as u64;
    let available = free_disk_space(backup_root)?;
    if available < required {
        return Err(AppError::new("BACKUP/LOW_DISK", "Not enough disk space for backup")
            .with_context("available_bytes", available.to_string())
            .with_context("required_bytes", required.to_string()));
    }

    let backup_dir = unique_backup_dir(backup_root, &Utc::now())?;
    fs::create_dir_all(backup_dir.join(LEGACY_SUBDIR)).map_err(|err| {
        AppError::from(err)
            .with_context("operation", "create_backup_dir")
            .with_context("path", backup_dir.display().to_string())
    })?;

    let result = (|| -> AppResult<BackupOutcome> {
        let mut files = Vec::with_capacity(sources.len());
        let mut bytes_copied = 0_u64;
        for (relative, _) in &sources {
            let from = legacy_root.join(relative);
            let to = backup_dir.join(LEGACY_SUBDIR).join(relative);
            files.push(copy_file(&from, &to, relative)?);
            bytes_copied += files.last().map(|f| f.size_bytes).unwrap_or(0);
        }

        let mut snapshot = None;
        let mut snapshot_path = None;
        if let Some(db) = target_db {
            let partial = backup_dir.join(format!("{TARGET_SNAPSHOT_NAME}{PARTIAL_SUFFIX}"));
            let final_path = backup_dir.join(TARGET_SNAPSHOT_NAME);
            run_sqlite_backup(db, &partial)?;
            fs::rename(&partial, &final_path).map_err(|err| {
                AppError::from(err)
                    .with_context("operation", "finalize_target_snapshot")
                    .with_context("path", final_path.display().to_string())
            })?;
            snapshot = Some(describe(&final_path, TARGET_SNAPSHOT_NAME)?);
            snapshot_path = Some(final_path);
        }

        let manifest = BackupManifest {
            tool_version: env!("CARGO_PKG_VERSION").to_string(),
            created_at: crate::time::now_rfc3339(),
            legacy_root: legacy_root.display().to_string(),
            source_missing,
            files,
            target_snapshot: snapshot,
        };
        let manifest_path = backup_dir.join(MANIFEST_FILE_NAME);
        let payload = serde_json::to_vec_pretty(&manifest)
            .map_err(|err| AppError::from(err).with_context("operation", "serialize_manifest"))?;
        util::write_atomic(&manifest_path, &payload).map_err(|err| {
            AppError::from(err)
                .with_context("operation", "write_manifest")
                .with_context("path", manifest_path.display().to_string())
        })?;

        Ok(BackupOutcome {
            directory: backup_dir.clone(),
            manifest_path,
            files_copied: manifest.files.len(),
            bytes_copied,
            target_snapshot: snapshot_path,
            source_missing,
        })
    })();

    match result {
        Ok(outcome) => {
            tracing::info!(
                target: "metis_migrate",
                event = "backup_created",
                path = %outcome.directory.display(),
                files = outcome.files_copied,
                bytes = outcome.bytes_copied,
                target_snapshot = outcome.target_snapshot.is_some()
            );
            Ok(outcome)
        }
        Err(err) => {
            let _ = fs::remove_dir_all(&backup_dir);
            Err(err)
        }
    }
}

pub fn read_manifest(path: &Path) -> AppResult<BackupManifest> {
    let raw = fs::read(path).map_err(|err| {
        AppError::from(err)
            .with_context("operation", "read_manifest")
            .with_context("path", path.display().to_string())
    })?;
    Ok(serde_json::from_slice(&raw)?)
}

/// Regular files under `root` with their sizes, relative to `root`, skipping
/// anything inside `exclude`.
fn collect_sources(root: &Path, exclude: &Path) -> AppResult<Vec<(PathBuf, u64)>> {
    let exclude = fs::canonicalize(exclude).unwrap_or_else(|_| exclude.to_path_buf());
    let mut out = Vec::new();
    for entry in WalkDir::new(root).follow_links(false).sort_by_file_name() {
        let entry = entry.map_err(|err| {
            let path = err
                .path()
                .map(|p| p.display().to_string())
                .unwrap_or_default();
            AppError::from(io::Error::from(err))
                .with_context("operation", "walk_legacy_store")
                .with_context("path", path)
        })?;
        if !entry.file_type().is_file() {
            continue;
        }
        let canonical = fs::canonicalize(entry.path()).unwrap_or_else(|_| entry.path().to_path_buf());
        if canonical.starts_with(&exclude) {
            continue;
        }
        let relative = entry
            .path()
            .strip_prefix(root)
            .map(Path::to_path_buf)
            .map_err(|_| {
                AppError::new("BACKUP/OUTSIDE_ROOT", "Walked outside the legacy root")
                    .with_context("path", entry.path().display().to_string())
            })?;
        let size = entry.metadata().map(|m| m.len()).unwrap_or(0);
        out.push((relative, size));
    }
    Ok(out)
}

fn copy_file(from: &Path, to: &Path, relative: &Path) -> AppResult<BackupFile> {
    if let Some(parent) = to.parent() {
        fs::create_dir_all(parent).map_err(|err| {
            AppError::from(err)
                .with_context("operation", "create_backup_subdir")
                .with_context("path", parent.display().to_string())
        })?;
    }
    fs::copy(from, to).map_err(|err| {
        AppError::from(err)
            .with_context("operation", "copy_legacy_file")
            .with_context("from", from.display().to_string())
            .with_context("to", to.display().to_string())
    })?;
    describe(to, &relative.to_string_lossy().replace('\\', "/"))
}

fn describe(path: &Path, relative: &str) -> AppResult<BackupFile> {
    let sha256 = util::file_sha256(path).map_err(|err| {
        AppError::from(err)
            .with_context("operation", "hash_backup_file")
            .with_context("path", path.display().to_string())
    })?;
    let size_bytes = fs::metadata(path).map(|m| m.len()).unwrap_or(0);
    Ok(BackupFile {
        relative_path: relative.to_string(),
        size_bytes,
        sha256,
    })
}

fn free_disk_space(path: &Path) -> AppResult<u64> {
    if let Ok(fake) = env::var(FAKE_FREE_BYTES_ENV) {
        if let Ok(value) = fake.parse::<u64>() {
            return Ok(value);
        }
    }
    available_space(path).map_err(|err| {
        AppError::from(err)
            .with_context("operation", "available_space")
            .with_context("path", path.display().to_string())
    })
}

fn unique_backup_dir(root: &Path, timestamp: &DateTime<Utc>) -> AppResult<PathBuf> {
    let base = crate::time::dir_stamp(timestamp);
    for suffix in 0..100 {
        let candidate = if suffix == 0 {
            root.join(&base)
        } else {
            root.join(format!("{base}-{suffix:02}"))
        };
        if !candidate.exists() {
            return Ok(candidate);
        }
    }
    Err(AppError::new(
        "BACKUP/NAME_COLLISION",
        "Unable to allocate backup directory",
    ))
}

fn run_sqlite_backup(src: &Path, dest: &Path) -> AppResult<()> {
    let src_flags = OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_URI;
    let src_conn = Connection::open_with_flags(src, src_flags).map_err(|err| {
        AppError::from(err)
            .with_context("operation", "open_target_for_backup")
            .with_context("path", src.display().to_string())
    })?;
    let mut dest_conn = Connection::open(dest).map_err(|err| {
        AppError::from(err)
            .with_context("operation", "create_target_snapshot")
            .with_context("path", dest.display().to_string())
    })?;

    {
        let backup = Backup::new(&src_conn, &mut dest_conn)
            .map_err(|err| AppError::from(err).with_context("operation", "backup_init"))?;
        backup
            .step(-1)
            .map_err(|err| AppError::from(err).with_context("operation", "backup_step"))?;
    }
    dest_conn.execute_batch("PRAGMA journal_mode=DELETE;").ok();

    dest_conn
        .close()
        .map_err(|(_, err)| AppError::from(err).with_context("operation", "close_snapshot"))?;
    src_conn
        .close()
        .map_err(|(_, err)| AppError::from(err).with_context("operation", "close_target"))?;
    Ok(())
}
