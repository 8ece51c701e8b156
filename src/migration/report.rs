use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::Serialize;

use super::execute::LoadReport;
use super::validator::ValidationReport;
use super::StateTransition;
use crate::{AppError, AppResult};

pub const REPORT_PREFIX: &str = "migration_report_";

#[derive(Debug, Clone, Serialize)]
pub struct MigrationReport {
    pub run_id: String,
    pub generated_at: String,
    pub state_history: Vec<StateTransition>,
    pub legacy_root: String,
    pub target_db: String,
    pub backup_path: Option<String>,
    pub backup_files: usize,
    pub users_seen: usize,
    pub users_migrated: u64,
    pub api_keys_migrated: u64,
    pub personas_migrated: u64,
    pub oauth_tokens_migrated: u64,
    pub user_settings_migrated: u64,
    pub graph_memory_migrated: u64,
    pub errors: Vec<String>,
    pub total_errors: usize,
    pub validation: ValidationReport,
    pub validation_passed: bool,
}

impl MigrationReport {
    pub fn assemble(
        run_id: &str,
        legacy_root: &Path,
        target_db: &Path,
        backup: Option<(&Path, usize)>,
        load: &LoadReport,
        validation: ValidationReport,
        state_history: Vec<StateTransition>,
    ) -> Self {
        let errors = load.error_strings();
        Self {
            run_id: run_id.to_string(),
            generated_at: crate::time::now_rfc3339(),
            state_history,
            legacy_root: legacy_root.display().to_string(),
            target_db: target_db.display().to_string(),
            backup_path: backup.map(|(path, _)| path.display().to_string()),
            backup_files: backup.map(|(_, files)| files).unwrap_or(0),
            users_seen: load.users_seen,
            users_migrated: load.counts.users,
            api_keys_migrated: load.counts.api_keys,
            personas_migrated: load.counts.personas,
            oauth_tokens_migrated: load.counts.oauth_tokens,
            user_settings_migrated: load.counts.user_settings,
            graph_memory_migrated: load.counts.graph_memory,
            total_errors: errors.len(),
            errors,
            validation_passed: validation.validation_passed,
            validation,
        }
    }
}

/// Writes `migration_report_<timestamp>.json` into `output_dir`.
pub fn write_report(output_dir: &Path, report: &MigrationReport) -> AppResult<PathBuf> {
    fs::create_dir_all(output_dir).map_err(|err| {
        AppError::from(err)
            .with_context("operation", "create_report_dir")
            .with_context("path", output_dir.display().to_string())
    })?;

    let stamp = crate::time::file_stamp(&Utc::now());
    let mut path = output_dir.join(format!("{REPORT_PREFIX}{stamp}.json"));
    let mut suffix = 1;
    while path.exists() {
        path = output_dir.join(format!("{REPORT_PREFIX}{stamp}-{suffix:02}.json"));
        suffix += 1;
    }

    let json = serde_json::to_string_pretty(report)
        .map_err(|err| AppError::from(err).with_context("operation", "serialize_report"))?;
    fs::write(&path, json).map_err(|err| {
        AppError::from(err)
            .with_context("operation", "write_report")
            .with_context("path", path.display().to_string())
    })?;
    tracing::info!(target: "metis_migrate", event = "report_written", path = %path.display());
    Ok(path)
}

pub fn print_summary(report: &MigrationReport, out: &mut impl Write) -> io::Result<()> {
    writeln!(out, "Migration summary (run {})", report.run_id)?;
    writeln!(out, "  Legacy store:   {}", report.legacy_root)?;
    writeln!(out, "  Target db:      {}", report.target_db)?;
    match &report.backup_path {
        Some(path) => writeln!(out, "  Backup:         {path} ({} files)", report.backup_files)?,
        None => writeln!(out, "  Backup:         skipped")?,
    }
    writeln!(out, "  Users:          {}/{}", report.users_migrated, report.users_seen)?;
    writeln!(out, "  API keys:       {}", report.api_keys_migrated)?;
    writeln!(out, "  OAuth tokens:   {}", report.oauth_tokens_migrated)?;
    writeln!(out, "  Settings:       {}", report.user_settings_migrated)?;
    writeln!(out, "  Personas:       {}", report.personas_migrated)?;
    writeln!(out, "  Graph memory:   {}", report.graph_memory_migrated)?;
    writeln!(out, "  Errors:         {}", report.total_errors)?;
    for error in &report.errors {
        writeln!(out, "    - {error}")?;
    }
    let verdict = if report.validation_passed { "passed" } else { "FAILED" };
    writeln!(
        out,
        "  Validation:     {verdict} (users {}/{}, attributes {}/{})",
        report.validation.users_found,
        report.validation.users_expected,
        report.validation.attributes_found,
        report.validation.attributes_expected
    )?;
    for mismatch in &report.validation.mismatches {
        writeln!(out, "    - {mismatch}")?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migration::MigrationState;
    use tempfile::tempdir;

    fn sample_report() -> MigrationReport {
        let mut load = LoadReport::default();
        load.users_seen = 1;
        load.counts.users = 1;
        load.counts.api_keys = 1;
        MigrationReport::assemble(
            "0190b4c8-0000-7000-8000-000000000000",
            Path::new("/legacy"),
            Path::new("/target.sqlite3"),
            None,
            &load,
            ValidationReport {
                validation_passed: true,
                ..ValidationReport::default()
            },
            vec![StateTransition::now(MigrationState::Started)],
        )
    }

    #[test]
    fn report_file_uses_flat_snake_case_counts() {
        let tmp = tempdir().unwrap();
        let path = write_report(tmp.path(), &sample_report()).unwrap();
        let name = path.file_name().unwrap().to_string_lossy().to_string();
        assert!(name.starts_with(REPORT_PREFIX) && name.ends_with(".json"));

        let value: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(value["api_keys_migrated"], 1);
        assert_eq!(value["total_errors"], 0);
        assert_eq!(value["validation_passed"], true);
        assert!(value["backup_path"].is_null());
        assert_eq!(value["state_history"][0]["state"], "STARTED");
    }

    #[test]
    fn second_report_in_same_second_gets_suffix() {
        let tmp = tempdir().unwrap();
        let first = write_report(tmp.path(), &sample_report()).unwrap();
        let second = write_report(tmp.path(), &sample_report()).unwrap();
        assert_ne!(first, second);
    }

    #[test]
    fn summary_mentions_skipped_backup() {
        let mut out = Vec::new();
        print_summary(&sample_report(), &mut out).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("Backup:         skipped"));
        assert!(text.contains("API keys:       1"));
        assert!(text.contains("Validation:     passed"));
    }
}
