//! The sequential backup -> load -> validate -> report pipeline.

use std::fmt;
use std::path::PathBuf;

use serde::Serialize;
use uuid::Uuid;

use crate::config::MigrationConfig;
use crate::legacy::LegacyStore;
use crate::target::RelationalStore;
use crate::{AppError, AppResult};

pub mod backup;
pub mod execute;
pub mod report;
pub mod transform;
pub mod validator;

pub use backup::{create_backup, BackupOutcome};
pub use execute::{migrate_records, LoadReport, MigrationCounts};
pub use report::{print_summary, write_report, MigrationReport};
pub use validator::{validate_migration, ValidationReport};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MigrationState {
    Started,
    BackedUp,
    Migrated,
    Validated,
    Reported,
    Failed,
}

impl MigrationState {
    pub fn can_transition_to(self, next: MigrationState) -> bool {
        use MigrationState::*;
        matches!(
            (self, next),
            (Started, BackedUp)
                | (BackedUp, Migrated)
                | (Migrated, Validated)
                | (Validated, Reported)
                | (Started | BackedUp | Migrated | Validated, Failed)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, MigrationState::Reported | MigrationState::Failed)
    }
}

impl fmt::Display for MigrationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            MigrationState::Started => "STARTED",
            MigrationState::BackedUp => "BACKED_UP",
            MigrationState::Migrated => "MIGRATED",
            MigrationState::Validated => "VALIDATED",
            MigrationState::Reported => "REPORTED",
            MigrationState::Failed => "FAILED",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StateTransition {
    pub state: MigrationState,
    pub at: String,
}

impl StateTransition {
    pub fn now(state: MigrationState) -> Self {
        Self {
            state,
            at: crate::time::now_rfc3339(),
        }
    }
}

/// Tracks the run's position in the state machine.
#[derive(Debug)]
pub struct RunTracker {
    run_id: String,
    state: MigrationState,
    history: Vec<StateTransition>,
}

impl RunTracker {
    pub fn start() -> Self {
        let run_id = Uuid::now_v7().to_string();
        tracing::info!(
            target: "metis_migrate",
            event = "migration_state",
            run_id = %run_id,
            state = %MigrationState::Started
        );
        Self {
            run_id,
            state: MigrationState::Started,
            history: vec![StateTransition::now(MigrationState::Started)],
        }
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn state(&self) -> MigrationState {
        self.state
    }

    pub fn history(&self) -> &[StateTransition] {
        &self.history
    }

    pub fn advance(&mut self, next: MigrationState) -> AppResult<()> {
        if !self.state.can_transition_to(next) {
            return Err(AppError::new(
                "MIGRATE/INVALID_TRANSITION",
                format!("Cannot move from {} to {}", self.state, next),
            ));
        }
        self.state = next;
        self.history.push(StateTransition::now(next));
        tracing::info!(
            target: "metis_migrate",
            event = "migration_state",
            run_id = %self.run_id,
            state = %next
        );
        Ok(())
    }

    /// Moves to FAILED and hands the error back for propagation.
    pub fn fail(&mut self, stage: &str, err: AppError) -> AppError {
        tracing::error!(
            target: "metis_migrate",
            event = "migration_failed",
            run_id = %self.run_id,
            stage,
            from = %self.state,
            code = err.code(),
            error = %err
        );
        if !self.state.is_terminal() {
            self.state = MigrationState::Failed;
            self.history.push(StateTransition::now(MigrationState::Failed));
        }
        err.with_context("stage", stage)
    }
}

#[derive(Debug, Clone, Default)]
pub struct MigrationOptions {
    pub skip_backup: bool,
    pub sample_user: Option<String>,
}

#[derive(Debug)]
pub struct MigrationOutcome {
    pub report: MigrationReport,
    pub report_path: PathBuf,
    pub backup: Option<BackupOutcome>,
    pub load: LoadReport,
}

/// Runs every stage in order. Record-level failures end up in the report;
/// any stage-level failure moves the run to FAILED and is returned.
pub fn run_migration(
    config: &MigrationConfig,
    legacy: &dyn LegacyStore,
    target: &RelationalStore,
    options: &MigrationOptions,
) -> AppResult<MigrationOutcome> {
    let mut run = RunTracker::start();

    let backup = if options.skip_backup {
        tracing::warn!(target: "metis_migrate", event = "backup_skipped");
        None
    } else {
        match create_backup(&config.legacy_root, target.path(), &config.backup_root) {
            Ok(outcome) => Some(outcome),
            Err(err) => return Err(run.fail("backup", err)),
        }
    };
    run.advance(MigrationState::BackedUp)?;

    let load = match migrate_records(legacy, target) {
        Ok(load) => load,
        Err(err) => return Err(run.fail("load", err)),
    };
    run.advance(MigrationState::Migrated)?;

    let validation = match validate_migration(target, &load, options.sample_user.as_deref()) {
        Ok(validation) => validation,
        Err(err) => return Err(run.fail("validate", err)),
    };
    run.advance(MigrationState::Validated)?;

    let report = MigrationReport::assemble(
        run.run_id(),
        &config.legacy_root,
        &config.target_db,
        backup
            .as_ref()
            .map(|b| (b.directory.as_path(), b.files_copied)),
        &load,
        validation,
        run.history().to_vec(),
    );
    let report_path = match write_report(&config.output_dir, &report) {
        Ok(path) => path,
        Err(err) => return Err(run.fail("report", err)),
    };
    run.advance(MigrationState::Reported)?;

    tracing::info!(
        target: "metis_migrate",
        event = "migration_complete",
        run_id = %report.run_id,
        report = %report_path.display(),
        errors = report.total_errors,
        validation_passed = report.validation_passed
    );

    Ok(MigrationOutcome {
        report,
        report_path,
        backup,
        load,
    })
}
