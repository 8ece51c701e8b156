use std::collections::BTreeSet;

use serde::Serialize;

use super::transform;
use crate::error::{MigrationError, RecordError};
use crate::legacy::{LegacyStore, LegacyUser, RecordType};
use crate::target::RelationalStore;
use crate::{AppError, AppResult};

/// Distinct rows written per category.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MigrationCounts {
    pub users: u64,
    pub api_keys: u64,
    pub personas: u64,
    pub oauth_tokens: u64,
    pub user_settings: u64,
    pub graph_memory: u64,
}

impl MigrationCounts {
    fn record(&mut self, record_type: RecordType) {
        match record_type {
            RecordType::User => self.users += 1,
            RecordType::ApiKey => self.api_keys += 1,
            RecordType::OauthToken => self.oauth_tokens += 1,
            RecordType::Setting => self.user_settings += 1,
            RecordType::Persona => self.personas += 1,
            RecordType::GraphMemory => self.graph_memory += 1,
        }
    }

    pub fn get(&self, record_type: RecordType) -> u64 {
        match record_type {
            RecordType::User => self.users,
            RecordType::ApiKey => self.api_keys,
            RecordType::OauthToken => self.oauth_tokens,
            RecordType::Setting => self.user_settings,
            RecordType::Persona => self.personas,
            RecordType::GraphMemory => self.graph_memory,
        }
    }

    /// Attribute writes across all categories.
    pub fn attributes(&self) -> u64 {
        self.api_keys + self.personas + self.oauth_tokens + self.user_settings + self.graph_memory
    }
}

#[derive(Debug, Clone, Default)]
pub struct LoadReport {
    pub users_seen: usize,
    pub counts: MigrationCounts,
    pub errors: Vec<RecordError>,
    /// User ids written in this run.
    pub users_written: BTreeSet<String>,
    /// `(user_id, attribute name)` pairs written in this run.
    pub attributes_written: BTreeSet<(String, String)>,
}

impl LoadReport {
    pub fn error_strings(&self) -> Vec<String> {
        self.errors.iter().map(ToString::to_string).collect()
    }
}

/// Copies every user and attribute from `legacy` into `target`.
///
/// Only a failure to enumerate users aborts; everything below that is
/// collected into [`LoadReport::errors`] and the batch continues.
pub fn migrate_records(legacy: &dyn LegacyStore, target: &RelationalStore) -> AppResult<LoadReport> {
    let users = legacy.list_users().map_err(|err| {
        AppError::new("MIGRATE/LIST_USERS", "Failed to enumerate legacy users").with_cause(err)
    })?;

    let mut report = LoadReport {
        users_seen: users.len(),
        ..LoadReport::default()
    };

    for user in &users {
        migrate_user(legacy, target, user, &mut report);
    }

    tracing::info!(
        target: "metis_migrate",
        event = "load_complete",
        users_seen = report.users_seen,
        users = report.counts.users,
        attributes = report.counts.attributes(),
        errors = report.errors.len()
    );
    Ok(report)
}

fn migrate_user(
    legacy: &dyn LegacyStore,
    target: &RelationalStore,
    user: &LegacyUser,
    report: &mut LoadReport,
) {
    let user_id = user.user_id.clone();
    let written = transform::user_row(user).and_then(|row| {
        target
            .upsert_user(&row)
            .map(|_| row.user_id)
            .map_err(|source| MigrationError::TargetWrite { source })
    });
    let user_id = match written {
        Ok(id) => id,
        Err(error) => {
            push_error(report, RecordError::user(user_id, error));
            return;
        }
    };
    if !report.users_written.insert(user_id.clone()) {
        push_error(
            report,
            RecordError::user(
                user_id.clone(),
                MigrationError::Superseded {
                    name: format!("user {user_id}"),
                },
            ),
        );
        return;
    }
    report.counts.record(RecordType::User);

    for record_type in RecordType::ATTRIBUTES {
        let records = match legacy.list_attributes_by_type(&user_id, record_type) {
            Ok(records) => records,
            Err(source) => {
                push_error(
                    report,
                    RecordError::category(
                        user_id.clone(),
                        record_type,
                        MigrationError::LegacyRead { source },
                    ),
                );
                continue;
            }
        };

        for record in records {
            let result = transform::attribute_row(&record).and_then(|row| {
                target
                    .upsert_attribute(&row)
                    .map(|_| row.name)
                    .map_err(|source| MigrationError::TargetWrite { source })
            });
            let error = match result {
                Ok(name) => {
                    let key = (user_id.clone(), name);
                    if report.attributes_written.contains(&key) {
                        MigrationError::Superseded { name: key.1 }
                    } else {
                        report.counts.record(record_type);
                        report.attributes_written.insert(key);
                        continue;
                    }
                }
                Err(error) => error,
            };
            push_error(
                report,
                RecordError::record(user_id.clone(), record_type, record.id.clone(), error),
            );
        }
    }
}

fn push_error(report: &mut LoadReport, error: RecordError) {
    tracing::warn!(
        target: "metis_migrate",
        event = "record_failed",
        user_id = %error.user_id,
        category = error.category.map(RecordType::as_str).unwrap_or("user"),
        kind = error.error.kind(),
        error = %error.error
    );
    report.errors.push(error);
}
