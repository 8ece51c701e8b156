use std::fmt;

use thiserror::Error;

use super::AppError;
use crate::legacy::RecordType;

/// Failure of a single user or attribute during the load stage.
#[derive(Debug, Clone, Error)]
pub enum MigrationError {
    #[error("legacy read failed: {source}")]
    LegacyRead {
        #[source]
        source: AppError,
    },
    #[error("invalid record: {reason}")]
    InvalidRecord { reason: String },
    #[error("target write failed: {source}")]
    TargetWrite {
        #[source]
        source: AppError,
    },
    /// A later record in the same run wrote over `name`.
    #[error("{name} was already written in this run; the later record replaced it")]
    Superseded { name: String },
}

impl MigrationError {
    pub fn invalid(reason: impl Into<String>) -> Self {
        MigrationError::InvalidRecord {
            reason: reason.into(),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            MigrationError::LegacyRead { .. } => "legacy_read",
            MigrationError::InvalidRecord { .. } => "invalid_record",
            MigrationError::TargetWrite { .. } => "target_write",
            MigrationError::Superseded { .. } => "superseded",
        }
    }
}

/// A [`MigrationError`] tagged with where it happened.
#[derive(Debug, Clone)]
pub struct RecordError {
    pub user_id: String,
    /// `None` when the user row itself failed.
    pub category: Option<RecordType>,
    pub record_id: Option<String>,
    pub error: MigrationError,
}

impl RecordError {
    pub fn user(user_id: impl Into<String>, error: MigrationError) -> Self {
        Self {
            user_id: user_id.into(),
            category: None,
            record_id: None,
            error,
        }
    }

    pub fn category(user_id: impl Into<String>, category: RecordType, error: MigrationError) -> Self {
        Self {
            user_id: user_id.into(),
            category: Some(category),
            record_id: None,
            error,
        }
    }

    pub fn record(
        user_id: impl Into<String>,
        category: RecordType,
        record_id: impl Into<String>,
        error: MigrationError,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            category: Some(category),
            record_id: Some(record_id.into()),
            error,
        }
    }
}

impl fmt::Display for RecordError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let scope = self.category.map(RecordType::as_str).unwrap_or("user");
        write!(f, "[{scope}] {}", self.user_id)?;
        if let Some(record_id) = &self.record_id {
            write!(f, " ({record_id})")?;
        }
        write!(f, ": {}", self.error)
    }
}
