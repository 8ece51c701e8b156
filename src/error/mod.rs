use std::collections::HashMap;
use std::fmt;

use rusqlite::Error as SqliteError;
use serde_json::Error as SerdeJsonError;
use std::io::Error as IoError;

mod record;

pub use record::{MigrationError, RecordError};

/// A structured stage-level error. Reaching the binary edge with one of
/// these aborts the run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppError {
    /// Machine readable error code, e.g. `BACKUP/LOW_DISK`.
    pub code: String,
    /// Human friendly message printed on stderr.
    pub message: String,
    /// Arbitrary key/value pairs that provide additional context.
    pub context: HashMap<String, String>,
    /// Optional nested cause that preserves the error chain.
    pub cause: Option<Box<AppError>>,
}

pub type AppResult<T> = std::result::Result<T, AppError>;

impl AppError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        AppError {
            code: code.into(),
            message: message.into(),
            context: HashMap::new(),
            cause: None,
        }
    }

    pub fn code(&self) -> &str {
        &self.code
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn context(&self) -> &HashMap<String, String> {
        &self.context
    }

    pub fn cause(&self) -> Option<&AppError> {
        self.cause.as_deref()
    }

    /// Adds a contextual key/value pair to the error.
    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }

    /// Sets the nested cause for the error.
    pub fn with_cause(mut self, cause: impl Into<AppError>) -> Self {
        self.cause = Some(Box::new(cause.into()));
        self
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.context.is_empty() {
            write!(f, "[{}] {}", self.code, self.message)
        } else {
            let mut pairs: Vec<_> = self.context.iter().collect();
            pairs.sort();
            write!(f, "[{}] {} ({:?})", self.code, self.message, pairs)
        }
    }
}

impl std::error::Error for AppError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.cause
            .as_deref()
            .map(|cause| cause as &(dyn std::error::Error + 'static))
    }
}

impl From<IoError> for AppError {
    fn from(error: IoError) -> Self {
        let code = format!("IO/{:?}", error.kind());
        let mut app_error = AppError::new(code, error.to_string());
        if let Some(os_code) = error.raw_os_error() {
            app_error = app_error.with_context("os_code", os_code.to_string());
        }
        app_error
    }
}

impl From<SerdeJsonError> for AppError {
    fn from(error: SerdeJsonError) -> Self {
        let code = if error.is_data() {
            "JSON/DATA"
        } else if error.is_syntax() {
            "JSON/SYNTAX"
        } else if error.is_eof() {
            "JSON/EOF"
        } else if error.is_io() {
            "JSON/IO"
        } else {
            "JSON/ERROR"
        };

        let mut app_error = AppError::new(code, error.to_string());
        let line = error.line();
        if line > 0 {
            app_error = app_error.with_context("line", line.to_string());
        }
        let column = error.column();
        if column > 0 {
            app_error = app_error.with_context("column", column.to_string());
        }
        app_error
    }
}

impl From<SqliteError> for AppError {
    fn from(error: SqliteError) -> Self {
        match error {
            SqliteError::QueryReturnedNoRows => {
                AppError::new("SQLITE/ROW_NOT_FOUND", "Record not found")
            }
            SqliteError::SqliteFailure(ffi, message) => {
                let code = format!("Sqlite/{:?}", ffi.code);
                let message = message.unwrap_or_else(|| ffi.to_string());
                AppError::new(code, message)
                    .with_context("extended_code", ffi.extended_code.to_string())
            }
            SqliteError::InvalidColumnName(name) => {
                AppError::new("SQLITE/COLUMN_NOT_FOUND", format!("Column not found: {name}"))
            }
            SqliteError::FromSqlConversionFailure(index, _, source) => {
                AppError::new("SQLITE/COLUMN_DECODE", source.to_string())
                    .with_context("column_index", index.to_string())
            }
            other => AppError::new("SQLITE/ERROR", other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_error_with_context_and_cause() {
        let error = AppError::new("TEST/CODE", "Something went wrong")
            .with_context("user_id", "u1")
            .with_context("category", "api_key")
            .with_cause(AppError::new("LEGACY/READ", "inner failure"));

        assert_eq!(error.code(), "TEST/CODE");
        assert_eq!(error.message(), "Something went wrong");
        assert_eq!(error.context().get("user_id"), Some(&"u1".to_string()));
        let cause = error.cause().expect("cause present");
        assert_eq!(cause.message(), "inner failure");
        assert_eq!(cause.code(), "LEGACY/READ");
        assert_eq!(
            std::error::Error::source(&error).map(ToString::to_string),
            Some("[LEGACY/READ] inner failure".to_string())
        );
    }

    #[test]
    fn serde_json_errors_capture_position() {
        let err: SerdeJsonError =
            serde_json::from_str::<serde_json::Value>("{\"foo\": }").expect_err("invalid json");
        let app_error = AppError::from(err);
        assert_eq!(app_error.code(), "JSON/SYNTAX");
        assert!(app_error.context().contains_key("line"));
        assert!(app_error.context().contains_key("column"));
    }

    #[test]
    fn sqlite_no_rows_translates_to_specific_code() {
        let app_error = AppError::from(SqliteError::QueryReturnedNoRows);
        assert_eq!(app_error.code(), "SQLITE/ROW_NOT_FOUND");
    }

    #[test]
    fn io_error_contains_raw_code_when_available() {
        let err = IoError::from_raw_os_error(2);
        let app_error = AppError::from(err);
        assert_eq!(app_error.code(), "IO/NotFound");
        assert_eq!(app_error.context().get("os_code"), Some(&"2".to_string()));
    }

    #[test]
    fn display_orders_context_keys() {
        let error = AppError::new("BACKUP/LOW_DISK", "Not enough disk space")
            .with_context("required_bytes", "10")
            .with_context("available_bytes", "5");
        let rendered = error.to_string();
        let available = rendered.find("available_bytes").unwrap();
        let required = rendered.find("required_bytes").unwrap();
        assert!(available < required);
        assert!(rendered.starts_with("[BACKUP/LOW_DISK]"));
    }
}
