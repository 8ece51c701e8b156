//! Write side of the migration: the normalized SQLite store.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;

use crate::{AppError, AppResult};

const SCHEMA_SQL: &str = include_str!("schema.sql");

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserRow {
    pub user_id: String,
    pub email: Option<String>,
    pub display_name: Option<String>,
    pub created_at: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttributeRow {
    pub user_id: String,
    pub name: String,
    pub value: String,
    pub is_encrypted: bool,
    pub created_at: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StoredAttribute {
    pub name: String,
    pub value: String,
    pub is_encrypted: bool,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PurgeCounts {
    pub users: u64,
    pub attributes: u64,
}

pub struct RelationalStore {
    conn: Connection,
    path: Option<PathBuf>,
}

impl RelationalStore {
    /// Opens (creating if needed) the database at `path` and applies the schema.
    pub fn open(path: &Path) -> AppResult<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|err| {
                AppError::from(err)
                    .with_context("operation", "create_target_dir")
                    .with_context("path", parent.display().to_string())
            })?;
        }
        let conn = Connection::open(path).map_err(|err| {
            AppError::from(err)
                .with_context("operation", "open_target_db")
                .with_context("path", path.display().to_string())
        })?;
        let journal_mode: String = conn
            .pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))
            .map_err(|err| AppError::from(err).with_context("operation", "journal_mode"))?;
        if !journal_mode.eq_ignore_ascii_case("wal") {
            tracing::warn!(
                target: "metis_migrate",
                event = "target_db_journal_mode",
                journal_mode = %journal_mode
            );
        }
        let store = Self {
            conn,
            path: Some(path.to_path_buf()),
        };
        store.init()?;
        tracing::info!(
            target: "metis_migrate",
            event = "target_db_open",
            path = %path.display(),
            sqlite_version = rusqlite::version()
        );
        Ok(store)
    }

    pub fn open_in_memory() -> AppResult<Self> {
        let conn = Connection::open_in_memory()?;
        let store = Self { conn, path: None };
        store.init()?;
        Ok(store)
    }

    fn init(&self) -> AppResult<()> {
        self.conn
            .pragma_update(None, "foreign_keys", true)
            .map_err(|err| AppError::from(err).with_context("operation", "foreign_keys"))?;
        self.conn
            .busy_timeout(Duration::from_millis(5000))
            .map_err(|err| AppError::from(err).with_context("operation", "busy_timeout"))?;
        self.conn
            .execute_batch(SCHEMA_SQL)
            .map_err(|err| AppError::from(err).with_context("operation", "apply_schema"))?;
        Ok(())
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Inserts the user or refreshes it; existing non-null columns survive null updates.
    pub fn upsert_user(&self, user: &UserRow) -> AppResult<()> {
        let now = crate::time::now_rfc3339();
        self.conn
            .execute(
                "INSERT INTO users (user_id, email, display_name, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(user_id) DO UPDATE SET
                     email = COALESCE(excluded.email, users.email),
                     display_name = COALESCE(excluded.display_name, users.display_name),
                     updated_at = excluded.updated_at",
                params![
                    user.user_id,
                    user.email,
                    user.display_name,
                    user.created_at,
                    now
                ],
            )
            .map_err(|err| {
                AppError::from(err)
                    .with_context("operation", "upsert_user")
                    .with_context("user_id", user.user_id.clone())
            })?;
        Ok(())
    }

    /// Last write wins on `(user_id, name)`; `created_at` keeps its first value.
    pub fn upsert_attribute(&self, attr: &AttributeRow) -> AppResult<()> {
        let now = crate::time::now_rfc3339();
        self.conn
            .execute(
                "INSERT INTO user_attributes (user_id, name, value, is_encrypted, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT(user_id, name) DO UPDATE SET
                     value = excluded.value,
                     is_encrypted = excluded.is_encrypted,
                     updated_at = excluded.updated_at",
                params![
                    attr.user_id,
                    attr.name,
                    attr.value,
                    attr.is_encrypted,
                    attr.created_at,
                    now
                ],
            )
            .map_err(|err| {
                AppError::from(err)
                    .with_context("operation", "upsert_attribute")
                    .with_context("user_id", attr.user_id.clone())
                    .with_context("name", attr.name.clone())
            })?;
        Ok(())
    }

    pub fn user_exists(&self, user_id: &str) -> AppResult<bool> {
        let found: Option<i64> = self
            .conn
            .query_row(
                "SELECT 1 FROM users WHERE user_id = ?1",
                params![user_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    pub fn attribute_exists(&self, user_id: &str, name: &str) -> AppResult<bool> {
        let found: Option<i64> = self
            .conn
            .query_row(
                "SELECT 1 FROM user_attributes WHERE user_id = ?1 AND name = ?2",
                params![user_id, name],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    pub fn get_attribute(&self, user_id: &str, name: &str) -> AppResult<Option<StoredAttribute>> {
        let attr = self
            .conn
            .query_row(
                "SELECT name, value, is_encrypted, created_at, updated_at
                 FROM user_attributes WHERE user_id = ?1 AND name = ?2",
                params![user_id, name],
                map_attribute,
            )
            .optional()?;
        Ok(attr)
    }

    pub fn list_attributes(&self, user_id: &str) -> AppResult<Vec<StoredAttribute>> {
        let mut stmt = self.conn.prepare(
            "SELECT name, value, is_encrypted, created_at, updated_at
             FROM user_attributes WHERE user_id = ?1 ORDER BY name",
        )?;
        let rows = stmt.query_map(params![user_id], map_attribute)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    pub fn count_users(&self) -> AppResult<u64> {
        self.count("SELECT COUNT(*) FROM users")
    }

    pub fn count_attributes(&self) -> AppResult<u64> {
        self.count("SELECT COUNT(*) FROM user_attributes")
    }

    fn count(&self, sql: &str) -> AppResult<u64> {
        let n: i64 = self.conn.query_row(sql, [], |row| row.get(0))?;
        Ok(n.max(0) as u64)
    }

    /// Deletes every user and attribute in one transaction.
    pub fn purge(&self) -> AppResult<PurgeCounts> {
        let tx = self.conn.unchecked_transaction()?;
        let attributes = tx.execute("DELETE FROM user_attributes", [])? as u64;
        let users = tx.execute("DELETE FROM users", [])? as u64;
        tx.commit()?;
        tracing::warn!(
            target: "metis_migrate",
            event = "target_purged",
            users,
            attributes
        );
        Ok(PurgeCounts { users, attributes })
    }
}

fn map_attribute(row: &rusqlite::Row<'_>) -> rusqlite::Result<StoredAttribute> {
    Ok(StoredAttribute {
        name: row.get(0)?,
        value: row.get(1)?,
        is_encrypted: row.get(2)?,
        created_at: row.get(3)?,
        updated_at: row.get(4)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user(id: &str) -> UserRow {
        UserRow {
            user_id: id.into(),
            email: None,
            display_name: None,
            created_at: "2024-01-01T00:00:00.000Z".into(),
        }
    }

    fn attr(user_id: &str, name: &str, value: &str) -> AttributeRow {
        AttributeRow {
            user_id: user_id.into(),
            name: name.into(),
            value: value.into(),
            is_encrypted: false,
            created_at: "2024-01-01T00:00:00.000Z".into(),
        }
    }

    #[test]
    fn upsert_user_keeps_existing_email() {
        let store = RelationalStore::open_in_memory().unwrap();
        let mut row = user("u1");
        row.email = Some("u1@example.com".into());
        store.upsert_user(&row).unwrap();
        store.upsert_user(&user("u1")).unwrap();
        assert_eq!(store.count_users().unwrap(), 1);
        let email: Option<String> = store
            .conn
            .query_row("SELECT email FROM users WHERE user_id = 'u1'", [], |r| r.get(0))
            .unwrap();
        assert_eq!(email.as_deref(), Some("u1@example.com"));
    }

    #[test]
    fn attribute_last_write_wins() {
        let store = RelationalStore::open_in_memory().unwrap();
        store.upsert_user(&user("u1")).unwrap();
        store.upsert_attribute(&attr("u1", "api_key_openai", "a")).unwrap();
        let mut second = attr("u1", "api_key_openai", "b");
        second.created_at = "2030-01-01T00:00:00.000Z".into();
        second.is_encrypted = true;
        store.upsert_attribute(&second).unwrap();

        assert_eq!(store.count_attributes().unwrap(), 1);
        let stored = store.get_attribute("u1", "api_key_openai").unwrap().unwrap();
        assert_eq!(stored.value, "b");
        assert!(stored.is_encrypted);
        assert_eq!(stored.created_at, "2024-01-01T00:00:00.000Z");
    }

    #[test]
    fn attribute_requires_user_row() {
        let store = RelationalStore::open_in_memory().unwrap();
        let err = store.upsert_attribute(&attr("ghost", "setting_x", "1")).unwrap_err();
        assert!(err.code().starts_with("Sqlite/"), "unexpected code {}", err.code());
        assert_eq!(err.context().get("user_id"), Some(&"ghost".to_string()));
    }

    #[test]
    fn purge_removes_everything() {
        let store = RelationalStore::open_in_memory().unwrap();
        store.upsert_user(&user("u1")).unwrap();
        store.upsert_attribute(&attr("u1", "setting_a", "1")).unwrap();
        store.upsert_attribute(&attr("u1", "setting_b", "2")).unwrap();

        let counts = store.purge().unwrap();
        assert_eq!(counts, PurgeCounts { users: 1, attributes: 2 });
        assert_eq!(store.count_users().unwrap(), 0);
        assert!(!store.user_exists("u1").unwrap());
        assert!(!store.attribute_exists("u1", "setting_a").unwrap());
    }

    #[test]
    fn list_attributes_is_sorted() {
        let store = RelationalStore::open_in_memory().unwrap();
        store.upsert_user(&user("u1")).unwrap();
        store.upsert_attribute(&attr("u1", "setting_z", "1")).unwrap();
        store.upsert_attribute(&attr("u1", "api_key_x", "2")).unwrap();
        let names: Vec<_> = store
            .list_attributes("u1")
            .unwrap()
            .into_iter()
            .map(|a| a.name)
            .collect();
        assert_eq!(names, vec!["api_key_x", "setting_z"]);
    }
}
