use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use super::{LegacyRecord, LegacyStore, LegacyUser, RecordType};
use crate::{util, AppError, AppResult};

pub const DEFAULT_COLLECTION: &str = "metis_user_data";
const COLLECTION_EXT: &str = "jsonl";

/// One line of a collection file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectionEntry {
    pub id: String,
    #[serde(default)]
    pub document: Value,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl CollectionEntry {
    pub fn user(user_id: &str, email: Option<&str>) -> Self {
        let mut metadata = Map::new();
        metadata.insert("type".into(), json!(RecordType::User.as_str()));
        metadata.insert("user_id".into(), json!(user_id));
        if let Some(email) = email {
            metadata.insert("email".into(), json!(email));
        }
        metadata.insert("created_at".into(), json!(crate::time::now_rfc3339()));
        Self {
            id: format!("user_{user_id}"),
            document: Value::String(String::new()),
            metadata,
        }
    }

    pub fn api_key(user_id: &str, service: &str, key: &str, encrypted: bool) -> Self {
        Self::attribute(user_id, RecordType::ApiKey, service, Value::String(key.into()), encrypted)
    }

    pub fn attribute(
        user_id: &str,
        record_type: RecordType,
        key: &str,
        document: Value,
        encrypted: bool,
    ) -> Self {
        let mut metadata = Map::new();
        metadata.insert("type".into(), json!(record_type.as_str()));
        metadata.insert("user_id".into(), json!(user_id));
        metadata.insert(record_type.key_field().into(), json!(key));
        metadata.insert("encrypted".into(), json!(encrypted));
        metadata.insert("created_at".into(), json!(crate::time::now_rfc3339()));
        Self {
            id: format!("{}_{user_id}_{key}", record_type.as_str()),
            document,
            metadata,
        }
    }

    fn meta_str(&self, field: &str) -> Option<&str> {
        self.metadata
            .get(field)
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|value| !value.is_empty())
    }

    fn record_type(&self) -> Result<RecordType, String> {
        let raw = self
            .meta_str("type")
            .ok_or_else(|| "missing metadata.type".to_string())?;
        raw.parse()
    }

    fn owner(&self) -> Option<&str> {
        self.meta_str("user_id").or_else(|| self.meta_str("email"))
    }

    fn document_text(&self) -> String {
        match &self.document {
            Value::String(text) => text.clone(),
            Value::Null => String::new(),
            other => other.to_string(),
        }
    }

    fn is_encrypted(&self) -> bool {
        match self.metadata.get("encrypted") {
            Some(Value::Bool(flag)) => *flag,
            Some(Value::String(text)) => matches!(text.as_str(), "true" | "1" | "yes"),
            Some(Value::Number(n)) => n.as_i64().unwrap_or(0) != 0,
            _ => false,
        }
    }
}

/// File-backed legacy collection, indexed by `(user_id, type)` at open.
#[derive(Debug)]
pub struct CollectionStore {
    path: PathBuf,
    entries: Vec<CollectionEntry>,
    users: BTreeMap<String, LegacyUser>,
    attributes: BTreeMap<(String, RecordType), Vec<LegacyRecord>>,
    skipped_lines: usize,
    /// Raw bytes of skipped lines, written back untouched on persist.
    unparsed: Vec<Vec<u8>>,
}

impl CollectionStore {
    /// Opens `<root>/<collection>.jsonl`. A missing file is an empty store.
    pub fn open(root: &Path, collection: &str) -> AppResult<Self> {
        let path = root.join(format!("{collection}.{COLLECTION_EXT}"));
        let mut store = Self {
            path,
            entries: Vec::new(),
            users: BTreeMap::new(),
            attributes: BTreeMap::new(),
            skipped_lines: 0,
            unparsed: Vec::new(),
        };

        if !store.path.exists() {
            tracing::info!(
                target: "metis_migrate",
                event = "legacy_collection_missing",
                path = %store.path.display()
            );
            return Ok(store);
        }

        let raw = fs::read(&store.path).map_err(|err| {
            AppError::from(err)
                .with_context("operation", "read_collection")
                .with_context("path", store.path.display().to_string())
        })?;

        for (idx, bytes) in raw.split(|b| *b == b'\n').enumerate() {
            let parsed = std::str::from_utf8(bytes)
                .map_err(|err| err.to_string())
                .and_then(|line| {
                    if line.trim().is_empty() {
                        Ok(None)
                    } else {
                        serde_json::from_str::<CollectionEntry>(line)
                            .map(Some)
                            .map_err(|err| err.to_string())
                    }
                });
            match parsed {
                Ok(Some(entry)) => store.entries.push(entry),
                Ok(None) => {}
                Err(error) => {
                    store.skipped_lines += 1;
                    store.unparsed.push(bytes.to_vec());
                    tracing::warn!(
                        target: "metis_migrate",
                        event = "legacy_line_skipped",
                        line = idx + 1,
                        error = %error
                    );
                }
            }
        }
        store.rebuild_index();

        tracing::info!(
            target: "metis_migrate",
            event = "legacy_collection_opened",
            path = %store.path.display(),
            entries = store.entries.len(),
            users = store.users.len(),
            skipped_lines = store.skipped_lines
        );
        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Lines that failed to parse at open.
    pub fn skipped_lines(&self) -> usize {
        self.skipped_lines
    }

    /// Inserts or replaces the entry with the same id and rewrites the file.
    pub fn upsert_record(&mut self, entry: CollectionEntry) -> AppResult<()> {
        match self.entries.iter_mut().find(|existing| existing.id == entry.id) {
            Some(existing) => *existing = entry,
            None => self.entries.push(entry),
        }
        self.persist()?;
        self.rebuild_index();
        Ok(())
    }

    pub fn contains_user(&self, user_id: &str) -> bool {
        self.users.contains_key(user_id)
    }

    fn persist(&self) -> AppResult<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|err| {
                AppError::from(err)
                    .with_context("operation", "create_collection_dir")
                    .with_context("path", parent.display().to_string())
            })?;
        }
        let mut payload = Vec::new();
        for entry in &self.entries {
            payload.extend_from_slice(serde_json::to_string(entry)?.as_bytes());
            payload.push(b'\n');
        }
        for line in &self.unparsed {
            payload.extend_from_slice(line);
            payload.push(b'\n');
        }
        util::write_atomic(&self.path, &payload).map_err(|err| {
            AppError::from(err)
                .with_context("operation", "write_collection")
                .with_context("path", self.path.display().to_string())
        })
    }

    fn rebuild_index(&mut self) {
        self.users.clear();
        self.attributes.clear();

        for entry in &self.entries {
            let record_type = match entry.record_type() {
                Ok(record_type) => record_type,
                Err(reason) => {
                    tracing::warn!(
                        target: "metis_migrate",
                        event = "legacy_entry_untyped",
                        id = %entry.id,
                        reason = %reason
                    );
                    continue;
                }
            };
            let Some(owner) = entry.owner().map(str::to_string) else {
                tracing::warn!(
                    target: "metis_migrate",
                    event = "legacy_entry_unowned",
                    id = %entry.id
                );
                continue;
            };

            if record_type == RecordType::User {
                let user = self
                    .users
                    .entry(owner.clone())
                    .or_insert_with(|| LegacyUser::bare(owner.clone()));
                user.email = entry.meta_str("email").map(str::to_string).or(user.email.take());
                user.display_name = entry
                    .meta_str("display_name")
                    .or_else(|| entry.meta_str("name"))
                    .map(str::to_string)
                    .or(user.display_name.take());
                user.created_at = entry
                    .meta_str("created_at")
                    .map(str::to_string)
                    .or(user.created_at.take());
                continue;
            }

            self.users
                .entry(owner.clone())
                .or_insert_with(|| LegacyUser::bare(owner.clone()));
            let key = entry
                .meta_str(record_type.key_field())
                .or_else(|| entry.meta_str("name"))
                .unwrap_or(entry.id.as_str())
                .to_string();
            let record = LegacyRecord {
                id: entry.id.clone(),
                user_id: owner.clone(),
                record_type,
                key,
                value: entry.document_text(),
                is_encrypted: entry.is_encrypted(),
                created_at: entry.meta_str("created_at").map(str::to_string),
            };
            self.attributes
                .entry((owner, record_type))
                .or_default()
                .push(record);
        }
    }
}

impl LegacyStore for CollectionStore {
    fn list_users(&self) -> AppResult<Vec<LegacyUser>> {
        Ok(self.users.values().cloned().collect())
    }

    fn list_attributes_by_type(
        &self,
        user_id: &str,
        record_type: RecordType,
    ) -> AppResult<Vec<LegacyRecord>> {
        if record_type == RecordType::User {
            return Err(AppError::new(
                "LEGACY/INVALID_TYPE",
                "User records are not attributes",
            )
            .with_context("user_id", user_id));
        }
        Ok(self
            .attributes
            .get(&(user_id.to_string(), record_type))
            .cloned()
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn write_lines(root: &Path, lines: &[&str]) {
        fs::create_dir_all(root).unwrap();
        let path = root.join(format!("{DEFAULT_COLLECTION}.{COLLECTION_EXT}"));
        fs::write(path, lines.join("\n")).unwrap();
    }

    #[test]
    fn missing_collection_is_empty() {
        let tmp = tempdir().unwrap();
        let store = CollectionStore::open(&tmp.path().join("nope"), DEFAULT_COLLECTION).unwrap();
        assert!(store.is_empty());
        assert!(store.list_users().unwrap().is_empty());
    }

    #[test]
    fn indexes_users_and_attributes() {
        let tmp = tempdir().unwrap();
        write_lines(
            tmp.path(),
            &[
                r#"{"id":"user_u1","document":"","metadata":{"type":"user","user_id":"u1","email":"u1@example.com"}}"#,
                r#"{"id":"k1","document":"sk-test-123","metadata":{"type":"api_key","user_id":"u1","service":"openai","encrypted":true}}"#,
                r#"{"id":"s1","document":{"theme":"dark"},"metadata":{"type":"setting","user_id":"u2","key":"ui"}}"#,
            ],
        );

        let store = CollectionStore::open(tmp.path(), DEFAULT_COLLECTION).unwrap();
        let users = store.list_users().unwrap();
        let ids: Vec<_> = users.iter().map(|u| u.user_id.as_str()).collect();
        assert_eq!(ids, vec!["u1", "u2"]);
        assert_eq!(users[0].email.as_deref(), Some("u1@example.com"));

        let keys = store.list_attributes_by_type("u1", RecordType::ApiKey).unwrap();
        assert_eq!(keys.len(), 1);
        assert_eq!(keys[0].key, "openai");
        assert_eq!(keys[0].value, "sk-test-123");
        assert!(keys[0].is_encrypted);

        let settings = store.list_attributes_by_type("u2", RecordType::Setting).unwrap();
        assert_eq!(settings[0].value, r#"{"theme":"dark"}"#);
        assert!(store
            .list_attributes_by_type("u2", RecordType::Persona)
            .unwrap()
            .is_empty());
    }

    #[test]
    fn skips_malformed_lines() {
        let tmp = tempdir().unwrap();
        write_lines(
            tmp.path(),
            &[
                "{not json",
                r#"{"id":"k1","document":"v","metadata":{"type":"api_key","user_id":"u1","service":"x"}}"#,
                r#"{"id":"k2","document":"v","metadata":{"type":"embedding","user_id":"u1"}}"#,
            ],
        );
        let store = CollectionStore::open(tmp.path(), DEFAULT_COLLECTION).unwrap();
        assert_eq!(store.skipped_lines(), 1);
        assert_eq!(store.len(), 2);
        assert_eq!(store.list_users().unwrap().len(), 1);
    }

    #[test]
    fn invalid_utf8_line_is_skipped_and_kept_on_rewrite() {
        let tmp = tempdir().unwrap();
        let path = tmp.path().join(format!("{DEFAULT_COLLECTION}.{COLLECTION_EXT}"));
        let mut raw = br#"{"id":"k1","document":"sk-1","metadata":{"type":"api_key","user_id":"u1","service":"openai"}}"#.to_vec();
        raw.extend_from_slice(b"\n{\"id\":\"bad\xff\"}\n");
        fs::write(&path, &raw).unwrap();

        let mut store = CollectionStore::open(tmp.path(), DEFAULT_COLLECTION).unwrap();
        assert_eq!(store.skipped_lines(), 1);
        assert!(store.contains_user("u1"));
        assert_eq!(
            store
                .list_attributes_by_type("u1", RecordType::ApiKey)
                .unwrap()[0]
                .value,
            "sk-1"
        );

        store
            .upsert_record(CollectionEntry::api_key("u2", "x", "sk-2", false))
            .unwrap();
        let rewritten = fs::read(&path).unwrap();
        assert!(rewritten
            .windows(b"bad\xff".len())
            .any(|w| w == b"bad\xff"));
        assert_eq!(
            CollectionStore::open(tmp.path(), DEFAULT_COLLECTION)
                .unwrap()
                .skipped_lines(),
            1
        );
    }

    #[test]
    fn user_type_is_not_an_attribute_query() {
        let tmp = tempdir().unwrap();
        let store = CollectionStore::open(tmp.path(), DEFAULT_COLLECTION).unwrap();
        let err = store
            .list_attributes_by_type("u1", RecordType::User)
            .unwrap_err();
        assert_eq!(err.code(), "LEGACY/INVALID_TYPE");
    }

    #[test]
    fn upsert_replaces_by_id_and_persists() {
        let tmp = tempdir().unwrap();
        let mut store = CollectionStore::open(tmp.path(), DEFAULT_COLLECTION).unwrap();
        store
            .upsert_record(CollectionEntry::api_key("u1", "openai", "old", false))
            .unwrap();
        store
            .upsert_record(CollectionEntry::api_key("u1", "openai", "new", false))
            .unwrap();
        assert_eq!(store.len(), 1);

        let reopened = CollectionStore::open(tmp.path(), DEFAULT_COLLECTION).unwrap();
        let keys = reopened
            .list_attributes_by_type("u1", RecordType::ApiKey)
            .unwrap();
        assert_eq!(keys[0].value, "new");
        assert!(reopened.contains_user("u1"));
    }
}
