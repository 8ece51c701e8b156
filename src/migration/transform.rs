use chrono::{DateTime, SecondsFormat, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::MigrationError;
use crate::legacy::{LegacyRecord, LegacyUser, RecordType};
use crate::target::{AttributeRow, UserRow};

static KEY_SANITIZER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[^a-z0-9_]+").expect("key sanitizer regex"));

/// Lowercases `raw` and collapses every run outside `[a-z0-9_]` to `_`.
pub fn normalize_key(raw: &str) -> Option<String> {
    let lower = raw.trim().to_lowercase();
    let replaced = KEY_SANITIZER.replace_all(&lower, "_");
    let trimmed = replaced.trim_matches('_');
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

pub fn attribute_name(record_type: RecordType, key: &str) -> Result<String, MigrationError> {
    let normalized = normalize_key(key).ok_or_else(|| {
        MigrationError::invalid(format!("{} key {key:?} is empty after normalization", record_type))
    })?;
    Ok(format!("{}{normalized}", record_type.attribute_prefix()))
}

/// Canonical shape of an `oauth_token_<provider>` attribute value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OAuthToken {
    pub provider: String,
    pub access_token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<String>,
    #[serde(default)]
    pub scopes: Vec<String>,
}

impl OAuthToken {
    /// Parses the legacy JSON document. `provider` fills a missing `provider` field.
    pub fn parse(provider: &str, raw: &str) -> Result<Self, MigrationError> {
        let value: Value = serde_json::from_str(raw)
            .map_err(|err| MigrationError::invalid(format!("oauth token is not json: {err}")))?;
        let object = value
            .as_object()
            .ok_or_else(|| MigrationError::invalid("oauth token is not a json object"))?;

        let text = |field: &str| {
            object
                .get(field)
                .and_then(Value::as_str)
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
        };

        let access_token = text("access_token")
            .or_else(|| text("token"))
            .ok_or_else(|| MigrationError::invalid("oauth token has no access_token"))?;

        let expires_at = match object.get("expires_at").or_else(|| object.get("expiry")) {
            Some(Value::String(s)) if !s.trim().is_empty() => Some(s.trim().to_string()),
            Some(Value::Number(n)) => n
                .as_i64()
                .and_then(|secs| DateTime::<Utc>::from_timestamp(secs, 0))
                .map(|dt| dt.to_rfc3339_opts(SecondsFormat::Secs, true)),
            _ => None,
        };

        let scopes = match object.get("scopes").or_else(|| object.get("scope")) {
            Some(Value::Array(items)) => items
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect(),
            Some(Value::String(s)) => s.split_whitespace().map(str::to_string).collect(),
            _ => Vec::new(),
        };

        Ok(OAuthToken {
            provider: text("provider").unwrap_or_else(|| provider.to_string()),
            access_token,
            refresh_token: text("refresh_token"),
            expires_at,
            scopes,
        })
    }
}

pub fn user_row(user: &LegacyUser) -> Result<UserRow, MigrationError> {
    let user_id = user.user_id.trim();
    if user_id.is_empty() {
        return Err(MigrationError::invalid("user id is empty"));
    }
    Ok(UserRow {
        user_id: user_id.to_string(),
        email: user.email.clone(),
        display_name: user.display_name.clone(),
        created_at: crate::time::normalize_or_now(user.created_at.as_deref()),
    })
}

/// Maps one legacy record onto its relational attribute row.
pub fn attribute_row(record: &LegacyRecord) -> Result<AttributeRow, MigrationError> {
    let name = attribute_name(record.record_type, &record.key)?;
    let value = match record.record_type {
        RecordType::OauthToken if !record.is_encrypted => {
            let token = OAuthToken::parse(&record.key, &record.value)?;
            serde_json::to_string(&token)
                .map_err(|err| MigrationError::invalid(format!("oauth token encode: {err}")))?
        }
        RecordType::ApiKey if record.value.trim().is_empty() => {
            return Err(MigrationError::invalid("api key value is empty"));
        }
        _ => record.value.clone(),
    };
    Ok(AttributeRow {
        user_id: record.user_id.clone(),
        name,
        value,
        is_encrypted: record.is_encrypted,
        created_at: crate::time::normalize_or_now(record.created_at.as_deref()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(record_type: RecordType, key: &str, value: &str) -> LegacyRecord {
        LegacyRecord {
            id: "r1".into(),
            user_id: "u1".into(),
            record_type,
            key: key.into(),
            value: value.into(),
            is_encrypted: false,
            created_at: Some("2024-05-01T10:00:00Z".into()),
        }
    }

    #[test]
    fn normalizes_keys() {
        assert_eq!(normalize_key("OpenAI").as_deref(), Some("openai"));
        assert_eq!(normalize_key(" Google Drive ").as_deref(), Some("google_drive"));
        assert_eq!(normalize_key("--x--").as_deref(), Some("x"));
        assert_eq!(normalize_key("!!!"), None);
    }

    #[test]
    fn api_key_is_copied_verbatim() {
        let row = attribute_row(&record(RecordType::ApiKey, "openai", "sk-test-123")).unwrap();
        assert_eq!(row.name, "api_key_openai");
        assert_eq!(row.value, "sk-test-123");
        assert_eq!(row.created_at, "2024-05-01T10:00:00.000Z");
    }

    #[test]
    fn empty_api_key_is_rejected() {
        let err = attribute_row(&record(RecordType::ApiKey, "openai", "  ")).unwrap_err();
        assert_eq!(err.kind(), "invalid_record");
    }

    #[test]
    fn oauth_token_is_canonicalized() {
        let raw = r#"{"token":"ya29.abc","refresh_token":"1//r","expires_at":1700000000,"scope":"gmail.readonly drive"}"#;
        let row = attribute_row(&record(RecordType::OauthToken, "Google", raw)).unwrap();
        assert_eq!(row.name, "oauth_token_google");
        let token: OAuthToken = serde_json::from_str(&row.value).unwrap();
        assert_eq!(token.provider, "Google");
        assert_eq!(token.access_token, "ya29.abc");
        assert_eq!(token.refresh_token.as_deref(), Some("1//r"));
        assert_eq!(token.expires_at.as_deref(), Some("2023-11-14T22:13:20Z"));
        assert_eq!(token.scopes, vec!["gmail.readonly", "drive"]);
    }

    #[test]
    fn oauth_token_without_access_token_is_invalid() {
        let err = OAuthToken::parse("google", r#"{"refresh_token":"r"}"#).unwrap_err();
        assert!(err.to_string().contains("access_token"));
        assert!(OAuthToken::parse("google", "not json").is_err());
        assert!(OAuthToken::parse("google", "[1,2]").is_err());
    }

    #[test]
    fn encrypted_oauth_token_is_opaque() {
        let mut rec = record(RecordType::OauthToken, "google", "gAAAAB-ciphertext");
        rec.is_encrypted = true;
        let row = attribute_row(&rec).unwrap();
        assert_eq!(row.value, "gAAAAB-ciphertext");
        assert!(row.is_encrypted);
    }

    #[test]
    fn blank_user_id_is_invalid() {
        assert!(user_row(&LegacyUser::bare("  ")).is_err());
        let row = user_row(&LegacyUser::bare("u1")).unwrap();
        assert_eq!(row.user_id, "u1");
    }
}
