//! Read side of the migration: the schema-less MetisAgent record store.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::AppResult;

mod collection;

pub use collection::{CollectionEntry, CollectionStore, DEFAULT_COLLECTION};

/// The `metadata.type` discriminator of a legacy record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordType {
    User,
    ApiKey,
    OauthToken,
    Setting,
    Persona,
    GraphMemory,
}

impl RecordType {
    /// Attribute-bearing record types in the order the load stage visits them.
    pub const ATTRIBUTES: [RecordType; 5] = [
        RecordType::ApiKey,
        RecordType::OauthToken,
        RecordType::Setting,
        RecordType::Persona,
        RecordType::GraphMemory,
    ];

    pub const fn as_str(self) -> &'static str {
        match self {
            RecordType::User => "user",
            RecordType::ApiKey => "api_key",
            RecordType::OauthToken => "oauth_token",
            RecordType::Setting => "setting",
            RecordType::Persona => "persona",
            RecordType::GraphMemory => "graph_memory",
        }
    }

    /// Prefix of the relational attribute name, e.g. `api_key_`.
    pub const fn attribute_prefix(self) -> &'static str {
        match self {
            RecordType::User => "user_",
            RecordType::ApiKey => "api_key_",
            RecordType::OauthToken => "oauth_token_",
            RecordType::Setting => "setting_",
            RecordType::Persona => "persona_",
            RecordType::GraphMemory => "graph_memory_",
        }
    }

    /// Metadata field holding the per-user key of a record of this type.
    pub(crate) const fn key_field(self) -> &'static str {
        match self {
            RecordType::User => "user_id",
            RecordType::ApiKey => "service",
            RecordType::OauthToken => "provider",
            RecordType::Setting => "key",
            RecordType::Persona => "persona_id",
            RecordType::GraphMemory => "memory_id",
        }
    }
}

impl fmt::Display for RecordType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RecordType {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "user" => Ok(RecordType::User),
            "api_key" | "apikey" => Ok(RecordType::ApiKey),
            "oauth_token" | "oauth" => Ok(RecordType::OauthToken),
            "setting" | "user_setting" | "settings" => Ok(RecordType::Setting),
            "persona" => Ok(RecordType::Persona),
            "graph_memory" | "memory" => Ok(RecordType::GraphMemory),
            other => Err(format!("unknown record type: {other}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LegacyUser {
    pub user_id: String,
    pub email: Option<String>,
    pub display_name: Option<String>,
    pub created_at: Option<String>,
}

impl LegacyUser {
    pub fn bare(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            email: None,
            display_name: None,
            created_at: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LegacyRecord {
    pub id: String,
    pub user_id: String,
    pub record_type: RecordType,
    /// Service, provider, setting key, persona id or memory id.
    pub key: String,
    pub value: String,
    pub is_encrypted: bool,
    pub created_at: Option<String>,
}

/// Typed queries over the legacy store.
pub trait LegacyStore {
    /// Every user the store knows about, ordered by id.
    fn list_users(&self) -> AppResult<Vec<LegacyUser>>;

    /// Records of one attribute type owned by `user_id`, in stored order.
    fn list_attributes_by_type(
        &self,
        user_id: &str,
        record_type: RecordType,
    ) -> AppResult<Vec<LegacyRecord>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_aliases() {
        assert_eq!("api_key".parse::<RecordType>(), Ok(RecordType::ApiKey));
        assert_eq!("Settings".parse::<RecordType>(), Ok(RecordType::Setting));
        assert_eq!("oauth".parse::<RecordType>(), Ok(RecordType::OauthToken));
        assert!("embedding".parse::<RecordType>().is_err());
    }

    #[test]
    fn serde_uses_snake_case() {
        let json = serde_json::to_string(&RecordType::GraphMemory).unwrap();
        assert_eq!(json, "\"graph_memory\"");
    }
}
