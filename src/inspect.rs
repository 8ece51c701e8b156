use std::io::{self, Write};

use serde::Serialize;

use crate::legacy::RecordType;
use crate::migration::transform::OAuthToken;
use crate::target::RelationalStore;
use crate::{AppError, AppResult};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OAuthSummary {
    pub provider: String,
    pub expires_at: Option<String>,
    pub has_refresh_token: bool,
    pub scopes: usize,
}

/// What `inspect` shows for one attribute. Values never leave the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AttributeSummary {
    pub name: String,
    pub is_encrypted: bool,
    pub value_len: usize,
    pub created_at: String,
    pub oauth: Option<OAuthSummary>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UserInspection {
    pub user_id: String,
    pub attributes: Vec<AttributeSummary>,
}

pub fn inspect_user(target: &RelationalStore, user_id: &str) -> AppResult<UserInspection> {
    if !target.user_exists(user_id)? {
        return Err(AppError::new("INSPECT/USER_NOT_FOUND", "User not found in target")
            .with_context("user_id", user_id.to_string()));
    }

    let oauth_prefix = RecordType::OauthToken.attribute_prefix();
    let attributes = target
        .list_attributes(user_id)?
        .into_iter()
        .map(|attr| {
            let oauth = attr.name.strip_prefix(oauth_prefix).and_then(|provider| {
                // Encrypted payloads are opaque here.
                if attr.is_encrypted {
                    return None;
                }
                OAuthToken::parse(provider, &attr.value).ok().map(|token| OAuthSummary {
                    provider: token.provider,
                    expires_at: token.expires_at,
                    has_refresh_token: token.refresh_token.is_some(),
                    scopes: token.scopes.len(),
                })
            });
            AttributeSummary {
                value_len: attr.value.chars().count(),
                name: attr.name,
                is_encrypted: attr.is_encrypted,
                created_at: attr.created_at,
                oauth,
            }
        })
        .collect();

    Ok(UserInspection {
        user_id: user_id.to_string(),
        attributes,
    })
}

pub fn print_inspection(inspection: &UserInspection, out: &mut impl Write) -> io::Result<()> {
    writeln!(
        out,
        "User {} ({} attributes)",
        inspection.user_id,
        inspection.attributes.len()
    )?;
    for attr in &inspection.attributes {
        let lock = if attr.is_encrypted { "encrypted" } else { "plain" };
        writeln!(
            out,
            "  {:<32} {:<9} len={:<5} created={}",
            attr.name, lock, attr.value_len, attr.created_at
        )?;
        if let Some(oauth) = &attr.oauth {
            writeln!(
                out,
                "    provider={} expires_at={} refresh_token={} scopes={}",
                oauth.provider,
                oauth.expires_at.as_deref().unwrap_or("none"),
                if oauth.has_refresh_token { "yes" } else { "no" },
                oauth.scopes
            )?;
        }
    }
    Ok(())
}
