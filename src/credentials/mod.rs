use crate::store::Repository;
use crate::store::types::{AuthType, CredentialRecord, PolicyScope};
use anyhow::{Context, Result, bail};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use std::collections::HashMap;

/// Headers composed from a credential for one tool invocation.
///
/// Deliberately not `Clone` and not `Debug`-printable with its values: the
/// resolved secret lives only for the duration of a single call.
pub struct ResolvedCredential {
    pub source_key: String,
    headers: HashMap<String, String>,
}

impl ResolvedCredential {
    pub fn headers(&self) -> &HashMap<String, String> {
        &self.headers
    }
}

impl std::fmt::Debug for ResolvedCredential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResolvedCredential")
            .field("source_key", &self.source_key)
            .field("headers", &format!("<{} redacted>", self.headers.len()))
            .finish()
    }
}

/// Find the best-scoped credential for `(workspace, account, source_key)`.
///
/// Preference: account-scoped record for this account, then workspace
/// scope, then organization scope. Returns `None` when nothing matches.
pub fn find_credential(
    repo: &Repository,
    workspace_id: &str,
    account_id: &str,
    source_key: &str,
) -> Result<Option<CredentialRecord>> {
    let mut candidates: Vec<CredentialRecord> = repo
        .list_credentials(workspace_id)?
        .into_iter()
        .filter(|c| c.source_key == source_key)
        .filter(|c| match c.scope {
            PolicyScope::Account => c.account_id.as_deref() == Some(account_id),
            PolicyScope::Workspace | PolicyScope::Organization => true,
        })
        .collect();
    candidates.sort_by_key(|c| match c.scope {
        PolicyScope::Account => 0,
        PolicyScope::Workspace => 1,
        PolicyScope::Organization => 2,
    });
    Ok(candidates.into_iter().next())
}

/// Compose request headers from a credential record.
///
/// `bearer` expects `{"token": "..."}`; `api_key` expects `{"key": "..."}`
/// with an optional header-name override (default `X-Api-Key`); `basic`
/// expects `{"username": "...", "password": "..."}`. Per-record extra
/// headers are appended after the auth header.
pub fn resolve(record: &CredentialRecord) -> Result<ResolvedCredential> {
    let mut headers = HashMap::new();
    match record.auth_type {
        AuthType::Bearer => {
            let token = secret_field(record, "token")?;
            headers.insert("Authorization".to_string(), format!("Bearer {}", token));
        }
        AuthType::ApiKey => {
            let key = secret_field(record, "key")?;
            let header = record
                .header_name
                .clone()
                .unwrap_or_else(|| "X-Api-Key".to_string());
            headers.insert(header, key);
        }
        AuthType::Basic => {
            let username = secret_field(record, "username")?;
            let password = secret_field(record, "password")?;
            let encoded = BASE64.encode(format!("{}:{}", username, password));
            headers.insert("Authorization".to_string(), format!("Basic {}", encoded));
        }
    }
    for (name, value) in &record.extra_headers {
        headers.insert(name.clone(), value.clone());
    }
    Ok(ResolvedCredential {
        source_key: record.source_key.clone(),
        headers,
    })
}

fn secret_field(record: &CredentialRecord, field: &str) -> Result<String> {
    let value = record
        .secret_json
        .get(field)
        .and_then(|v| v.as_str())
        .with_context(|| {
            format!(
                "credential {} for {} is missing the '{}' field",
                record.id, record.source_key, field
            )
        })?;
    if value.is_empty() {
        bail!(
            "credential {} for {} has an empty '{}' field",
            record.id,
            record.source_key,
            field
        );
    }
    Ok(value.to_string())
}

#[cfg(test)]
mod tests;
