use super::*;
use crate::hub::EventHub;
use chrono::Utc;
use std::sync::Arc;

fn record(scope: PolicyScope, auth: AuthType, secret: serde_json::Value) -> CredentialRecord {
    CredentialRecord {
        id: format!("cred-{}", scope.as_str()),
        scope,
        workspace_id: "ws".to_string(),
        account_id: match scope {
            PolicyScope::Account => Some("acct-1".to_string()),
            _ => None,
        },
        source_key: "openapi:github".to_string(),
        auth_type: auth,
        header_name: None,
        secret_json: secret,
        extra_headers: HashMap::new(),
        updated_at: Utc::now(),
    }
}

#[test]
fn test_bearer_header() {
    let resolved = resolve(&record(
        PolicyScope::Workspace,
        AuthType::Bearer,
        serde_json::json!({"token": "tok123"}),
    ))
    .unwrap();
    assert_eq!(
        resolved.headers().get("Authorization").unwrap(),
        "Bearer tok123"
    );
}

#[test]
fn test_api_key_default_and_override_header() {
    let resolved = resolve(&record(
        PolicyScope::Workspace,
        AuthType::ApiKey,
        serde_json::json!({"key": "k"}),
    ))
    .unwrap();
    assert_eq!(resolved.headers().get("X-Api-Key").unwrap(), "k");

    let mut rec = record(
        PolicyScope::Workspace,
        AuthType::ApiKey,
        serde_json::json!({"key": "k"}),
    );
    rec.header_name = Some("X-Custom-Key".to_string());
    let resolved = resolve(&rec).unwrap();
    assert_eq!(resolved.headers().get("X-Custom-Key").unwrap(), "k");
}

#[test]
fn test_basic_auth_encodes_credentials() {
    let resolved = resolve(&record(
        PolicyScope::Workspace,
        AuthType::Basic,
        serde_json::json!({"username": "user", "password": "pass"}),
    ))
    .unwrap();
    // base64("user:pass")
    assert_eq!(
        resolved.headers().get("Authorization").unwrap(),
        "Basic dXNlcjpwYXNz"
    );
}

#[test]
fn test_extra_headers_appended() {
    let mut rec = record(
        PolicyScope::Workspace,
        AuthType::Bearer,
        serde_json::json!({"token": "t"}),
    );
    rec.extra_headers
        .insert("X-Tenant".to_string(), "acme".to_string());
    let resolved = resolve(&rec).unwrap();
    assert_eq!(resolved.headers().get("X-Tenant").unwrap(), "acme");
    assert_eq!(resolved.headers().len(), 2);
}

#[test]
fn test_missing_secret_field_errors() {
    let err = resolve(&record(
        PolicyScope::Workspace,
        AuthType::Bearer,
        serde_json::json!({}),
    ))
    .unwrap_err();
    assert!(err.to_string().contains("missing the 'token' field"));
}

#[test]
fn test_debug_output_never_contains_secret() {
    let resolved = resolve(&record(
        PolicyScope::Workspace,
        AuthType::Bearer,
        serde_json::json!({"token": "hunter2"}),
    ))
    .unwrap();
    let debug = format!("{:?}", resolved);
    assert!(!debug.contains("hunter2"));
    assert!(debug.contains("redacted"));
}

#[test]
fn test_find_credential_prefers_account_scope() {
    let repo = Repository::open_ephemeral(Arc::new(EventHub::new())).unwrap();
    let mut workspace = record(
        PolicyScope::Workspace,
        AuthType::Bearer,
        serde_json::json!({"token": "ws-token"}),
    );
    workspace.id = "cred-ws".to_string();
    let mut account = record(
        PolicyScope::Account,
        AuthType::Bearer,
        serde_json::json!({"token": "acct-token"}),
    );
    account.id = "cred-acct".to_string();
    repo.upsert_credential(&workspace).unwrap();
    repo.upsert_credential(&account).unwrap();

    let found = find_credential(&repo, "ws", "acct-1", "openapi:github")
        .unwrap()
        .unwrap();
    assert_eq!(found.id, "cred-acct");

    // A different account falls back to the workspace credential.
    let found = find_credential(&repo, "ws", "acct-2", "openapi:github")
        .unwrap()
        .unwrap();
    assert_eq!(found.id, "cred-ws");

    // Unknown source: nothing.
    assert!(
        find_credential(&repo, "ws", "acct-1", "openapi:none")
            .unwrap()
            .is_none()
    );
}
