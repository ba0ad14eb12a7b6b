//! Public HTTP API for the control plane.
//!
//! JSON REST endpoints plus an SSE event stream per task, an MCP `run_code`
//! surface, and the bearer-authenticated internal bridge for sandboxes.
//! Every endpoint answers `OPTIONS` and returns permissive CORS headers.

pub mod events;
pub mod internal;
pub mod mcp;

use crate::approvals::ApprovalCoordinator;
use crate::invoke::InvocationPipeline;
use crate::policy::{self, Decision, PolicyContext, PolicyTool};
use crate::registry::ToolRegistry;
use crate::runtime::RuntimeRegistry;
use crate::store::{NewTask, Repository};
use crate::store::types::{
    AccessPolicy, ApprovalStatus, AuthType, CredentialRecord, PolicyScope, SourceKind,
};
use anyhow::Result;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use chrono::Utc;
use serde::Deserialize;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tracing::{error, info};
use uuid::Uuid;

const DEFAULT_TASK_TIMEOUT_MS: u64 = 60_000;
const DEFAULT_TASK_LIST_LIMIT: usize = 100;

/// System tools always present regardless of registry contents.
const BASE_TOOL_COUNT: usize = 6;

/// Shared state between all handlers.
#[derive(Clone)]
pub struct AppState {
    pub repo: Arc<Repository>,
    pub registry: Arc<ToolRegistry>,
    pub pipeline: Arc<InvocationPipeline>,
    pub approvals: Arc<ApprovalCoordinator>,
    pub runtimes: Arc<RuntimeRegistry>,
    pub internal_token: String,
    pub default_runtime_id: String,
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/api/health", get(health_handler))
        .route("/api/auth/anonymous/bootstrap", post(bootstrap_handler))
        .route("/api/runtime-targets", get(runtime_targets_handler))
        .route("/api/tools", get(tools_handler))
        .route(
            "/api/tool-sources",
            get(list_tool_sources_handler).post(upsert_tool_source_handler),
        )
        .route("/api/tool-sources/{id}", delete(delete_tool_source_handler))
        .route("/api/tasks", get(list_tasks_handler).post(create_task_handler))
        .route("/api/tasks/{id}", get(get_task_handler))
        .route("/api/tasks/{id}/events", get(events::task_events_handler))
        .route("/api/approvals", get(list_approvals_handler))
        .route("/api/approvals/{approval_id}", post(resolve_approval_handler))
        .route("/api/policies", get(list_policies_handler).post(upsert_policy_handler))
        .route(
            "/api/credentials",
            get(list_credentials_handler).post(upsert_credential_handler),
        )
        .route(
            "/mcp",
            post(mcp::post_handler).get(mcp::get_handler).delete(mcp::delete_handler),
        )
        .route("/internal/runs/{run_id}/tool-call", post(internal::tool_call_handler))
        .route("/internal/runs/{run_id}/output", post(internal::output_handler))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Bind and serve. Returns the join handle and the bound address (useful
/// when the port was 0).
pub async fn start(
    state: AppState,
    port: u16,
) -> Result<(tokio::task::JoinHandle<()>, std::net::SocketAddr)> {
    let app = build_router(state);
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port)).await?;
    let addr = listener.local_addr()?;
    info!("gateway listening on {}", addr);
    let handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            error!("gateway server error: {}", e);
        }
    });
    Ok((handle, addr))
}

pub(crate) fn bad_request(message: impl Into<String>) -> (StatusCode, Json<Value>) {
    (StatusCode::BAD_REQUEST, Json(json!({"error": message.into()})))
}

pub(crate) fn not_found(what: &str) -> (StatusCode, Json<Value>) {
    (
        StatusCode::NOT_FOUND,
        Json(json!({"error": format!("{} not found", what)})),
    )
}

pub(crate) fn internal_error(e: impl std::fmt::Display) -> (StatusCode, Json<Value>) {
    error!("internal error: {}", e);
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({"error": "internal error"})),
    )
}

fn require<'a>(
    query: &'a HashMap<String, String>,
    key: &str,
) -> Result<&'a str, (StatusCode, Json<Value>)> {
    query
        .get(key)
        .map(String::as_str)
        .filter(|v| !v.is_empty())
        .ok_or_else(|| bad_request(format!("missing {}", key)))
}

async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "version": crate::VERSION,
        "baseToolCount": BASE_TOOL_COUNT,
        "runtimeCount": state.runtimes.targets().len(),
    }))
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BootstrapRequest {
    session_id: Option<String>,
}

async fn bootstrap_handler(
    State(state): State<AppState>,
    body: axum::body::Bytes,
) -> impl IntoResponse {
    // The body is optional; an absent or empty one mints a fresh pair.
    let session_id = serde_json::from_slice::<BootstrapRequest>(&body)
        .ok()
        .and_then(|b| b.session_id);
    match state.repo.anon_bootstrap(session_id.as_deref()) {
        Ok((workspace_id, account_id)) => (
            StatusCode::OK,
            Json(json!({"workspaceId": workspace_id, "accountId": account_id})),
        ),
        Err(e) => internal_error(e),
    }
}

async fn runtime_targets_handler(State(state): State<AppState>) -> impl IntoResponse {
    let targets: Vec<Value> = state
        .runtimes
        .targets()
        .into_iter()
        .map(|(id, label)| json!({"id": id, "label": label}))
        .collect();
    Json(json!({"runtimes": targets}))
}

/// Visible tool descriptors after policy filtering: denied tools are
/// hidden, the rest carry their effective decision.
async fn tools_handler(
    State(state): State<AppState>,
    Query(query): Query<HashMap<String, String>>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    let workspace_id = require(&query, "workspaceId")?;
    let ctx = PolicyContext {
        workspace_id: workspace_id.to_string(),
        organization_id: None,
        account_id: query
            .get("actorId")
            .cloned()
            .unwrap_or_else(|| "anonymous".to_string()),
        client_id: query.get("clientId").cloned(),
    };

    let registry_state = state
        .registry
        .ensure_ready(workspace_id)
        .await
        .map_err(internal_error)?;
    let Some(build_id) = registry_state.ready_build_id else {
        return Ok(Json(json!({"tools": [], "warnings": registry_state.warnings})));
    };

    let policies = state.repo.list_policies(workspace_id).map_err(internal_error)?;
    let entries = state
        .repo
        .list_registry_entries(workspace_id, &build_id)
        .map_err(internal_error)?;

    let tools: Vec<Value> = entries
        .iter()
        .filter_map(|entry| {
            let decision = policy::decide(
                &PolicyTool {
                    path: &entry.path,
                    source_key: &entry.source_key,
                    default_approval: entry.approval_mode,
                },
                &ctx,
                &policies,
                None,
            );
            match decision {
                Decision::Deny => None,
                Decision::Allow | Decision::RequireApproval => Some(json!({
                    "path": entry.preferred_path,
                    "canonicalPath": entry.path,
                    "namespace": entry.namespace,
                    "description": entry.description,
                    "inputHint": entry.input_hint,
                    "outputHint": entry.output_hint,
                    "source": entry.source_key,
                    "decision": match decision {
                        Decision::Allow => "allow",
                        _ => "require_approval",
                    },
                })),
            }
        })
        .collect();

    Ok(Json(json!({
        "tools": tools,
        "buildId": build_id,
        "warnings": registry_state.warnings,
    })))
}

async fn list_tool_sources_handler(
    State(state): State<AppState>,
    Query(query): Query<HashMap<String, String>>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    let workspace_id = require(&query, "workspaceId")?;
    let sources = state
        .repo
        .list_tool_sources(workspace_id, false)
        .map_err(internal_error)?;
    Ok(Json(json!({"sources": sources})))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UpsertToolSourceRequest {
    workspace_id: String,
    #[serde(rename = "type")]
    kind: SourceKind,
    name: String,
    config: Value,
    #[serde(default)]
    id: Option<String>,
    #[serde(default = "default_enabled")]
    enabled: bool,
}

fn default_enabled() -> bool {
    true
}

/// Stores the source and queues a registry rebuild in the background; the
/// response carries the stored record immediately.
async fn upsert_tool_source_handler(
    State(state): State<AppState>,
    Json(body): Json<UpsertToolSourceRequest>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    if body.workspace_id.is_empty() {
        return Err(bad_request("missing workspaceId"));
    }
    if body.name.is_empty() {
        return Err(bad_request("missing name"));
    }
    let source = state
        .repo
        .upsert_tool_source(
            &body.workspace_id,
            body.id.as_deref(),
            body.kind,
            &body.name,
            &body.config,
            body.enabled,
        )
        .map_err(internal_error)?;

    let registry = state.registry.clone();
    let workspace_id = body.workspace_id.clone();
    tokio::spawn(async move {
        if let Err(e) = registry.rebuild(&workspace_id).await {
            error!("queued registry rebuild for {} failed: {:#}", workspace_id, e);
        }
    });

    Ok(Json(serde_json::to_value(&source).map_err(internal_error)?))
}

async fn delete_tool_source_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<HashMap<String, String>>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    let workspace_id = require(&query, "workspaceId")?.to_string();
    let deleted = state
        .repo
        .delete_tool_source(&workspace_id, &id)
        .map_err(internal_error)?;
    if !deleted {
        return Err(not_found("tool source"));
    }
    let registry = state.registry.clone();
    tokio::spawn(async move {
        if let Err(e) = registry.rebuild(&workspace_id).await {
            error!("registry rebuild after delete failed: {:#}", e);
        }
    });
    Ok(Json(json!({"ok": true})))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateTaskRequest {
    workspace_id: String,
    account_id: Option<String>,
    code: String,
    runtime_id: Option<String>,
    timeout_ms: Option<u64>,
    #[serde(default)]
    metadata: HashMap<String, Value>,
}

async fn create_task_handler(
    State(state): State<AppState>,
    Json(body): Json<CreateTaskRequest>,
) -> Result<(StatusCode, Json<Value>), (StatusCode, Json<Value>)> {
    if body.workspace_id.is_empty() {
        return Err(bad_request("missing workspaceId"));
    }
    if body.code.is_empty() {
        return Err(bad_request("missing code"));
    }
    let task = state
        .repo
        .create_task(NewTask {
            workspace_id: body.workspace_id,
            account_id: body.account_id.unwrap_or_else(|| "anonymous".to_string()),
            code: body.code,
            runtime_id: body
                .runtime_id
                .unwrap_or_else(|| state.default_runtime_id.clone()),
            timeout_ms: body.timeout_ms.unwrap_or(DEFAULT_TASK_TIMEOUT_MS),
            metadata: body.metadata,
        })
        .map_err(internal_error)?;
    Ok((
        StatusCode::CREATED,
        Json(serde_json::to_value(&task).map_err(internal_error)?),
    ))
}

async fn list_tasks_handler(
    State(state): State<AppState>,
    Query(query): Query<HashMap<String, String>>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    let workspace_id = require(&query, "workspaceId")?;
    let tasks = state
        .repo
        .list_tasks(workspace_id, DEFAULT_TASK_LIST_LIMIT)
        .map_err(internal_error)?;
    Ok(Json(json!({"tasks": tasks})))
}

async fn get_task_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    match state.repo.get_task(&id).map_err(internal_error)? {
        Some(task) => Ok(Json(serde_json::to_value(&task).map_err(internal_error)?)),
        None => Err(not_found("task")),
    }
}

async fn list_approvals_handler(
    State(state): State<AppState>,
    Query(query): Query<HashMap<String, String>>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    let workspace_id = require(&query, "workspaceId")?;
    let status = match query.get("status").map(String::as_str) {
        None | Some("") => None,
        Some(raw) => Some(
            ApprovalStatus::from_str(raw)
                .ok_or_else(|| bad_request(format!("invalid status: {}", raw)))?,
        ),
    };
    // Capped at 500 rows; page by status instead of scrolling.
    let approvals = state
        .repo
        .list_approvals(workspace_id, status)
        .map_err(internal_error)?;
    Ok(Json(json!({"approvals": approvals})))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ResolveApprovalRequest {
    workspace_id: String,
    decision: String,
    reviewer_id: Option<String>,
    reason: Option<String>,
}

async fn resolve_approval_handler(
    State(state): State<AppState>,
    Path(approval_id): Path<String>,
    Json(body): Json<ResolveApprovalRequest>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    if body.workspace_id.is_empty() {
        return Err(bad_request("missing workspaceId"));
    }
    let decision = match body.decision.as_str() {
        "approved" => ApprovalStatus::Approved,
        "denied" => ApprovalStatus::Denied,
        other => return Err(bad_request(format!("invalid decision: {}", other))),
    };
    if state
        .repo
        .get_approval(&approval_id)
        .map_err(internal_error)?
        .is_none()
    {
        return Err(not_found("approval"));
    }

    let resolved = state
        .approvals
        .resolve(
            &body.workspace_id,
            &approval_id,
            decision,
            body.reviewer_id.as_deref(),
            body.reason.as_deref(),
        )
        .map_err(internal_error)?;
    // `null` means the approval was not pending (or not in this workspace);
    // resolution is one-shot.
    Ok(Json(json!({"approval": resolved})))
}

async fn list_policies_handler(
    State(state): State<AppState>,
    Query(query): Query<HashMap<String, String>>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    let workspace_id = require(&query, "workspaceId")?;
    let policies = state
        .repo
        .list_policies(workspace_id)
        .map_err(internal_error)?;
    Ok(Json(json!({"policies": policies})))
}

async fn upsert_policy_handler(
    State(state): State<AppState>,
    Json(mut body): Json<Value>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    if body.get("id").and_then(Value::as_str).is_none() {
        body["id"] = json!(format!("pol_{}", Uuid::new_v4().simple()));
    }
    let policy: AccessPolicy = serde_json::from_value(body)
        .map_err(|e| bad_request(format!("invalid policy: {}", e)))?;
    if policy.workspace_id.is_empty() {
        return Err(bad_request("missing workspaceId"));
    }
    let stored = state.repo.upsert_policy(&policy).map_err(internal_error)?;
    Ok(Json(serde_json::to_value(&stored).map_err(internal_error)?))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UpsertCredentialRequest {
    id: Option<String>,
    scope: Option<PolicyScope>,
    workspace_id: String,
    account_id: Option<String>,
    source_key: String,
    auth_type: String,
    header_name: Option<String>,
    secret_json: Value,
    #[serde(default)]
    extra_headers: HashMap<String, String>,
}

async fn upsert_credential_handler(
    State(state): State<AppState>,
    Json(body): Json<UpsertCredentialRequest>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    if body.workspace_id.is_empty() {
        return Err(bad_request("missing workspaceId"));
    }
    if body.source_key.is_empty() {
        return Err(bad_request("missing sourceKey"));
    }
    let auth_type = AuthType::from_str(&body.auth_type)
        .ok_or_else(|| bad_request(format!("invalid authType: {}", body.auth_type)))?;
    let record = CredentialRecord {
        id: body
            .id
            .unwrap_or_else(|| format!("cred_{}", Uuid::new_v4().simple())),
        scope: body.scope.unwrap_or(PolicyScope::Workspace),
        workspace_id: body.workspace_id,
        account_id: body.account_id,
        source_key: body.source_key,
        auth_type,
        header_name: body.header_name,
        secret_json: body.secret_json,
        extra_headers: body.extra_headers,
        updated_at: Utc::now(),
    };
    state.repo.upsert_credential(&record).map_err(internal_error)?;
    // The response surface never echoes the secret.
    Ok(Json(record.redacted()))
}

async fn list_credentials_handler(
    State(state): State<AppState>,
    Query(query): Query<HashMap<String, String>>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    let workspace_id = require(&query, "workspaceId")?;
    let credentials: Vec<Value> = state
        .repo
        .list_credentials(workspace_id)
        .map_err(internal_error)?
        .iter()
        .map(CredentialRecord::redacted)
        .collect();
    Ok(Json(json!({"credentials": credentials})))
}
