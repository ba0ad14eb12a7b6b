use super::AppState;
use crate::store::NewTask;
use axum::Json;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::time::Duration;
use tracing::debug;

/// The MCP surface exposes exactly one tool. The transport here is the
/// minimal JSON-RPC subset that tool needs; full protocol transports live
/// outside this crate.
const RUN_CODE_TOOL: &str = "run_code";

const PROTOCOL_VERSION: &str = "2025-03-26";

/// How long `run_code` waits for the task to reach a terminal state, on top
/// of the task's own timeout.
const COMPLETION_GRACE: Duration = Duration::from_secs(30);
const COMPLETION_POLL: Duration = Duration::from_millis(250);

const DEFAULT_TIMEOUT_MS: u64 = 60_000;

fn rpc_result(id: Value, result: Value) -> Json<Value> {
    Json(json!({"jsonrpc": "2.0", "id": id, "result": result}))
}

fn rpc_error(id: Value, code: i64, message: impl Into<String>) -> Json<Value> {
    Json(json!({
        "jsonrpc": "2.0",
        "id": id,
        "error": {"code": code, "message": message.into()},
    }))
}

/// `POST /mcp?workspaceId&actorId&clientId?&sessionId?` — JSON-RPC
/// messages: `initialize`, `tools/list`, and `tools/call` for `run_code`.
pub async fn post_handler(
    State(state): State<AppState>,
    Query(query): Query<HashMap<String, String>>,
    Json(message): Json<Value>,
) -> impl IntoResponse {
    let id = message.get("id").cloned().unwrap_or(Value::Null);
    let method = message.get("method").and_then(Value::as_str).unwrap_or("");

    // Notifications need no response body.
    if id.is_null() && method.starts_with("notifications/") {
        return (StatusCode::ACCEPTED, Json(json!({}))).into_response();
    }

    match method {
        "initialize" => rpc_result(
            id,
            json!({
                "protocolVersion": PROTOCOL_VERSION,
                "capabilities": {"tools": {}},
                "serverInfo": {"name": "codeplane", "version": crate::VERSION},
            }),
        )
        .into_response(),
        "ping" => rpc_result(id, json!({})).into_response(),
        "tools/list" => rpc_result(
            id,
            json!({
                "tools": [{
                    "name": RUN_CODE_TOOL,
                    "description": "Run a TypeScript/JavaScript snippet in a sandboxed runtime \
                                    with access to the workspace tool catalog.",
                    "inputSchema": {
                        "type": "object",
                        "properties": {
                            "code": {"type": "string"},
                            "runtimeId": {"type": "string"},
                            "timeoutMs": {"type": "integer"},
                        },
                        "required": ["code"],
                    },
                }],
            }),
        )
        .into_response(),
        "tools/call" => {
            let name = message
                .pointer("/params/name")
                .and_then(Value::as_str)
                .unwrap_or("");
            if name != RUN_CODE_TOOL {
                return rpc_error(id, -32602, format!("unknown tool: {}", name)).into_response();
            }
            let Some(workspace_id) = query.get("workspaceId").filter(|w| !w.is_empty()) else {
                return rpc_error(id, -32602, "workspaceId query parameter is required")
                    .into_response();
            };
            let arguments = message
                .pointer("/params/arguments")
                .cloned()
                .unwrap_or(json!({}));
            run_code(&state, &query, workspace_id, id, &arguments)
                .await
                .into_response()
        }
        other => rpc_error(id, -32601, format!("method not found: {}", other)).into_response(),
    }
}

async fn run_code(
    state: &AppState,
    query: &HashMap<String, String>,
    workspace_id: &str,
    id: Value,
    arguments: &Value,
) -> Json<Value> {
    let Some(code) = arguments.get("code").and_then(Value::as_str) else {
        return rpc_error(id, -32602, "run_code needs a 'code' string");
    };
    let timeout_ms = arguments
        .get("timeoutMs")
        .and_then(Value::as_u64)
        .unwrap_or(DEFAULT_TIMEOUT_MS);
    let runtime_id = arguments
        .get("runtimeId")
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or_else(|| state.default_runtime_id.clone());

    let mut metadata = HashMap::new();
    if let Some(client_id) = query.get("clientId").filter(|c| !c.is_empty()) {
        metadata.insert("clientId".to_string(), json!(client_id));
    }
    if let Some(session_id) = query.get("sessionId").filter(|s| !s.is_empty()) {
        metadata.insert("sessionId".to_string(), json!(session_id));
    }

    let task = match state.repo.create_task(NewTask {
        workspace_id: workspace_id.to_string(),
        account_id: query
            .get("actorId")
            .cloned()
            .unwrap_or_else(|| "anonymous".to_string()),
        code: code.to_string(),
        runtime_id,
        timeout_ms,
        metadata,
    }) {
        Ok(task) => task,
        Err(e) => return rpc_error(id, -32000, format!("failed to create task: {:#}", e)),
    };
    debug!("mcp run_code created task {}", task.id);

    // Wait-for-completion shim: poll until the task is terminal.
    let deadline = tokio::time::Instant::now() + Duration::from_millis(timeout_ms) + COMPLETION_GRACE;
    let finished = loop {
        match state.repo.get_task(&task.id) {
            Ok(Some(current)) if current.status.is_terminal() => break current,
            Ok(Some(_)) => {}
            Ok(None) => return rpc_error(id, -32000, "task vanished"),
            Err(e) => return rpc_error(id, -32000, format!("task read failed: {:#}", e)),
        }
        if tokio::time::Instant::now() >= deadline {
            return rpc_error(
                id,
                -32000,
                format!("task {} did not finish in time", task.id),
            );
        }
        tokio::time::sleep(COMPLETION_POLL).await;
    };

    let summary = json!({
        "taskId": finished.id,
        "status": finished.status,
        "result": finished.result,
        "exitCode": finished.exit_code,
        "error": finished.error,
    });
    rpc_result(
        id,
        json!({
            "content": [{"type": "text", "text": summary.to_string()}],
            "isError": finished.status != crate::store::types::TaskStatus::Completed,
        }),
    )
}

/// `GET /mcp` — this surface does not offer a server-push stream.
pub async fn get_handler() -> impl IntoResponse {
    (
        StatusCode::METHOD_NOT_ALLOWED,
        Json(json!({"error": "SSE transport not supported; POST JSON-RPC messages"})),
    )
}

/// `DELETE /mcp` — sessions are stateless here; deleting one always works.
pub async fn delete_handler() -> impl IntoResponse {
    Json(json!({"ok": true}))
}
