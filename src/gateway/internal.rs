use super::{AppState, bad_request, internal_error};
use crate::invoke::ToolCallRequest;
use crate::runtime::adapter::{OutputStream, outcome_from_result};
use crate::store::types::EventFamily;
use axum::Json;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::warn;

/// Server side of the sandbox bridge protocol. Every request carries
/// `Authorization: Bearer <internal-token>`.
fn authorize(state: &AppState, headers: &HeaderMap) -> Result<(), (StatusCode, Json<Value>)> {
    let presented = headers
        .get("Authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));
    if presented != Some(state.internal_token.as_str()) {
        warn!("internal endpoint rejected: bad or missing bearer token");
        return Err((
            StatusCode::UNAUTHORIZED,
            Json(json!({"error": "unauthorized"})),
        ));
    }
    Ok(())
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BridgeToolCall {
    pub call_id: String,
    pub tool_path: String,
    #[serde(default)]
    pub input: Value,
}

/// `POST /internal/runs/{run_id}/tool-call` — run one tool call through the
/// pipeline and answer with the wire union; suspensions and denials are
/// data here, not errors.
pub async fn tool_call_handler(
    State(state): State<AppState>,
    Path(run_id): Path<String>,
    headers: HeaderMap,
    Json(body): Json<BridgeToolCall>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    authorize(&state, &headers)?;
    if body.call_id.is_empty() || body.tool_path.is_empty() {
        return Err(bad_request("callId and toolPath are required"));
    }

    let request = ToolCallRequest {
        run_id,
        call_id: body.call_id,
        tool_path: body.tool_path,
        input: body.input,
    };
    let outcome = outcome_from_result(state.pipeline.invoke(&request).await);
    Ok(Json(outcome.to_value()))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BridgeOutput {
    pub stream: String,
    pub line: String,
    pub timestamp: Option<String>,
}

/// `POST /internal/runs/{run_id}/output` — journal one line of sandbox
/// stdout/stderr.
pub async fn output_handler(
    State(state): State<AppState>,
    Path(run_id): Path<String>,
    headers: HeaderMap,
    Json(body): Json<BridgeOutput>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    authorize(&state, &headers)?;
    let Some(stream) = OutputStream::from_str(&body.stream) else {
        return Err(bad_request(format!("invalid stream: {}", body.stream)));
    };
    if state.repo.get_task(&run_id).map_err(internal_error)?.is_none() {
        return Err(super::not_found("task"));
    }

    state
        .repo
        .append_event(
            &run_id,
            EventFamily::Task,
            "task.output",
            json!({
                "stream": stream.as_str(),
                "line": body.line,
                "timestamp": body.timestamp,
            }),
        )
        .map_err(internal_error)?;
    Ok(Json(json!({"ok": true})))
}
