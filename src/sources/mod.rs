pub mod graphql;
pub mod mcp;
pub mod openapi;

use crate::credentials::ResolvedCredential;
use crate::store::types::{ApprovalMode, SourceKind, ToolSource};
use anyhow::Result;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;
use tracing::warn;

/// Per-source scan timeout. A slow upstream produces a warning, never a
/// stuck registry build.
pub const SOURCE_LOAD_TIMEOUT: Duration = Duration::from_secs(30);

/// The uniform tool record every loader produces. Serialized into registry
/// entries so invocation works from the persisted catalog alone.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SerializedTool {
    pub path: String,
    pub description: String,
    pub input_schema: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_schema: Option<Value>,
    pub approval: ApprovalMode,
    pub source_key: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input_hint: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_hint: Option<String>,
    pub requires_credential: bool,
    pub spec: ToolSpec,
}

/// How a serialized tool executes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ToolSpec {
    Openapi(openapi::OpenapiOperation),
    /// The real GraphQL entry point: accepts `{query, variables?}`.
    GraphqlExecutor {
        endpoint: String,
        #[serde(default)]
        static_headers: HashMap<String, String>,
    },
    /// Inert pseudo-tool for one root field. Exists for policy matching and
    /// discovery; invoking it synthesizes a query and runs the executor.
    GraphqlField {
        endpoint: String,
        #[serde(default)]
        static_headers: HashMap<String, String>,
        operation: String,
        field: String,
    },
    Mcp {
        source_id: String,
        url: String,
        tool_name: String,
    },
}

/// Result of scanning one source: tools plus human-readable warnings.
/// Loaders are side-effect-free and never abort a registry build.
#[derive(Debug, Default)]
pub struct LoadOutcome {
    pub tools: Vec<SerializedTool>,
    pub warnings: Vec<String>,
}

/// Identity and secret material available to a tool body for one call.
pub struct ToolRunContext<'a> {
    pub task_id: &'a str,
    pub call_id: &'a str,
    pub workspace_id: &'a str,
    pub account_id: &'a str,
    pub client_id: Option<&'a str>,
    pub credential: Option<&'a ResolvedCredential>,
}

/// Shared execution dependencies: one HTTP client plus the MCP connection
/// table. Cheap to clone.
#[derive(Clone)]
pub struct ToolExecutor {
    http: reqwest::Client,
    mcp: mcp::McpConnections,
}

impl ToolExecutor {
    pub fn new() -> Self {
        Self {
            http: reqwest::Client::new(),
            mcp: mcp::McpConnections::new(),
        }
    }

    pub fn http(&self) -> &reqwest::Client {
        &self.http
    }

    /// Scan a source into its tool catalog. Failures come back as warnings.
    pub async fn load_source(&self, source: &ToolSource) -> LoadOutcome {
        let mut outcome = LoadOutcome::default();
        let loaded = tokio::time::timeout(SOURCE_LOAD_TIMEOUT, async {
            match source.kind {
                SourceKind::Openapi => {
                    openapi::load(&self.http, source, &mut outcome.warnings).await
                }
                SourceKind::Graphql => {
                    graphql::load(&self.http, source, &mut outcome.warnings).await
                }
                SourceKind::Mcp => self.mcp.load(source, &mut outcome.warnings).await,
            }
        })
        .await;

        match loaded {
            Ok(Ok(tools)) => outcome.tools = tools,
            Ok(Err(e)) => {
                warn!("source {} failed to load: {:#}", source.source_key(), e);
                outcome
                    .warnings
                    .push(format!("{}: {:#}", source.source_key(), e));
            }
            Err(_) => {
                warn!("source {} timed out during load", source.source_key());
                outcome.warnings.push(format!(
                    "{}: load timed out after {}s",
                    source.source_key(),
                    SOURCE_LOAD_TIMEOUT.as_secs()
                ));
            }
        }
        outcome
    }

    /// Run a serialized tool. Any error here marks the call failed upstream.
    pub async fn run(
        &self,
        tool: &SerializedTool,
        input: &Value,
        ctx: &ToolRunContext<'_>,
    ) -> Result<Value> {
        match &tool.spec {
            ToolSpec::Openapi(op) => openapi::run(&self.http, op, input, ctx.credential).await,
            ToolSpec::GraphqlExecutor {
                endpoint,
                static_headers,
            } => {
                graphql::run_executor(&self.http, endpoint, static_headers, input, ctx.credential)
                    .await
            }
            ToolSpec::GraphqlField {
                endpoint,
                static_headers,
                operation,
                field,
            } => {
                // Pseudo-tools never execute directly: rewrite into the
                // executor with a synthesized document.
                let query = graphql::synthesize_query(operation, field, input);
                let rewritten = serde_json::json!({ "query": query });
                graphql::run_executor(
                    &self.http,
                    endpoint,
                    static_headers,
                    &rewritten,
                    ctx.credential,
                )
                .await
            }
            ToolSpec::Mcp {
                source_id,
                url,
                tool_name,
            } => self.mcp.call(source_id, url, tool_name, input).await,
        }
    }
}

impl Default for ToolExecutor {
    fn default() -> Self {
        Self::new()
    }
}

/// Sanitize one path segment: ASCII alphanumerics survive, everything else
/// collapses to single underscores, lowercased. Empty input becomes
/// `"default"` so a path never has a hole.
pub fn sanitize_segment(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut last_was_sep = true;
    for c in raw.chars() {
        if c.is_ascii_alphanumeric() {
            out.extend(c.to_lowercase());
            last_was_sep = false;
        } else if !last_was_sep {
            out.push('_');
            last_was_sep = true;
        }
    }
    let trimmed = out.trim_end_matches('_');
    if trimmed.is_empty() {
        "default".to_string()
    } else {
        trimmed.to_string()
    }
}
