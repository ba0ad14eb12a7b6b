use crate::store::types::{ApprovalMode, ToolSource};
use anyhow::{Context, Result, anyhow, bail};
use regex::Regex;
use rmcp::model::{CallToolRequestParams, RawContent};
use rmcp::service::RunningService;
use rmcp::transport::{SseClientTransport, StreamableHttpClientTransport};
use rmcp::{RoleClient, ServiceExt};
use serde_json::Value;
use std::borrow::Cow;
use std::collections::HashMap;
use std::sync::{Arc, LazyLock};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::{SerializedTool, ToolSpec, sanitize_segment};

/// Errors that look like a dead socket rather than a tool failure; worth one
/// transparent reconnect.
static TRANSIENT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)connection (reset|refused|closed|aborted)|broken pipe|transport closed|channel closed|unexpected eof|timed out",
    )
    .expect("transient error regex")
});

struct Connection {
    service: RunningService<RoleClient, ()>,
}

/// Lazily-connected MCP clients keyed by source id. Connections prefer the
/// streamable-HTTP transport and fall back to SSE.
#[derive(Clone)]
pub struct McpConnections {
    inner: Arc<Mutex<HashMap<String, Connection>>>,
}

impl McpConnections {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    async fn connect(url: &str) -> Result<Connection> {
        let transport = StreamableHttpClientTransport::from_uri(url.to_string());
        match ().serve(transport).await {
            Ok(service) => {
                debug!("MCP connected via streamable-http: {}", url);
                Ok(Connection { service })
            }
            Err(streamable_err) => {
                debug!(
                    "streamable-http handshake failed for {} ({}), trying SSE",
                    url, streamable_err
                );
                let transport = SseClientTransport::start(url.to_string())
                    .await
                    .map_err(|sse_err| {
                        anyhow!(
                            "MCP handshake failed for {} (streamable-http: {}; sse: {})",
                            url,
                            streamable_err,
                            sse_err
                        )
                    })?;
                let service = ().serve(transport).await.map_err(|e| {
                    anyhow!("MCP handshake failed for {} over SSE: {}", url, e)
                })?;
                info!("MCP connected via SSE fallback: {}", url);
                Ok(Connection { service })
            }
        }
    }

    async fn ensure_connected(&self, source_id: &str, url: &str) -> Result<()> {
        let mut connections = self.inner.lock().await;
        if connections.contains_key(source_id) {
            return Ok(());
        }
        let connection = Self::connect(url).await?;
        connections.insert(source_id.to_string(), connection);
        Ok(())
    }

    async fn drop_connection(&self, source_id: &str) {
        if let Some(connection) = self.inner.lock().await.remove(source_id) {
            if let Err(e) = connection.service.cancel().await {
                warn!("error closing MCP connection {}: {}", source_id, e);
            }
        }
    }

    /// `listTools` becomes the catalog. Tool paths are
    /// `{source}.{tool_name}`, both sanitized.
    pub async fn load(
        &self,
        source: &ToolSource,
        warnings: &mut Vec<String>,
    ) -> Result<Vec<SerializedTool>> {
        let url = source
            .config
            .get("url")
            .and_then(Value::as_str)
            .context("mcp source config needs a 'url'")?
            .to_string();
        self.ensure_connected(&source.id, &url).await?;

        let listed = {
            let connections = self.inner.lock().await;
            let connection = connections
                .get(&source.id)
                .context("mcp connection vanished during load")?;
            connection.service.peer().list_all_tools().await
        };
        let mcp_tools = match listed {
            Ok(tools) => tools,
            Err(e) => {
                self.drop_connection(&source.id).await;
                bail!("listTools failed for {}: {}", source.source_key(), e);
            }
        };

        let trusted = source.config.get("trust").and_then(Value::as_str) == Some("trusted");
        let approval = if trusted {
            ApprovalMode::Auto
        } else {
            ApprovalMode::Required
        };
        let source_segment = sanitize_segment(&source.name);
        let source_key = source.source_key();

        let mut tools = Vec::new();
        for mcp_tool in mcp_tools {
            let description = mcp_tool.description.as_deref().unwrap_or("").to_string();
            let input_schema = Value::Object((*mcp_tool.input_schema).clone());
            if mcp_tool.name.is_empty() {
                warnings.push(format!("{}: skipped a tool with an empty name", source_key));
                continue;
            }
            tools.push(SerializedTool {
                path: format!("{}.{}", source_segment, sanitize_segment(&mcp_tool.name)),
                description,
                input_hint: None,
                output_hint: None,
                input_schema,
                output_schema: None,
                approval,
                source_key: source_key.clone(),
                requires_credential: false,
                spec: ToolSpec::Mcp {
                    source_id: source.id.clone(),
                    url: url.clone(),
                    tool_name: mcp_tool.name.to_string(),
                },
            });
        }
        Ok(tools)
    }

    /// Forward to `callTool`, reconnecting once when the failure looks like
    /// a dropped socket.
    pub async fn call(
        &self,
        source_id: &str,
        url: &str,
        tool_name: &str,
        input: &Value,
    ) -> Result<Value> {
        match self.call_once(source_id, url, tool_name, input).await {
            Ok(value) => Ok(value),
            Err(e) if TRANSIENT_RE.is_match(&format!("{:#}", e)) => {
                warn!(
                    "MCP call to {} failed with a transient error ({}); reconnecting",
                    tool_name, e
                );
                self.drop_connection(source_id).await;
                self.call_once(source_id, url, tool_name, input).await
            }
            Err(e) => Err(e),
        }
    }

    async fn call_once(
        &self,
        source_id: &str,
        url: &str,
        tool_name: &str,
        input: &Value,
    ) -> Result<Value> {
        self.ensure_connected(source_id, url).await?;
        let peer = {
            let connections = self.inner.lock().await;
            connections
                .get(source_id)
                .context("mcp connection vanished")?
                .service
                .peer()
                .clone()
        };

        let arguments = match input {
            Value::Object(map) => Some(map.clone()),
            Value::Null => None,
            other => {
                let mut map = serde_json::Map::new();
                map.insert("input".to_string(), other.clone());
                Some(map)
            }
        };

        let result = peer
            .call_tool(CallToolRequestParams {
                meta: None,
                name: Cow::Owned(tool_name.to_string()),
                arguments,
                task: None,
            })
            .await
            .map_err(|e| anyhow!("MCP tool '{}' call failed: {}", tool_name, e))?;

        let output = flatten_content(&result.content);
        if result.is_error.unwrap_or(false) {
            bail!("MCP tool '{}' returned an error: {}", tool_name, output);
        }
        // A single JSON text block comes back structured.
        Ok(serde_json::from_str(&output).unwrap_or(Value::String(output)))
    }
}

impl Default for McpConnections {
    fn default() -> Self {
        Self::new()
    }
}

fn flatten_content(content: &[rmcp::model::Content]) -> String {
    let mut output = String::new();
    for block in content {
        if !output.is_empty() {
            output.push('\n');
        }
        match &block.raw {
            RawContent::Text(text) => output.push_str(&text.text),
            RawContent::Image(img) => {
                output.push_str(&format!("[Image: {} ({} bytes)]", img.mime_type, img.data.len()));
            }
            _ => output.push_str("[Unsupported MCP content type]"),
        }
    }
    if output.is_empty() {
        output.push_str("(no output)");
    }
    output
}
