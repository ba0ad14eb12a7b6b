use crate::credentials::ResolvedCredential;
use crate::store::types::{ApprovalMode, ToolSource};
use anyhow::{Context, Result, bail};
use serde_json::{Value, json};
use std::collections::HashMap;
use tracing::debug;

use super::{SerializedTool, ToolSpec, sanitize_segment};

/// Just enough introspection to enumerate the root fields.
const INTROSPECTION_QUERY: &str = "query { __schema { \
    queryType { name fields { name description } } \
    mutationType { name fields { name description } } } }";

/// Introspect the endpoint and emit one executor tool plus one pseudo-tool
/// per root field. Pseudo-tools exist for policy matching and discovery;
/// they rewrite into the executor when invoked.
pub async fn load(
    client: &reqwest::Client,
    source: &ToolSource,
    warnings: &mut Vec<String>,
) -> Result<Vec<SerializedTool>> {
    let endpoint = source
        .config
        .get("url")
        .and_then(Value::as_str)
        .context("graphql source config needs a 'url'")?
        .to_string();
    let static_headers = super::openapi::resolve_static_headers(&source.config);
    let requires_credential = source
        .config
        .get("requiresCredential")
        .and_then(Value::as_bool)
        .unwrap_or(false);

    let mut request = client.post(&endpoint).json(&json!({"query": INTROSPECTION_QUERY}));
    for (k, v) in &static_headers {
        request = request.header(k, v);
    }
    let schema: Value = request
        .send()
        .await
        .with_context(|| format!("introspection request to {} failed", endpoint))?
        .error_for_status()
        .context("introspection returned an error status")?
        .json()
        .await
        .context("introspection response is not JSON")?;

    if let Some(errors) = schema.get("errors").filter(|e| !e.is_null()) {
        bail!("introspection returned errors: {}", errors);
    }

    let source_segment = sanitize_segment(&source.name);
    let source_key = source.source_key();
    let mut tools = Vec::new();

    // The executor accepts a raw document; per-field policy happens against
    // the pseudo-tool paths, evaluated from the parsed query at call time.
    tools.push(SerializedTool {
        path: format!("{}.graphql", source_segment),
        description: format!(
            "Execute a GraphQL document against {}. Accepts {{query, variables?}}.",
            source.name
        ),
        input_schema: json!({
            "type": "object",
            "properties": {
                "query": {"type": "string"},
                "variables": {"type": "object"},
            },
            "required": ["query"],
        }),
        output_schema: None,
        approval: ApprovalMode::Auto,
        source_key: source_key.clone(),
        input_hint: Some("{ query: string; variables?: Record<string, unknown> }".to_string()),
        output_hint: None,
        requires_credential,
        spec: ToolSpec::GraphqlExecutor {
            endpoint: endpoint.clone(),
            static_headers: static_headers.clone(),
        },
    });

    for (operation, approval, pointer) in [
        ("query", ApprovalMode::Auto, "/data/__schema/queryType/fields"),
        (
            "mutation",
            ApprovalMode::Required,
            "/data/__schema/mutationType/fields",
        ),
    ] {
        let Some(fields) = schema.pointer(pointer).and_then(Value::as_array) else {
            if operation == "query" {
                warnings.push(format!(
                    "{}: introspection exposed no query root fields",
                    source_key
                ));
            }
            continue;
        };
        for field in fields {
            let Some(name) = field.get("name").and_then(Value::as_str) else {
                continue;
            };
            // Introspection meta-fields are not callable tools.
            if name.starts_with("__") {
                continue;
            }
            let description = field
                .get("description")
                .and_then(Value::as_str)
                .unwrap_or("")
                .to_string();
            tools.push(SerializedTool {
                path: format!("{}.{}.{}", source_segment, operation, sanitize_segment(name)),
                description,
                input_schema: json!({"type": "object", "properties": {}}),
                output_schema: None,
                approval,
                source_key: source_key.clone(),
                input_hint: None,
                output_hint: None,
                requires_credential,
                spec: ToolSpec::GraphqlField {
                    endpoint: endpoint.clone(),
                    static_headers: static_headers.clone(),
                    operation: operation.to_string(),
                    field: name.to_string(),
                },
            });
        }
    }

    debug!("graphql source {} yielded {} tools", source_key, tools.len());
    Ok(tools)
}

/// POST a GraphQL document. GraphQL-level errors fail the call so the
/// pipeline journals them like any other tool failure.
pub async fn run_executor(
    client: &reqwest::Client,
    endpoint: &str,
    static_headers: &HashMap<String, String>,
    input: &Value,
    credential: Option<&ResolvedCredential>,
) -> Result<Value> {
    let query = input
        .get("query")
        .and_then(Value::as_str)
        .context("graphql call needs a 'query' string")?;
    let mut body = json!({"query": query});
    if let Some(variables) = input.get("variables").filter(|v| !v.is_null()) {
        body["variables"] = variables.clone();
    }

    let mut request = client.post(endpoint).json(&body);
    for (k, v) in static_headers {
        request = request.header(k, v);
    }
    if let Some(credential) = credential {
        for (k, v) in credential.headers() {
            request = request.header(k, v);
        }
    }

    let response: Value = request
        .send()
        .await
        .with_context(|| format!("graphql request to {} failed", endpoint))?
        .error_for_status()
        .context("graphql endpoint returned an error status")?
        .json()
        .await
        .context("graphql response is not JSON")?;

    if let Some(errors) = response.get("errors").filter(|e| !e.is_null()) {
        bail!("graphql errors: {}", errors);
    }
    Ok(response.get("data").cloned().unwrap_or(Value::Null))
}

/// Build a minimal document invoking one root field with the given input
/// object rendered as argument literals.
pub fn synthesize_query(operation: &str, field: &str, input: &Value) -> String {
    let args = match input.as_object() {
        Some(map) if !map.is_empty() => {
            let rendered: Vec<String> = map
                .iter()
                .map(|(k, v)| format!("{}: {}", k, graphql_literal(v)))
                .collect();
            format!("({})", rendered.join(", "))
        }
        _ => String::new(),
    };
    format!("{} {{ {}{} }}", operation, field, args)
}

/// Render a JSON value as a GraphQL input literal. Object keys are emitted
/// bare, strings are escaped.
fn graphql_literal(value: &Value) -> String {
    match value {
        Value::Null => "null".to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        Value::String(s) => format!("\"{}\"", s.replace('\\', "\\\\").replace('"', "\\\"")),
        Value::Array(items) => {
            let rendered: Vec<String> = items.iter().map(graphql_literal).collect();
            format!("[{}]", rendered.join(", "))
        }
        Value::Object(map) => {
            let rendered: Vec<String> = map
                .iter()
                .map(|(k, v)| format!("{}: {}", k, graphql_literal(v)))
                .collect();
            format!("{{{}}}", rendered.join(", "))
        }
    }
}
