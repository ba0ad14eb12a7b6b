use crate::credentials::ResolvedCredential;
use crate::store::types::{ApprovalMode, ToolSource};
use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use std::collections::HashMap;
use tracing::debug;

use super::{SerializedTool, ToolSpec, sanitize_segment};

const METHODS: &[&str] = &["get", "post", "put", "delete", "patch", "head", "options"];
const WRITE_METHODS: &[&str] = &["post", "put", "patch", "delete"];

/// `$ref` chains deeper than this are treated as cycles and collapse to an
/// empty schema.
const MAX_REF_DEPTH: usize = 16;

/// Marker appended by the hint renderer when it had to give up on a shape.
const LOSSY_HINT: &str = "unknown";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParamLocation {
    Path,
    Query,
    Header,
    Cookie,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ParamStyle {
    Form,
    SpaceDelimited,
    PipeDelimited,
    DeepObject,
    Simple,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationParam {
    pub name: String,
    pub location: ParamLocation,
    pub required: bool,
    pub style: ParamStyle,
    pub explode: bool,
    #[serde(default)]
    pub allow_reserved: bool,
}

/// Everything needed to execute one REST operation at invocation time.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpenapiOperation {
    pub base_url: String,
    pub method: String,
    pub path_template: String,
    pub params: Vec<OperationParam>,
    pub has_body: bool,
    #[serde(default)]
    pub static_headers: HashMap<String, String>,
}

/// Scan an OpenAPI source into tools. The spec comes from `config.spec`
/// inline or is fetched from `config.url`; every `(path, method)` pair with
/// an operation becomes one tool.
pub async fn load(
    client: &reqwest::Client,
    source: &ToolSource,
    warnings: &mut Vec<String>,
) -> Result<Vec<SerializedTool>> {
    let doc = match source.config.get("spec") {
        Some(inline) if !inline.is_null() => inline.clone(),
        _ => {
            let url = source
                .config
                .get("url")
                .and_then(Value::as_str)
                .context("openapi source config needs either 'spec' or 'url'")?;
            client
                .get(url)
                .send()
                .await
                .with_context(|| format!("failed to fetch OpenAPI spec from {}", url))?
                .error_for_status()
                .with_context(|| format!("OpenAPI spec fetch from {} returned an error", url))?
                .json::<Value>()
                .await
                .context("OpenAPI spec is not valid JSON")?
        }
    };

    let base_url = source
        .config
        .get("baseUrl")
        .and_then(Value::as_str)
        .map(str::to_string)
        .or_else(|| {
            doc.pointer("/servers/0/url")
                .and_then(Value::as_str)
                .map(str::to_string)
        })
        .context("openapi source has no baseUrl and the spec lists no servers")?;

    let static_headers = resolve_static_headers(&source.config);
    let requires_credential = source
        .config
        .get("requiresCredential")
        .and_then(Value::as_bool)
        .unwrap_or(false);

    let Some(paths) = doc.get("paths").and_then(Value::as_object) else {
        warnings.push(format!("{}: spec has no paths object", source.source_key()));
        return Ok(Vec::new());
    };

    let source_segment = sanitize_segment(&source.name);
    let source_key = source.source_key();
    let mut tools = Vec::new();

    for (path_template, item) in paths {
        let Some(item) = item.as_object() else {
            continue;
        };
        let shared_params = item.get("parameters").cloned().unwrap_or(Value::Null);

        for method in METHODS {
            let Some(op) = item.get(*method).filter(|v| v.is_object()) else {
                continue;
            };

            match build_tool(BuildTool {
                doc: &doc,
                source_segment: &source_segment,
                source_key: &source_key,
                base_url: &base_url,
                static_headers: &static_headers,
                requires_credential,
                path_template,
                method,
                op,
                shared_params: &shared_params,
            }) {
                Ok(tool) => tools.push(tool),
                Err(e) => warnings.push(format!(
                    "{}: {} {} skipped: {:#}",
                    source_key, method, path_template, e
                )),
            }
        }
    }

    debug!("openapi source {} yielded {} tools", source_key, tools.len());
    Ok(tools)
}

struct BuildTool<'a> {
    doc: &'a Value,
    source_segment: &'a str,
    source_key: &'a str,
    base_url: &'a str,
    static_headers: &'a HashMap<String, String>,
    requires_credential: bool,
    path_template: &'a str,
    method: &'a str,
    op: &'a Value,
    shared_params: &'a Value,
}

fn build_tool(args: BuildTool<'_>) -> Result<SerializedTool> {
    let BuildTool {
        doc,
        source_segment,
        source_key,
        base_url,
        static_headers,
        requires_credential,
        path_template,
        method,
        op,
        shared_params,
    } = args;

    let mut params = Vec::new();
    let mut properties = Map::new();
    let mut required = Vec::new();

    let mut raw_params: Vec<Value> = Vec::new();
    for list in [shared_params, op.get("parameters").unwrap_or(&Value::Null)] {
        if let Some(items) = list.as_array() {
            raw_params.extend(items.iter().map(|p| resolve_refs(doc, p, 0)));
        }
    }

    for raw in &raw_params {
        let name = raw
            .get("name")
            .and_then(Value::as_str)
            .context("parameter without a name")?;
        let location = match raw.get("in").and_then(Value::as_str) {
            Some("path") => ParamLocation::Path,
            Some("query") => ParamLocation::Query,
            Some("header") => ParamLocation::Header,
            Some("cookie") => ParamLocation::Cookie,
            other => bail!("parameter {} has unsupported location {:?}", name, other),
        };
        let is_required =
            raw.get("required").and_then(Value::as_bool).unwrap_or(false) || location == ParamLocation::Path;
        let style = match raw.get("style").and_then(Value::as_str) {
            Some("spaceDelimited") => ParamStyle::SpaceDelimited,
            Some("pipeDelimited") => ParamStyle::PipeDelimited,
            Some("deepObject") => ParamStyle::DeepObject,
            Some("simple") => ParamStyle::Simple,
            Some("form") => ParamStyle::Form,
            // OpenAPI defaults: form for query/cookie, simple for
            // path/header.
            _ => match location {
                ParamLocation::Query | ParamLocation::Cookie => ParamStyle::Form,
                ParamLocation::Path | ParamLocation::Header => ParamStyle::Simple,
            },
        };
        let explode = raw
            .get("explode")
            .and_then(Value::as_bool)
            .unwrap_or(style == ParamStyle::Form || style == ParamStyle::DeepObject);

        params.push(OperationParam {
            name: name.to_string(),
            location,
            required: is_required,
            style,
            explode,
            allow_reserved: raw
                .get("allowReserved")
                .and_then(Value::as_bool)
                .unwrap_or(false),
        });

        let schema = raw
            .get("schema")
            .map(|s| resolve_refs(doc, s, 0))
            .unwrap_or_else(|| json!({"type": "string"}));
        properties.insert(name.to_string(), schema);
        if is_required {
            required.push(Value::String(name.to_string()));
        }
    }

    // Merge the JSON request body's object properties into the same input
    // schema; a non-object body surfaces as a single `body` property.
    let body_schema = op
        .pointer("/requestBody/content/application~1json/schema")
        .map(|s| resolve_refs(doc, s, 0));
    let has_body = body_schema.is_some();
    if let Some(body) = &body_schema {
        if let Some(body_props) = body.get("properties").and_then(Value::as_object) {
            for (k, v) in body_props {
                properties.entry(k.clone()).or_insert_with(|| v.clone());
            }
            if let Some(body_required) = body.get("required").and_then(Value::as_array) {
                for r in body_required {
                    if !required.contains(r) {
                        required.push(r.clone());
                    }
                }
            }
        } else {
            properties.insert("body".to_string(), body.clone());
        }
    }

    let input_schema = json!({
        "type": "object",
        "properties": properties,
        "required": required,
    });

    let tag = op
        .pointer("/tags/0")
        .and_then(Value::as_str)
        .unwrap_or("default");
    let op_id = op
        .get("operationId")
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or_else(|| format!("{}_{}", method, path_template));
    let path = format!(
        "{}.{}.{}",
        source_segment,
        sanitize_segment(tag),
        sanitize_segment(&op_id)
    );

    let approval = match op.get("x-approval").and_then(Value::as_str) {
        Some(raw) => ApprovalMode::from_str(raw)
            .with_context(|| format!("invalid x-approval value: {}", raw))?,
        None if WRITE_METHODS.contains(&method) => ApprovalMode::Required,
        None => ApprovalMode::Auto,
    };

    let description = op
        .get("summary")
        .or_else(|| op.get("description"))
        .and_then(Value::as_str)
        .unwrap_or("")
        .to_string();

    let output_schema = op
        .pointer("/responses/200/content/application~1json/schema")
        .map(|s| resolve_refs(doc, s, 0));

    Ok(SerializedTool {
        path,
        description,
        input_hint: Some(type_hint(&input_schema, 0)),
        output_hint: output_schema.as_ref().map(|s| type_hint(s, 0)),
        input_schema,
        output_schema,
        approval,
        source_key: source_key.to_string(),
        requires_credential,
        spec: ToolSpec::Openapi(OpenapiOperation {
            base_url: base_url.trim_end_matches('/').to_string(),
            method: method.to_string(),
            path_template: path_template.to_string(),
            params,
            has_body,
            static_headers: static_headers.clone(),
        }),
    })
}

/// Static auth headers from a source config's `auth.headers` object.
pub fn resolve_static_headers(config: &Value) -> HashMap<String, String> {
    config
        .pointer("/auth/headers")
        .and_then(Value::as_object)
        .map(|headers| {
            headers
                .iter()
                .filter_map(|(k, v)| v.as_str().map(|v| (k.clone(), v.to_string())))
                .collect()
        })
        .unwrap_or_default()
}

/// Deep-resolve local `#/...` refs. Cycles and over-deep chains collapse to
/// an empty schema rather than recursing forever.
pub fn resolve_refs(doc: &Value, node: &Value, depth: usize) -> Value {
    if depth > MAX_REF_DEPTH {
        return json!({});
    }
    if let Some(reference) = node.get("$ref").and_then(Value::as_str) {
        let Some(pointer) = reference.strip_prefix('#') else {
            // Remote refs are out of reach at scan time.
            return json!({});
        };
        return match doc.pointer(pointer) {
            Some(target) => resolve_refs(doc, target, depth + 1),
            None => json!({}),
        };
    }
    match node {
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), resolve_refs(doc, v, depth + 1)))
                .collect(),
        ),
        Value::Array(items) => Value::Array(
            items.iter().map(|v| resolve_refs(doc, v, depth + 1)).collect(),
        ),
        other => other.clone(),
    }
}

/// Render a JSON Schema as a compact TypeScript-flavored hint, e.g.
/// `{ channel: string; message: string; urgent?: boolean }`.
pub fn type_hint(schema: &Value, depth: usize) -> String {
    if depth > 4 {
        return LOSSY_HINT.to_string();
    }
    if let Some(options) = schema.get("enum").and_then(Value::as_array) {
        let rendered: Vec<String> = options
            .iter()
            .map(|v| match v {
                Value::String(s) => format!("\"{}\"", s),
                other => other.to_string(),
            })
            .collect();
        return rendered.join(" | ");
    }
    match schema.get("type").and_then(Value::as_str) {
        Some("string") => "string".to_string(),
        Some("integer") | Some("number") => "number".to_string(),
        Some("boolean") => "boolean".to_string(),
        Some("null") => "null".to_string(),
        Some("array") => {
            let inner = schema
                .get("items")
                .map(|i| type_hint(i, depth + 1))
                .unwrap_or_else(|| LOSSY_HINT.to_string());
            if inner.contains(' ') {
                format!("({})[]", inner)
            } else {
                format!("{}[]", inner)
            }
        }
        Some("object") | None if schema.get("properties").is_some() => {
            let required: Vec<&str> = schema
                .get("required")
                .and_then(Value::as_array)
                .map(|r| r.iter().filter_map(Value::as_str).collect())
                .unwrap_or_default();
            let props = schema
                .get("properties")
                .and_then(Value::as_object)
                .map(|props| {
                    props
                        .iter()
                        .map(|(name, prop)| {
                            let optional = if required.contains(&name.as_str()) { "" } else { "?" };
                            format!("{}{}: {}", name, optional, type_hint(prop, depth + 1))
                        })
                        .collect::<Vec<_>>()
                        .join("; ")
                })
                .unwrap_or_default();
            format!("{{ {} }}", props)
        }
        Some("object") => "Record<string, unknown>".to_string(),
        _ => LOSSY_HINT.to_string(),
    }
}

/// Whether a display hint lost information and should be re-derived.
pub fn is_lossy_hint(hint: &str) -> bool {
    hint.is_empty() || hint.contains(LOSSY_HINT)
}

/// Execute a REST operation: substitute path params, serialize query and
/// header params per their style, attach the body for write methods, and
/// merge headers with precedence static auth < credential < input.
pub async fn run(
    client: &reqwest::Client,
    op: &OpenapiOperation,
    input: &Value,
    credential: Option<&ResolvedCredential>,
) -> Result<Value> {
    let input_obj = input.as_object().cloned().unwrap_or_default();
    let mut consumed: Vec<&str> = Vec::new();

    // Path substitution.
    let mut path = op.path_template.to_string();
    for param in op.params.iter().filter(|p| p.location == ParamLocation::Path) {
        let placeholder = format!("{{{}}}", param.name);
        match input_obj.get(&param.name) {
            Some(value) => {
                let rendered = serialize_simple(value, param.explode);
                path = path.replace(&placeholder, &urlencoding::encode(&rendered));
                consumed.push(&param.name);
            }
            None if param.required => {
                bail!("missing required path parameter '{}'", param.name)
            }
            None => {}
        }
    }

    // Query serialization.
    let mut query_pairs: Vec<(String, String)> = Vec::new();
    for param in op.params.iter().filter(|p| p.location == ParamLocation::Query) {
        let Some(value) = input_obj.get(&param.name) else {
            if param.required {
                bail!("missing required query parameter '{}'", param.name);
            }
            continue;
        };
        consumed.push(&param.name);
        serialize_query(param, value, &mut query_pairs);
    }

    let mut url = format!("{}{}", op.base_url, path);
    if !query_pairs.is_empty() {
        let mut encoder = form_urlencoded::Serializer::new(String::new());
        for (k, v) in &query_pairs {
            encoder.append_pair(k, v);
        }
        url.push('?');
        url.push_str(&encoder.finish());
    }

    let method: reqwest::Method = op
        .method
        .to_uppercase()
        .parse()
        .context("invalid HTTP method")?;
    let is_write = WRITE_METHODS.contains(&op.method.as_str());

    // Header precedence: static auth, then credential, then explicit input.
    // Composed in a map so a later layer replaces, not appends.
    let mut headers: HashMap<String, String> = op.static_headers.clone();
    if let Some(credential) = credential {
        for (k, v) in credential.headers() {
            headers.insert(k.clone(), v.clone());
        }
    }
    let mut cookies: Vec<String> = Vec::new();
    for param in op.params.iter().filter(|p| {
        p.location == ParamLocation::Header || p.location == ParamLocation::Cookie
    }) {
        let Some(value) = input_obj.get(&param.name) else {
            if param.required {
                bail!("missing required {} parameter '{}'",
                    if param.location == ParamLocation::Header { "header" } else { "cookie" },
                    param.name);
            }
            continue;
        };
        consumed.push(&param.name);
        let rendered = serialize_simple(value, param.explode);
        if param.location == ParamLocation::Header {
            headers.insert(param.name.clone(), rendered);
        } else {
            cookies.push(format!("{}={}", param.name, rendered));
        }
    }
    if !cookies.is_empty() {
        headers.insert("Cookie".to_string(), cookies.join("; "));
    }

    let mut request = client.request(method, &url);
    for (k, v) in &headers {
        request = request.header(k, v);
    }

    // Whatever the params did not consume is the body.
    if op.has_body && is_write {
        let body: Map<String, Value> = input_obj
            .iter()
            .filter(|(k, _)| !consumed.contains(&k.as_str()))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        if !body.is_empty() {
            request = request
                .header("Content-Type", "application/json")
                .json(&Value::Object(body));
        }
    }

    let response = request.send().await.context("request failed")?;
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    if !status.is_success() {
        let snippet: String = body.chars().take(300).collect();
        bail!("{} {} returned {}: {}", op.method.to_uppercase(), url, status, snippet);
    }
    Ok(serde_json::from_str(&body).unwrap_or(Value::String(body)))
}

fn serialize_query(param: &OperationParam, value: &Value, pairs: &mut Vec<(String, String)>) {
    match (value, param.style) {
        (Value::Array(items), ParamStyle::Form) if param.explode => {
            for item in items {
                pairs.push((param.name.clone(), scalar_string(item)));
            }
        }
        (Value::Array(items), ParamStyle::Form) => {
            pairs.push((param.name.clone(), join_scalars(items, ",")));
        }
        (Value::Array(items), ParamStyle::SpaceDelimited) => {
            pairs.push((param.name.clone(), join_scalars(items, " ")));
        }
        (Value::Array(items), ParamStyle::PipeDelimited) => {
            pairs.push((param.name.clone(), join_scalars(items, "|")));
        }
        (Value::Object(map), ParamStyle::DeepObject) => {
            for (k, v) in map {
                pairs.push((format!("{}[{}]", param.name, k), scalar_string(v)));
            }
        }
        (Value::Object(map), _) if param.explode => {
            for (k, v) in map {
                pairs.push((k.clone(), scalar_string(v)));
            }
        }
        (Value::Object(map), _) => {
            let flattened: Vec<String> = map
                .iter()
                .flat_map(|(k, v)| [k.clone(), scalar_string(v)])
                .collect();
            pairs.push((param.name.clone(), flattened.join(",")));
        }
        (scalar, _) => pairs.push((param.name.clone(), scalar_string(scalar))),
    }
}

/// `simple` style rendering for path and header params.
fn serialize_simple(value: &Value, explode: bool) -> String {
    match value {
        Value::Array(items) => join_scalars(items, ","),
        Value::Object(map) => {
            if explode {
                map.iter()
                    .map(|(k, v)| format!("{}={}", k, scalar_string(v)))
                    .collect::<Vec<_>>()
                    .join(",")
            } else {
                map.iter()
                    .flat_map(|(k, v)| [k.clone(), scalar_string(v)])
                    .collect::<Vec<_>>()
                    .join(",")
            }
        }
        scalar => scalar_string(scalar),
    }
}

fn join_scalars(items: &[Value], separator: &str) -> String {
    items
        .iter()
        .map(scalar_string)
        .collect::<Vec<_>>()
        .join(separator)
}

fn scalar_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
