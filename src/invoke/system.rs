use crate::registry::ToolRegistry;
use crate::store::Repository;
use anyhow::{Context, Result, bail};
use serde_json::{Value, json};

const DEFAULT_DISCOVER_LIMIT: usize = 20;

/// Paths handled in-process against the current registry, never by a
/// source loader.
pub fn is_system_path(path: &str) -> bool {
    matches!(path, "discover" | "catalog.namespaces" | "catalog.tools")
        || path.starts_with("storage.")
}

/// Run a system tool. Callers have already evaluated policy.
pub fn run_system_tool(
    repo: &Repository,
    registry: &ToolRegistry,
    workspace_id: &str,
    path: &str,
    input: &Value,
) -> Result<Value> {
    match path {
        "discover" => discover(repo, registry, workspace_id, input),
        "catalog.namespaces" => catalog_namespaces(repo, registry, workspace_id),
        "catalog.tools" => catalog_tools(repo, registry, workspace_id, input),
        "storage.get" => {
            let key = required_str(input, "key")?;
            Ok(repo
                .storage_get(workspace_id, key)?
                .unwrap_or(Value::Null))
        }
        "storage.put" => {
            let key = required_str(input, "key")?;
            let value = input.get("value").context("storage.put needs a 'value'")?;
            repo.storage_put(workspace_id, key, value)?;
            Ok(json!({"ok": true}))
        }
        "storage.list" => Ok(json!({"keys": repo.storage_list(workspace_id)?})),
        other => bail!("unknown system tool: {}", other),
    }
}

fn required_str<'a>(input: &'a Value, key: &str) -> Result<&'a str> {
    input
        .get(key)
        .and_then(Value::as_str)
        .with_context(|| format!("missing required string '{}'", key))
}

/// Substring search over paths, aliases, and descriptions.
fn discover(
    repo: &Repository,
    registry: &ToolRegistry,
    workspace_id: &str,
    input: &Value,
) -> Result<Value> {
    let build_id = registry.ready_build_id(workspace_id)?;
    let query = input
        .get("query")
        .and_then(Value::as_str)
        .unwrap_or("")
        .to_lowercase();
    let limit = input
        .get("limit")
        .and_then(Value::as_u64)
        .map(|l| l as usize)
        .unwrap_or(DEFAULT_DISCOVER_LIMIT);

    let entries = repo.list_registry_entries(workspace_id, &build_id)?;
    let matches: Vec<Value> = entries
        .iter()
        .filter(|entry| {
            query.is_empty()
                || entry.path.to_lowercase().contains(&query)
                || entry.description.to_lowercase().contains(&query)
                || entry
                    .aliases
                    .iter()
                    .any(|alias| alias.to_lowercase().contains(&query))
        })
        .take(limit)
        .map(|entry| {
            json!({
                "path": entry.preferred_path,
                "canonicalPath": entry.path,
                "description": entry.description,
                "inputHint": entry.input_hint,
                "approval": entry.approval_mode.as_str(),
                "source": entry.source_key,
            })
        })
        .collect();
    Ok(json!({"tools": matches, "total": matches.len()}))
}

fn catalog_namespaces(
    repo: &Repository,
    registry: &ToolRegistry,
    workspace_id: &str,
) -> Result<Value> {
    let build_id = registry.ready_build_id(workspace_id)?;
    let namespaces: Vec<Value> = repo
        .list_registry_namespaces(workspace_id, &build_id)?
        .iter()
        .map(|n| json!({"namespace": n.namespace, "toolCount": n.tool_count}))
        .collect();
    Ok(json!({"namespaces": namespaces}))
}

fn catalog_tools(
    repo: &Repository,
    registry: &ToolRegistry,
    workspace_id: &str,
    input: &Value,
) -> Result<Value> {
    let build_id = registry.ready_build_id(workspace_id)?;
    let namespace = input.get("namespace").and_then(Value::as_str);
    let tools: Vec<Value> = repo
        .list_registry_entries(workspace_id, &build_id)?
        .iter()
        .filter(|entry| namespace.is_none_or(|ns| entry.namespace == ns))
        .map(|entry| {
            json!({
                "path": entry.preferred_path,
                "canonicalPath": entry.path,
                "namespace": entry.namespace,
                "description": entry.description,
                "inputHint": entry.input_hint,
                "outputHint": entry.output_hint,
                "requiredKeys": entry.required_keys,
                "approval": entry.approval_mode.as_str(),
            })
        })
        .collect();
    Ok(json!({"tools": tools}))
}
