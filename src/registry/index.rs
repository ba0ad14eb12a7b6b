use crate::sources::SerializedTool;
use crate::sources::openapi::{is_lossy_hint, type_hint};
use crate::store::types::RegistryEntry;
use serde_json::Value;

/// Floor for the suggestion distance bound; the effective bound scales with
/// the requested path so long paths still get neighbors.
const MIN_SUGGESTION_BOUND: usize = 6;
const NAMESPACE_BONUS: usize = 4;
const SUGGESTION_LIMIT: usize = 3;

/// Fuzzy-lookup form of a path: lowercased segments with `_`/`-` stripped,
/// consecutive duplicate segments collapsed.
pub fn normalize_path(path: &str) -> String {
    let mut segments: Vec<String> = Vec::new();
    for raw in path.split('.') {
        let cleaned: String = raw
            .chars()
            .filter(|c| *c != '_' && *c != '-')
            .flat_map(char::to_lowercase)
            .collect();
        if cleaned.is_empty() {
            continue;
        }
        if segments.last().map(String::as_str) != Some(cleaned.as_str()) {
            segments.push(cleaned);
        }
    }
    segments.join(".")
}

/// `send_announcement` → `sendAnnouncement`.
fn camel_case(segment: &str) -> String {
    let mut out = String::with_capacity(segment.len());
    let mut upper_next = false;
    for c in segment.chars() {
        if c == '_' || c == '-' {
            upper_next = true;
        } else if upper_next {
            out.extend(c.to_uppercase());
            upper_next = false;
        } else {
            out.push(c);
        }
    }
    out
}

/// The prettified path surfaced to users: namespace kept as-is, remaining
/// segments camelCased.
pub fn preferred_path(path: &str) -> String {
    let mut segments = path.split('.');
    let Some(namespace) = segments.next() else {
        return path.to_string();
    };
    let mut out = namespace.to_string();
    for segment in segments {
        out.push('.');
        out.push_str(&camel_case(segment));
    }
    out
}

/// Alternative spellings accepted at lookup time. The canonical path itself
/// is excluded.
pub fn aliases(path: &str) -> Vec<String> {
    let mut out = Vec::new();
    for candidate in [
        preferred_path(path),
        path.split('.').map(camel_case).collect::<Vec<_>>().join("."),
        path.replace('_', ""),
        path.to_lowercase(),
    ] {
        if candidate != path && !out.contains(&candidate) {
            out.push(candidate);
        }
    }
    out
}

/// Compile one serialized tool into its catalog entry.
pub fn entry_from_tool(workspace_id: &str, build_id: &str, tool: &SerializedTool) -> RegistryEntry {
    let namespace = tool
        .path
        .split('.')
        .next()
        .unwrap_or(&tool.path)
        .to_string();

    // Source-provided display hints win unless they lost information.
    let input_hint = match &tool.input_hint {
        Some(hint) if !is_lossy_hint(hint) => Some(hint.clone()),
        _ => Some(type_hint(&tool.input_schema, 0)).filter(|h| !is_lossy_hint(h)),
    };
    let output_hint = match &tool.output_hint {
        Some(hint) if !is_lossy_hint(hint) => Some(hint.clone()),
        _ => tool
            .output_schema
            .as_ref()
            .map(|s| type_hint(s, 0))
            .filter(|h| !is_lossy_hint(h)),
    };

    RegistryEntry {
        workspace_id: workspace_id.to_string(),
        build_id: build_id.to_string(),
        path: tool.path.clone(),
        preferred_path: preferred_path(&tool.path),
        aliases: aliases(&tool.path),
        namespace,
        normalized_path: normalize_path(&tool.path),
        description: tool.description.clone(),
        approval_mode: tool.approval,
        source_key: tool.source_key.clone(),
        input_hint,
        output_hint,
        required_keys: schema_required(&tool.input_schema),
        preview_keys: schema_preview_keys(&tool.input_schema),
        tool: serde_json::to_value(tool).ok(),
    }
}

fn schema_required(schema: &Value) -> Vec<String> {
    schema
        .get("required")
        .and_then(Value::as_array)
        .map(|r| r.iter().filter_map(Value::as_str).map(str::to_string).collect())
        .unwrap_or_default()
}

fn schema_preview_keys(schema: &Value) -> Vec<String> {
    schema
        .get("properties")
        .and_then(Value::as_object)
        .map(|props| props.keys().take(5).cloned().collect())
        .unwrap_or_default()
}

/// Nearest catalog paths to a miss, by bounded edit distance with a bonus
/// for sharing the requested namespace.
pub fn suggest<'a>(requested: &str, known_paths: impl Iterator<Item = &'a str>) -> Vec<String> {
    let requested_namespace = requested.split('.').next().unwrap_or("");
    let bound = requested.len().max(MIN_SUGGESTION_BOUND);
    let mut scored: Vec<(usize, &str)> = known_paths
        .filter_map(|candidate| {
            let mut distance = strsim::levenshtein(requested, candidate);
            if candidate.split('.').next() == Some(requested_namespace) {
                distance = distance.saturating_sub(NAMESPACE_BONUS);
            }
            (distance <= bound).then_some((distance, candidate))
        })
        .collect();
    scored.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.cmp(b.1)));
    scored
        .into_iter()
        .take(SUGGESTION_LIMIT)
        .map(|(_, path)| path.to_string())
        .collect()
}
