use crate::store::types::{
    AccessPolicy, ApprovalMode, ArgumentCondition, ConditionOp, MatchType, PolicyEffect,
    PolicyScope, ResourceType,
};
use serde_json::Value;
use tracing::debug;

// Specificity weights. A more targeted policy always outranks a broader one;
// `priority` is additive on top so operators can force an ordering.
const WEIGHT_ACCOUNT_MATCH: i64 = 64;
const WEIGHT_ARGUMENT_CONDITIONS: i64 = 32;
const WEIGHT_RESOURCE_TOOL_PATH: i64 = 24;
const WEIGHT_RESOURCE_NAMESPACE: i64 = 18;
const WEIGHT_SCOPE_WORKSPACE: i64 = 16;
const WEIGHT_RESOURCE_SOURCE: i64 = 12;
const WEIGHT_SCOPE_ORGANIZATION: i64 = 8;
const WEIGHT_CLIENT_MATCH: i64 = 4;
const WEIGHT_EXACT_MATCH: i64 = 3;

/// Outcome of a policy evaluation. Ordered by strictness:
/// `Deny > RequireApproval > Allow`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Allow,
    RequireApproval,
    Deny,
}

impl Decision {
    fn strictness(self) -> u8 {
        match self {
            Self::Allow => 0,
            Self::RequireApproval => 1,
            Self::Deny => 2,
        }
    }

    /// The stricter of two decisions.
    pub fn max(self, other: Self) -> Self {
        if other.strictness() > self.strictness() {
            other
        } else {
            self
        }
    }
}

/// The acting identity a decision is made for.
#[derive(Debug, Clone, Default)]
pub struct PolicyContext {
    pub workspace_id: String,
    pub organization_id: Option<String>,
    pub account_id: String,
    pub client_id: Option<String>,
}

/// The minimal view of a tool the engine needs.
#[derive(Debug, Clone)]
pub struct PolicyTool<'a> {
    pub path: &'a str,
    pub source_key: &'a str,
    /// The tool's own approval default, used when no policy applies or the
    /// winning policy says `inherit`.
    pub default_approval: ApprovalMode,
}

impl PolicyTool<'_> {
    fn default_decision(&self) -> Decision {
        match self.default_approval {
            ApprovalMode::Required => Decision::RequireApproval,
            ApprovalMode::Auto | ApprovalMode::Inherit => Decision::Allow,
        }
    }
}

/// Pure decision function. Policies are taken as given — callers read them
/// fresh from the store at every call; nothing is compiled or cached here.
pub fn decide(
    tool: &PolicyTool<'_>,
    ctx: &PolicyContext,
    policies: &[AccessPolicy],
    input: Option<&Value>,
) -> Decision {
    // The synthetic discovery surface is never gated.
    if tool.path == "discover" || tool.path.starts_with("catalog.") {
        return Decision::Allow;
    }

    let mut best: Option<(&AccessPolicy, i64)> = None;
    for policy in policies {
        if !policy_applies(policy, tool, ctx, input) {
            continue;
        }
        let score = specificity(policy, ctx);
        let better = match best {
            None => true,
            // Ties break deterministically by creation order: the earlier
            // policy keeps winning.
            Some((current, current_score)) => {
                score > current_score
                    || (score == current_score && policy.created_order < current.created_order)
            }
        };
        if better {
            best = Some((policy, score));
        }
    }

    let Some((winner, score)) = best else {
        return tool.default_decision();
    };
    debug!(
        "policy {} wins for {} (score {})",
        winner.id, tool.path, score
    );

    if winner.effect == PolicyEffect::Deny {
        return Decision::Deny;
    }
    match winner.approval_mode {
        ApprovalMode::Required => Decision::RequireApproval,
        ApprovalMode::Auto => Decision::Allow,
        ApprovalMode::Inherit => tool.default_decision(),
    }
}

fn policy_applies(
    policy: &AccessPolicy,
    tool: &PolicyTool<'_>,
    ctx: &PolicyContext,
    input: Option<&Value>,
) -> bool {
    match policy.scope {
        PolicyScope::Workspace => {
            if policy.workspace_id != ctx.workspace_id {
                return false;
            }
        }
        PolicyScope::Organization => {
            let matches = match (&policy.organization_id, &ctx.organization_id) {
                (Some(pol), Some(ctx)) => pol == ctx,
                // An org-scoped policy without an org pin applies broadly.
                (None, _) => true,
                (Some(_), None) => false,
            };
            if !matches {
                return false;
            }
        }
        PolicyScope::Account => {}
    }

    if let Some(target) = &policy.target_account_id {
        if *target != ctx.account_id {
            return false;
        }
    }
    if let Some(client) = &policy.client_id {
        if Some(client.as_str()) != ctx.client_id.as_deref() {
            return false;
        }
    }
    if !policy.argument_conditions.is_empty() {
        let Some(input) = input else { return false };
        if !policy
            .argument_conditions
            .iter()
            .all(|cond| condition_matches(cond, input))
        {
            return false;
        }
    }

    match policy.resource_type {
        ResourceType::AllTools => true,
        ResourceType::Source => {
            pattern_matches(&policy.pattern, policy.match_type, tool.source_key)
        }
        ResourceType::ToolPath => pattern_matches(&policy.pattern, policy.match_type, tool.path),
        ResourceType::Namespace => match policy.match_type {
            // An exact namespace names the subtree, not a single path.
            MatchType::Exact => {
                tool.path == policy.pattern
                    || tool
                        .path
                        .strip_prefix(policy.pattern.as_str())
                        .is_some_and(|rest| rest.starts_with('.'))
            }
            MatchType::Glob => pattern_matches(&policy.pattern, MatchType::Glob, tool.path),
        },
    }
}

fn pattern_matches(pattern: &str, match_type: MatchType, candidate: &str) -> bool {
    match match_type {
        MatchType::Exact => pattern == candidate,
        MatchType::Glob => globset::Glob::new(pattern)
            .map(|g| g.compile_matcher().is_match(candidate))
            .unwrap_or(false),
    }
}

fn condition_matches(cond: &ArgumentCondition, input: &Value) -> bool {
    let actual = input.get(&cond.key);
    match cond.op {
        ConditionOp::Eq => actual == Some(&cond.value),
        ConditionOp::Neq => actual != Some(&cond.value),
        ConditionOp::Contains => match (actual, &cond.value) {
            (Some(Value::String(hay)), Value::String(needle)) => hay.contains(needle.as_str()),
            (Some(Value::Array(items)), needle) => items.contains(needle),
            _ => false,
        },
    }
}

fn specificity(policy: &AccessPolicy, ctx: &PolicyContext) -> i64 {
    let mut score = 0;
    if policy.target_account_id.as_deref() == Some(ctx.account_id.as_str()) {
        score += WEIGHT_ACCOUNT_MATCH;
    }
    score += match policy.scope {
        PolicyScope::Workspace => WEIGHT_SCOPE_WORKSPACE,
        PolicyScope::Organization => WEIGHT_SCOPE_ORGANIZATION,
        PolicyScope::Account => 0,
    };
    if policy.client_id.is_some() && policy.client_id.as_deref() == ctx.client_id.as_deref() {
        score += WEIGHT_CLIENT_MATCH;
    }
    score += match policy.resource_type {
        ResourceType::ToolPath => WEIGHT_RESOURCE_TOOL_PATH,
        ResourceType::Namespace => WEIGHT_RESOURCE_NAMESPACE,
        ResourceType::Source => WEIGHT_RESOURCE_SOURCE,
        ResourceType::AllTools => 0,
    };
    if policy.match_type == MatchType::Exact {
        score += WEIGHT_EXACT_MATCH;
    }
    if !policy.argument_conditions.is_empty() {
        score += WEIGHT_ARGUMENT_CONDITIONS;
    }
    score += policy
        .pattern
        .chars()
        .filter(|c| *c != '*' && *c != '?')
        .count() as i64;
    score + policy.priority
}

/// Strictest decision across a set of synthetic tool paths, used for
/// GraphQL entry tools where one call fans out over several fields.
pub fn decide_strictest<'a>(
    tools: impl IntoIterator<Item = PolicyTool<'a>>,
    ctx: &PolicyContext,
    policies: &[AccessPolicy],
    input: Option<&Value>,
) -> Decision {
    let mut decision = Decision::Allow;
    for tool in tools {
        decision = decision.max(decide(&tool, ctx, policies, input));
        if decision == Decision::Deny {
            break;
        }
    }
    decision
}

/// The operation kind of a GraphQL document's first operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GraphqlOperation {
    Query,
    Mutation,
}

impl GraphqlOperation {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Query => "query",
            Self::Mutation => "mutation",
        }
    }
}

/// Extract the top-level field names of a GraphQL document's first
/// operation, tolerating aliases, arguments, variable definitions,
/// directives, comments and string literals. Fragment spreads at the top
/// level are skipped (their fields belong to other operations' decisions).
pub fn graphql_top_level_fields(query: &str) -> Option<(GraphqlOperation, Vec<String>)> {
    let stripped = strip_comments_and_strings(query);
    let trimmed = stripped.trim_start();

    let (operation, rest) = if let Some(rest) = trimmed.strip_prefix("mutation") {
        (GraphqlOperation::Mutation, rest)
    } else if let Some(rest) = trimmed.strip_prefix("query") {
        (GraphqlOperation::Query, rest)
    } else if trimmed.starts_with('{') {
        (GraphqlOperation::Query, trimmed)
    } else {
        return None;
    };

    // Skip the operation name and variable definitions up to the selection set.
    let body_start = rest.find('{')?;
    let body = &rest[body_start..];

    let mut fields = Vec::new();
    let mut depth = 0usize;
    let mut token = String::new();
    let mut chars = body.chars().peekable();
    let mut paren_depth = 0usize;

    while let Some(c) = chars.next() {
        match c {
            '{' if paren_depth == 0 => {
                if depth == 1 {
                    flush_field(&mut token, &mut fields, &mut chars);
                }
                depth += 1;
                token.clear();
            }
            '}' if paren_depth == 0 => {
                if depth == 1 {
                    flush_field(&mut token, &mut fields, &mut chars);
                }
                depth = depth.saturating_sub(1);
                if depth == 0 {
                    break;
                }
                token.clear();
            }
            '(' => {
                if depth == 1 && paren_depth == 0 {
                    flush_field(&mut token, &mut fields, &mut chars);
                }
                paren_depth += 1;
            }
            ')' => paren_depth = paren_depth.saturating_sub(1),
            _ if paren_depth > 0 => {}
            c if depth == 1 => {
                if c.is_alphanumeric() || c == '_' {
                    token.push(c);
                } else if c == ':' {
                    // Alias: drop the alias, keep the real field name.
                    token.clear();
                } else if c == '.' {
                    // Fragment spread "...Name" — swallow the name.
                    token.clear();
                    while chars
                        .peek()
                        .is_some_and(|n| n.is_alphanumeric() || *n == '_' || *n == '.')
                    {
                        chars.next();
                    }
                } else if c == '@' {
                    // Directive — swallow it.
                    while chars
                        .peek()
                        .is_some_and(|n| n.is_alphanumeric() || *n == '_')
                    {
                        chars.next();
                    }
                } else if c.is_whitespace() || c == ',' {
                    flush_field(&mut token, &mut fields, &mut chars);
                }
            }
            _ => {}
        }
    }

    if fields.is_empty() {
        None
    } else {
        Some((operation, fields))
    }
}

fn flush_field(
    token: &mut String,
    fields: &mut Vec<String>,
    chars: &mut std::iter::Peekable<std::str::Chars<'_>>,
) {
    if token.is_empty() {
        return;
    }
    // A token directly followed by ':' is an alias; the real field follows.
    let mut lookahead = chars.clone();
    while lookahead.peek().is_some_and(|c| c.is_whitespace()) {
        lookahead.next();
    }
    if lookahead.peek() == Some(&':') {
        // Consume whitespace + ':' so the alias is dropped.
        while chars.peek().is_some_and(|c| c.is_whitespace()) {
            chars.next();
        }
        chars.next();
        token.clear();
        return;
    }
    if !fields.contains(token) {
        fields.push(token.clone());
    }
    token.clear();
}

fn strip_comments_and_strings(query: &str) -> String {
    let mut out = String::with_capacity(query.len());
    let mut chars = query.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '#' => {
                for n in chars.by_ref() {
                    if n == '\n' {
                        out.push('\n');
                        break;
                    }
                }
            }
            '"' => {
                // Block or plain string; replace with a placeholder token.
                let block = chars.peek() == Some(&'"');
                let mut quotes = 1;
                if block {
                    while chars.peek() == Some(&'"') {
                        chars.next();
                        quotes += 1;
                    }
                }
                let closing = if quotes >= 3 { 3 } else { 1 };
                let mut run = 0;
                let mut escaped = false;
                for n in chars.by_ref() {
                    if escaped {
                        escaped = false;
                        continue;
                    }
                    match n {
                        '\\' => escaped = true,
                        '"' => {
                            run += 1;
                            if run >= closing {
                                break;
                            }
                        }
                        _ => run = 0,
                    }
                }
                out.push_str("\"\"");
            }
            other => out.push(other),
        }
    }
    out
}
