use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// Task lifecycle states. Terminal states are never left once entered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Queued,
    Running,
    Completed,
    Failed,
    TimedOut,
    Denied,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::TimedOut | Self::Denied
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::TimedOut => "timed_out",
            Self::Denied => "denied",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "queued" => Some(Self::Queued),
            "running" => Some(Self::Running),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "timed_out" => Some(Self::TimedOut),
            "denied" => Some(Self::Denied),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: String,
    pub workspace_id: String,
    pub account_id: String,
    pub code: String,
    pub runtime_id: String,
    pub timeout_ms: u64,
    #[serde(default)]
    pub metadata: HashMap<String, Value>,
    pub status: TaskStatus,
    pub queued_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
}

/// Event families group the per-task journal for subscribers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventFamily {
    Task,
    Approval,
}

impl EventFamily {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Task => "task",
            Self::Approval => "approval",
        }
    }
}

/// One row of a task's append-only journal. `seq` is contiguous per task,
/// starting at 1.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskEvent {
    pub task_id: String,
    pub seq: i64,
    pub family: EventFamily,
    pub event_type: String,
    pub payload: Value,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalStatus {
    Pending,
    Approved,
    Denied,
}

impl ApprovalStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Approved => "approved",
            Self::Denied => "denied",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "approved" => Some(Self::Approved),
            "denied" => Some(Self::Denied),
            _ => None,
        }
    }
}

/// Human decision record gating a single tool call.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Approval {
    pub id: String,
    pub task_id: String,
    pub tool_path: String,
    pub input: Value,
    pub status: ApprovalStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reviewer_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolved_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolCallStatus {
    Requested,
    PendingApproval,
    Completed,
    Failed,
    Denied,
}

impl ToolCallStatus {
    pub fn is_settled(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Denied)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Requested => "requested",
            Self::PendingApproval => "pending_approval",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Denied => "denied",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "requested" => Some(Self::Requested),
            "pending_approval" => Some(Self::PendingApproval),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "denied" => Some(Self::Denied),
            _ => None,
        }
    }
}

/// One tool call per `(task_id, call_id)`. Settled calls are never
/// re-executed; replays return the persisted outcome.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolCall {
    pub task_id: String,
    pub call_id: String,
    pub tool_path: String,
    pub input: Value,
    pub status: ToolCallStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub approval_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    Openapi,
    Graphql,
    Mcp,
}

impl SourceKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Openapi => "openapi",
            Self::Graphql => "graphql",
            Self::Mcp => "mcp",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "openapi" => Some(Self::Openapi),
            "graphql" => Some(Self::Graphql),
            "mcp" => Some(Self::Mcp),
            _ => None,
        }
    }
}

/// Workspace-scoped definition of an external tool source.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolSource {
    pub id: String,
    pub workspace_id: String,
    #[serde(rename = "type")]
    pub kind: SourceKind,
    pub name: String,
    pub config: Value,
    pub enabled: bool,
    pub spec_hash: String,
    pub auth_fingerprint: String,
    pub updated_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

impl ToolSource {
    /// `"{kind}:{name}"`, e.g. `openapi:github`. Used for source-scoped
    /// policies and credential lookup.
    pub fn source_key(&self) -> String {
        format!("{}:{}", self.kind.as_str(), self.name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyScope {
    Account,
    Organization,
    Workspace,
}

impl PolicyScope {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Account => "account",
            Self::Organization => "organization",
            Self::Workspace => "workspace",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "account" => Some(Self::Account),
            "organization" => Some(Self::Organization),
            "workspace" => Some(Self::Workspace),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceType {
    AllTools,
    Source,
    Namespace,
    ToolPath,
}

impl ResourceType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::AllTools => "all_tools",
            Self::Source => "source",
            Self::Namespace => "namespace",
            Self::ToolPath => "tool_path",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "all_tools" => Some(Self::AllTools),
            "source" => Some(Self::Source),
            "namespace" => Some(Self::Namespace),
            "tool_path" => Some(Self::ToolPath),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchType {
    Exact,
    Glob,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyEffect {
    Allow,
    Deny,
}

/// Approval behavior attached to a policy or a tool's default.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalMode {
    #[default]
    Inherit,
    Auto,
    Required,
}

impl ApprovalMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Inherit => "inherit",
            Self::Auto => "auto",
            Self::Required => "required",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "inherit" => Some(Self::Inherit),
            "auto" => Some(Self::Auto),
            "required" => Some(Self::Required),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConditionOp {
    Eq,
    Neq,
    Contains,
}

/// A predicate over one key of a tool call's input.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArgumentCondition {
    pub key: String,
    pub op: ConditionOp,
    pub value: Value,
}

/// A single access-policy row. Read at decision time; never compiled or
/// cached across mutations.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccessPolicy {
    pub id: String,
    pub workspace_id: String,
    pub scope: PolicyScope,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub organization_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_account_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    pub resource_type: ResourceType,
    pub pattern: String,
    pub match_type: MatchType,
    pub effect: PolicyEffect,
    #[serde(default)]
    pub approval_mode: ApprovalMode,
    #[serde(default)]
    pub argument_conditions: Vec<ArgumentCondition>,
    #[serde(default)]
    pub priority: i64,
    /// Insertion order; the deterministic tie-break for equal specificity.
    #[serde(default)]
    pub created_order: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthType {
    Bearer,
    ApiKey,
    Basic,
}

impl AuthType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Bearer => "bearer",
            Self::ApiKey => "api_key",
            Self::Basic => "basic",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "bearer" => Some(Self::Bearer),
            "api_key" | "apiKey" => Some(Self::ApiKey),
            "basic" => Some(Self::Basic),
            _ => None,
        }
    }
}

/// A stored credential. The secret payload never leaves the store through
/// any response surface; listings expose only `has_secret`.
#[derive(Debug, Clone)]
pub struct CredentialRecord {
    pub id: String,
    pub scope: PolicyScope,
    pub workspace_id: String,
    pub account_id: Option<String>,
    pub source_key: String,
    pub auth_type: AuthType,
    /// Header name override for `api_key` credentials.
    pub header_name: Option<String>,
    pub secret_json: Value,
    pub extra_headers: HashMap<String, String>,
    pub updated_at: DateTime<Utc>,
}

impl CredentialRecord {
    /// The listing surface: everything but the secret.
    pub fn redacted(&self) -> Value {
        serde_json::json!({
            "id": self.id,
            "scope": self.scope.as_str(),
            "workspaceId": self.workspace_id,
            "accountId": self.account_id,
            "sourceKey": self.source_key,
            "authType": self.auth_type.as_str(),
            "hasSecret": !self.secret_json.is_null(),
            "updatedAt": self.updated_at.to_rfc3339(),
        })
    }
}

/// Per-workspace registry build bookkeeping.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistryState {
    pub workspace_id: String,
    pub signature: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ready_build_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub building_build_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub building_started_at: Option<DateTime<Utc>>,
    /// Per-source build state keyed by source id.
    #[serde(default)]
    pub source_states: HashMap<String, String>,
    #[serde(default)]
    pub warnings: Vec<String>,
    pub tool_count: i64,
    pub namespace_count: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub types_storage_id: Option<String>,
}

/// One compiled catalog entry under a build id.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistryEntry {
    pub workspace_id: String,
    pub build_id: String,
    pub path: String,
    pub preferred_path: String,
    pub aliases: Vec<String>,
    pub namespace: String,
    pub normalized_path: String,
    pub description: String,
    pub approval_mode: ApprovalMode,
    pub source_key: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input_hint: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_hint: Option<String>,
    #[serde(default)]
    pub required_keys: Vec<String>,
    #[serde(default)]
    pub preview_keys: Vec<String>,
    /// Serialized tool payload for executable entries; `None` for inert
    /// pseudo-tools that only exist for policy matching and discovery.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool: Option<Value>,
}

/// Namespace summary persisted alongside a build for `catalog.namespaces`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistryNamespace {
    pub workspace_id: String,
    pub build_id: String,
    pub namespace: String,
    pub tool_count: i64,
}
