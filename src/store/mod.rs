pub mod types;

use crate::hub::EventHub;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{Connection, params};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use uuid::Uuid;

use types::{
    AccessPolicy, Approval, ApprovalMode, ApprovalStatus, AuthType, CredentialRecord, EventFamily,
    MatchType, PolicyEffect, PolicyScope, RegistryEntry, RegistryNamespace, RegistryState,
    ResourceType, SourceKind, Task, TaskEvent, TaskStatus, ToolCall, ToolCallStatus, ToolSource,
};

/// Listings of approvals are capped; the UI pages by status instead of
/// scrolling an unbounded set.
pub const MAX_APPROVAL_ROWS: usize = 500;

/// Registry entry writes are chunked to keep individual mutations small.
pub const REGISTRY_WRITE_BATCH: usize = 100;

/// Parameters for `create_task`.
#[derive(Debug, Clone)]
pub struct NewTask {
    pub workspace_id: String,
    pub account_id: String,
    pub code: String,
    pub runtime_id: String,
    pub timeout_ms: u64,
    pub metadata: HashMap<String, Value>,
}

/// Typed CRUD plus change notification over SQLite.
///
/// All mutations are atomic per entity: every write happens under the single
/// connection lock, which also makes tool-call state transitions and event
/// sequence allocation linearizable. Writes that create a `TaskEvent` publish
/// it through the [`EventHub`] after the row is durable.
pub struct Repository {
    conn: Mutex<Connection>,
    hub: Arc<EventHub>,
    queue_tx: watch::Sender<u64>,
}

impl Repository {
    pub fn open(db_path: impl AsRef<Path>, hub: Arc<EventHub>) -> Result<Self> {
        let db_path = db_path.as_ref();
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).with_context(|| {
                    format!("Failed to create repository directory: {}", parent.display())
                })?;
            }
        }

        let conn = Connection::open(db_path)
            .with_context(|| format!("Failed to open repository at: {}", db_path.display()))?;
        conn.execute_batch(
            "PRAGMA journal_mode=WAL;
             PRAGMA synchronous=NORMAL;
             PRAGMA busy_timeout=3000;
             PRAGMA foreign_keys=ON;",
        )?;

        let repo = Self {
            conn: Mutex::new(conn),
            hub,
            queue_tx: watch::channel(0).0,
        };
        repo.ensure_schema()
            .with_context(|| format!("Failed to initialize schema at: {}", db_path.display()))?;
        Ok(repo)
    }

    /// In-memory repository for tests and ephemeral dev runs.
    pub fn open_ephemeral(hub: Arc<EventHub>) -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory repository")?;
        let repo = Self {
            conn: Mutex::new(conn),
            hub,
            queue_tx: watch::channel(0).0,
        };
        repo.ensure_schema()?;
        Ok(repo)
    }

    pub fn hub(&self) -> Arc<EventHub> {
        self.hub.clone()
    }

    fn ensure_schema(&self) -> Result<()> {
        let conn = self.lock();
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS tasks (
                id TEXT PRIMARY KEY,
                workspace_id TEXT NOT NULL,
                account_id TEXT NOT NULL,
                code TEXT NOT NULL,
                runtime_id TEXT NOT NULL,
                timeout_ms INTEGER NOT NULL,
                metadata TEXT NOT NULL,
                status TEXT NOT NULL,
                queued_at TEXT NOT NULL,
                started_at TEXT,
                completed_at TEXT,
                exit_code INTEGER,
                error TEXT,
                result TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_tasks_status ON tasks(status);
            CREATE INDEX IF NOT EXISTS idx_tasks_workspace ON tasks(workspace_id);

            CREATE TABLE IF NOT EXISTS task_events (
                task_id TEXT NOT NULL,
                seq INTEGER NOT NULL,
                family TEXT NOT NULL,
                event_type TEXT NOT NULL,
                payload TEXT NOT NULL,
                created_at TEXT NOT NULL,
                PRIMARY KEY (task_id, seq)
            );

            CREATE TABLE IF NOT EXISTS approvals (
                id TEXT PRIMARY KEY,
                task_id TEXT NOT NULL,
                tool_path TEXT NOT NULL,
                input TEXT NOT NULL,
                status TEXT NOT NULL,
                reviewer_id TEXT,
                reason TEXT,
                resolved_at TEXT,
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_approvals_task ON approvals(task_id);

            CREATE TABLE IF NOT EXISTS tool_calls (
                task_id TEXT NOT NULL,
                call_id TEXT NOT NULL,
                tool_path TEXT NOT NULL,
                input TEXT NOT NULL,
                status TEXT NOT NULL,
                approval_id TEXT,
                output TEXT,
                error TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                PRIMARY KEY (task_id, call_id)
            );

            CREATE TABLE IF NOT EXISTS tool_sources (
                id TEXT PRIMARY KEY,
                workspace_id TEXT NOT NULL,
                kind TEXT NOT NULL,
                name TEXT NOT NULL,
                config TEXT NOT NULL,
                enabled INTEGER NOT NULL,
                spec_hash TEXT NOT NULL,
                auth_fingerprint TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_sources_workspace ON tool_sources(workspace_id);

            CREATE TABLE IF NOT EXISTS registry_state (
                workspace_id TEXT PRIMARY KEY,
                signature TEXT NOT NULL,
                ready_build_id TEXT,
                building_build_id TEXT,
                building_started_at TEXT,
                source_states TEXT NOT NULL,
                warnings TEXT NOT NULL,
                tool_count INTEGER NOT NULL,
                namespace_count INTEGER NOT NULL,
                types_storage_id TEXT
            );

            CREATE TABLE IF NOT EXISTS registry_entries (
                workspace_id TEXT NOT NULL,
                build_id TEXT NOT NULL,
                path TEXT NOT NULL,
                preferred_path TEXT NOT NULL,
                aliases TEXT NOT NULL,
                namespace TEXT NOT NULL,
                normalized_path TEXT NOT NULL,
                description TEXT NOT NULL,
                approval_mode TEXT NOT NULL,
                source_key TEXT NOT NULL,
                input_hint TEXT,
                output_hint TEXT,
                required_keys TEXT NOT NULL,
                preview_keys TEXT NOT NULL,
                tool TEXT,
                PRIMARY KEY (workspace_id, build_id, path)
            );
            CREATE INDEX IF NOT EXISTS idx_registry_normalized
                ON registry_entries(workspace_id, build_id, normalized_path);

            CREATE TABLE IF NOT EXISTS registry_namespaces (
                workspace_id TEXT NOT NULL,
                build_id TEXT NOT NULL,
                namespace TEXT NOT NULL,
                tool_count INTEGER NOT NULL,
                PRIMARY KEY (workspace_id, build_id, namespace)
            );

            CREATE TABLE IF NOT EXISTS policies (
                id TEXT PRIMARY KEY,
                workspace_id TEXT NOT NULL,
                scope TEXT NOT NULL,
                organization_id TEXT,
                target_account_id TEXT,
                client_id TEXT,
                resource_type TEXT NOT NULL,
                pattern TEXT NOT NULL,
                match_type TEXT NOT NULL,
                effect TEXT NOT NULL,
                approval_mode TEXT NOT NULL,
                argument_conditions TEXT NOT NULL,
                priority INTEGER NOT NULL,
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_policies_workspace ON policies(workspace_id);

            CREATE TABLE IF NOT EXISTS credentials (
                id TEXT PRIMARY KEY,
                scope TEXT NOT NULL,
                workspace_id TEXT NOT NULL,
                account_id TEXT,
                source_key TEXT NOT NULL,
                auth_type TEXT NOT NULL,
                header_name TEXT,
                secret TEXT NOT NULL,
                extra_headers TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS anon_sessions (
                session_id TEXT PRIMARY KEY,
                workspace_id TEXT NOT NULL,
                account_id TEXT NOT NULL,
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS storage_items (
                workspace_id TEXT NOT NULL,
                key TEXT NOT NULL,
                value TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                PRIMARY KEY (workspace_id, key)
            );",
        )?;
        Ok(())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn bump_queue(&self) {
        self.queue_tx.send_modify(|v| *v = v.wrapping_add(1));
    }

    /// Watch-style subscription over the queued-task set. The value bumps on
    /// every write that can change `list_queued_task_ids`, so a subscriber
    /// that re-reads after each change cannot miss an insert.
    pub fn subscribe_queue(&self) -> watch::Receiver<u64> {
        self.queue_tx.subscribe()
    }

    // --- tasks ---

    pub fn create_task(&self, new: NewTask) -> Result<Task> {
        let task = Task {
            id: format!("task_{}", Uuid::new_v4().simple()),
            workspace_id: new.workspace_id,
            account_id: new.account_id,
            code: new.code,
            runtime_id: new.runtime_id,
            timeout_ms: new.timeout_ms,
            metadata: new.metadata,
            status: TaskStatus::Queued,
            queued_at: Utc::now(),
            started_at: None,
            completed_at: None,
            exit_code: None,
            error: None,
            result: None,
        };
        {
            let conn = self.lock();
            conn.execute(
                "INSERT INTO tasks (id, workspace_id, account_id, code, runtime_id, timeout_ms,
                                    metadata, status, queued_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    task.id,
                    task.workspace_id,
                    task.account_id,
                    task.code,
                    task.runtime_id,
                    task.timeout_ms as i64,
                    serde_json::to_string(&task.metadata)?,
                    task.status.as_str(),
                    task.queued_at.to_rfc3339(),
                ],
            )?;
        }
        self.bump_queue();
        Ok(task)
    }

    pub fn get_task(&self, id: &str) -> Result<Option<Task>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT id, workspace_id, account_id, code, runtime_id, timeout_ms, metadata,
                    status, queued_at, started_at, completed_at, exit_code, error, result
             FROM tasks WHERE id = ?1",
        )?;
        let mut rows = stmt.query_map(params![id], task_from_row)?;
        rows.next().transpose().map_err(Into::into)
    }

    pub fn list_tasks(&self, workspace_id: &str, limit: usize) -> Result<Vec<Task>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT id, workspace_id, account_id, code, runtime_id, timeout_ms, metadata,
                    status, queued_at, started_at, completed_at, exit_code, error, result
             FROM tasks WHERE workspace_id = ?1 ORDER BY rowid DESC LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![workspace_id, limit as i64], task_from_row)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Into::into)
    }

    /// Queued task ids in insertion order.
    pub fn list_queued_task_ids(&self, limit: usize) -> Result<Vec<String>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT id FROM tasks WHERE status = 'queued' ORDER BY rowid ASC LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![limit as i64], |row| row.get::<_, String>(0))?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Into::into)
    }

    /// Conditional claim: flips `queued → running` and stamps `started_at`
    /// only if the task is still queued. Returns the claimed task, or `None`
    /// when another worker won. This is the single-writer guarantee.
    pub fn mark_task_running(&self, id: &str) -> Result<Option<Task>> {
        let claimed = {
            let conn = self.lock();
            conn.execute(
                "UPDATE tasks SET status = 'running', started_at = ?2
                 WHERE id = ?1 AND status = 'queued'",
                params![id, Utc::now().to_rfc3339()],
            )? == 1
        };
        self.bump_queue();
        if claimed { self.get_task(id) } else { Ok(None) }
    }

    /// Terminal write. Refuses to touch a task that is already terminal,
    /// which makes terminal states monotonic.
    pub fn finish_task(
        &self,
        id: &str,
        status: TaskStatus,
        exit_code: Option<i64>,
        error: Option<&str>,
        result: Option<&Value>,
    ) -> Result<Option<Task>> {
        debug_assert!(status.is_terminal());
        let finished = {
            let conn = self.lock();
            conn.execute(
                "UPDATE tasks SET status = ?2, completed_at = ?3, exit_code = ?4,
                                  error = ?5, result = ?6
                 WHERE id = ?1 AND status IN ('queued', 'running')",
                params![
                    id,
                    status.as_str(),
                    Utc::now().to_rfc3339(),
                    exit_code,
                    error,
                    result.map(serde_json::to_string).transpose()?,
                ],
            )? == 1
        };
        self.bump_queue();
        if finished { self.get_task(id) } else { Ok(None) }
    }

    // --- events ---

    /// Append one event to a task's journal and publish it to live
    /// listeners. Sequence numbers are allocated under the connection lock,
    /// so they are contiguous and strictly increasing per task.
    pub fn append_event(
        &self,
        task_id: &str,
        family: EventFamily,
        event_type: &str,
        payload: Value,
    ) -> Result<TaskEvent> {
        let event = {
            let conn = self.lock();
            let seq: i64 = conn.query_row(
                "SELECT COALESCE(MAX(seq), 0) + 1 FROM task_events WHERE task_id = ?1",
                params![task_id],
                |row| row.get(0),
            )?;
            let event = TaskEvent {
                task_id: task_id.to_string(),
                seq,
                family,
                event_type: event_type.to_string(),
                payload,
                created_at: Utc::now(),
            };
            conn.execute(
                "INSERT INTO task_events (task_id, seq, family, event_type, payload, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    event.task_id,
                    event.seq,
                    event.family.as_str(),
                    event.event_type,
                    serde_json::to_string(&event.payload)?,
                    event.created_at.to_rfc3339(),
                ],
            )?;
            event
        };
        self.hub.publish(&event);
        Ok(event)
    }

    pub fn list_events(&self, task_id: &str, after_seq: i64) -> Result<Vec<TaskEvent>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT task_id, seq, family, event_type, payload, created_at
             FROM task_events WHERE task_id = ?1 AND seq > ?2 ORDER BY seq ASC",
        )?;
        let rows = stmt.query_map(params![task_id, after_seq], |row| {
            Ok(TaskEvent {
                task_id: row.get(0)?,
                seq: row.get(1)?,
                family: match row.get::<_, String>(2)?.as_str() {
                    "approval" => EventFamily::Approval,
                    _ => EventFamily::Task,
                },
                event_type: row.get(3)?,
                payload: de_json(4, row.get(4)?)?,
                created_at: de_ts(5, row.get(5)?)?,
            })
        })?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Into::into)
    }

    // --- approvals ---

    pub fn create_approval(&self, task_id: &str, tool_path: &str, input: Value) -> Result<Approval> {
        let approval = Approval {
            id: format!("apr_{}", Uuid::new_v4().simple()),
            task_id: task_id.to_string(),
            tool_path: tool_path.to_string(),
            input,
            status: ApprovalStatus::Pending,
            reviewer_id: None,
            reason: None,
            resolved_at: None,
            created_at: Utc::now(),
        };
        let conn = self.lock();
        conn.execute(
            "INSERT INTO approvals (id, task_id, tool_path, input, status, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                approval.id,
                approval.task_id,
                approval.tool_path,
                serde_json::to_string(&approval.input)?,
                approval.status.as_str(),
                approval.created_at.to_rfc3339(),
            ],
        )?;
        Ok(approval)
    }

    pub fn get_approval(&self, id: &str) -> Result<Option<Approval>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT id, task_id, tool_path, input, status, reviewer_id, reason,
                    resolved_at, created_at
             FROM approvals WHERE id = ?1",
        )?;
        let mut rows = stmt.query_map(params![id], approval_from_row)?;
        rows.next().transpose().map_err(Into::into)
    }

    /// Approvals in a workspace, newest first, optionally filtered by
    /// status. Capped at [`MAX_APPROVAL_ROWS`].
    pub fn list_approvals(
        &self,
        workspace_id: &str,
        status: Option<ApprovalStatus>,
    ) -> Result<Vec<Approval>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT a.id, a.task_id, a.tool_path, a.input, a.status, a.reviewer_id, a.reason,
                    a.resolved_at, a.created_at
             FROM approvals a JOIN tasks t ON t.id = a.task_id
             WHERE t.workspace_id = ?1 AND (?2 IS NULL OR a.status = ?2)
             ORDER BY a.rowid DESC LIMIT ?3",
        )?;
        let rows = stmt.query_map(
            params![
                workspace_id,
                status.map(ApprovalStatus::as_str),
                MAX_APPROVAL_ROWS as i64
            ],
            approval_from_row,
        )?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Into::into)
    }

    /// One-shot resolution. Only a pending approval owned by the workspace
    /// (joined through its task) transitions; anything else returns `None`
    /// with no side effect.
    pub fn resolve_approval(
        &self,
        workspace_id: &str,
        approval_id: &str,
        decision: ApprovalStatus,
        reviewer_id: Option<&str>,
        reason: Option<&str>,
    ) -> Result<Option<Approval>> {
        debug_assert!(decision != ApprovalStatus::Pending);
        let resolved = {
            let conn = self.lock();
            conn.execute(
                "UPDATE approvals SET status = ?3, reviewer_id = ?4, reason = ?5, resolved_at = ?6
                 WHERE id = ?2 AND status = 'pending'
                   AND task_id IN (SELECT id FROM tasks WHERE workspace_id = ?1)",
                params![
                    workspace_id,
                    approval_id,
                    decision.as_str(),
                    reviewer_id,
                    reason,
                    Utc::now().to_rfc3339(),
                ],
            )? == 1
        };
        if resolved {
            self.get_approval(approval_id)
        } else {
            Ok(None)
        }
    }

    pub fn pending_approval_count(&self, task_id: &str) -> Result<i64> {
        let conn = self.lock();
        conn.query_row(
            "SELECT COUNT(*) FROM approvals WHERE task_id = ?1 AND status = 'pending'",
            params![task_id],
            |row| row.get(0),
        )
        .map_err(Into::into)
    }

    // --- tool calls ---

    /// Idempotent on `(task_id, call_id)`: returns the existing row when one
    /// is present, along with whether this call created it.
    pub fn upsert_tool_call_requested(
        &self,
        task_id: &str,
        call_id: &str,
        tool_path: &str,
        input: &Value,
    ) -> Result<(ToolCall, bool)> {
        let created = {
            let conn = self.lock();
            conn.execute(
                "INSERT OR IGNORE INTO tool_calls
                    (task_id, call_id, tool_path, input, status, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, 'requested', ?5, ?5)",
                params![
                    task_id,
                    call_id,
                    tool_path,
                    serde_json::to_string(input)?,
                    Utc::now().to_rfc3339(),
                ],
            )? == 1
        };
        let call = self
            .get_tool_call(task_id, call_id)?
            .context("tool call row vanished after upsert")?;
        Ok((call, created))
    }

    pub fn get_tool_call(&self, task_id: &str, call_id: &str) -> Result<Option<ToolCall>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT task_id, call_id, tool_path, input, status, approval_id, output, error,
                    created_at, updated_at
             FROM tool_calls WHERE task_id = ?1 AND call_id = ?2",
        )?;
        let mut rows = stmt.query_map(params![task_id, call_id], tool_call_from_row)?;
        rows.next().transpose().map_err(Into::into)
    }

    /// Link a freshly created approval and park the call.
    pub fn set_tool_call_pending_approval(
        &self,
        task_id: &str,
        call_id: &str,
        approval_id: &str,
    ) -> Result<()> {
        let conn = self.lock();
        conn.execute(
            "UPDATE tool_calls SET status = 'pending_approval', approval_id = ?3, updated_at = ?4
             WHERE task_id = ?1 AND call_id = ?2",
            params![task_id, call_id, approval_id, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    pub fn settle_tool_call(
        &self,
        task_id: &str,
        call_id: &str,
        status: ToolCallStatus,
        output: Option<&Value>,
        error: Option<&str>,
    ) -> Result<()> {
        debug_assert!(status.is_settled());
        let conn = self.lock();
        conn.execute(
            "UPDATE tool_calls SET status = ?3, output = ?4, error = ?5, updated_at = ?6
             WHERE task_id = ?1 AND call_id = ?2",
            params![
                task_id,
                call_id,
                status.as_str(),
                output.map(serde_json::to_string).transpose()?,
                error,
                Utc::now().to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    // --- tool sources ---

    /// Insert or update a source. `spec_hash` and `auth_fingerprint` are
    /// derived from the config here so callers never compute them.
    pub fn upsert_tool_source(
        &self,
        workspace_id: &str,
        id: Option<&str>,
        kind: SourceKind,
        name: &str,
        config: &Value,
        enabled: bool,
    ) -> Result<ToolSource> {
        let now = Utc::now();
        let spec_hash = sha256_hex(&canonical_json(config));
        let auth_fingerprint = sha256_hex(&canonical_json(
            config.get("auth").unwrap_or(&Value::Null),
        ));
        let id = id
            .map(str::to_string)
            .unwrap_or_else(|| format!("src_{}", Uuid::new_v4().simple()));
        {
            let conn = self.lock();
            conn.execute(
                "INSERT INTO tool_sources
                    (id, workspace_id, kind, name, config, enabled, spec_hash,
                     auth_fingerprint, updated_at, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?9)
                 ON CONFLICT(id) DO UPDATE SET
                     kind = excluded.kind,
                     name = excluded.name,
                     config = excluded.config,
                     enabled = excluded.enabled,
                     spec_hash = excluded.spec_hash,
                     auth_fingerprint = excluded.auth_fingerprint,
                     updated_at = excluded.updated_at",
                params![
                    id,
                    workspace_id,
                    kind.as_str(),
                    name,
                    serde_json::to_string(config)?,
                    enabled,
                    spec_hash,
                    auth_fingerprint,
                    now.to_rfc3339(),
                ],
            )?;
        }
        self.get_tool_source(&id)?
            .context("tool source vanished after upsert")
    }

    pub fn get_tool_source(&self, id: &str) -> Result<Option<ToolSource>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT id, workspace_id, kind, name, config, enabled, spec_hash,
                    auth_fingerprint, updated_at, created_at
             FROM tool_sources WHERE id = ?1",
        )?;
        let mut rows = stmt.query_map(params![id], tool_source_from_row)?;
        rows.next().transpose().map_err(Into::into)
    }

    pub fn list_tool_sources(&self, workspace_id: &str, enabled_only: bool) -> Result<Vec<ToolSource>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT id, workspace_id, kind, name, config, enabled, spec_hash,
                    auth_fingerprint, updated_at, created_at
             FROM tool_sources
             WHERE workspace_id = ?1 AND (?2 = 0 OR enabled = 1)
             ORDER BY rowid ASC",
        )?;
        let rows = stmt.query_map(params![workspace_id, enabled_only], tool_source_from_row)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Into::into)
    }

    pub fn delete_tool_source(&self, workspace_id: &str, id: &str) -> Result<bool> {
        let conn = self.lock();
        let deleted = conn.execute(
            "DELETE FROM tool_sources WHERE id = ?1 AND workspace_id = ?2",
            params![id, workspace_id],
        )?;
        Ok(deleted == 1)
    }

    // --- registry ---

    pub fn get_registry_state(&self, workspace_id: &str) -> Result<Option<RegistryState>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT workspace_id, signature, ready_build_id, building_build_id,
                    building_started_at, source_states, warnings, tool_count,
                    namespace_count, types_storage_id
             FROM registry_state WHERE workspace_id = ?1",
        )?;
        let mut rows = stmt.query_map(params![workspace_id], |row| {
            Ok(RegistryState {
                workspace_id: row.get(0)?,
                signature: row.get(1)?,
                ready_build_id: row.get(2)?,
                building_build_id: row.get(3)?,
                building_started_at: row
                    .get::<_, Option<String>>(4)?
                    .map(|s| de_ts(4, s))
                    .transpose()?,
                source_states: de_json_map(5, row.get(5)?)?,
                warnings: de_json_vec(6, row.get(6)?)?,
                tool_count: row.get(7)?,
                namespace_count: row.get(8)?,
                types_storage_id: row.get(9)?,
            })
        })?;
        rows.next().transpose().map_err(Into::into)
    }

    pub fn put_registry_state(&self, state: &RegistryState) -> Result<()> {
        let conn = self.lock();
        conn.execute(
            "INSERT OR REPLACE INTO registry_state
                (workspace_id, signature, ready_build_id, building_build_id,
                 building_started_at, source_states, warnings, tool_count,
                 namespace_count, types_storage_id)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                state.workspace_id,
                state.signature,
                state.ready_build_id,
                state.building_build_id,
                state.building_started_at.map(|t| t.to_rfc3339()),
                serde_json::to_string(&state.source_states)?,
                serde_json::to_string(&state.warnings)?,
                state.tool_count,
                state.namespace_count,
                state.types_storage_id,
            ],
        )?;
        Ok(())
    }

    /// Write one batch of entries. Callers chunk to [`REGISTRY_WRITE_BATCH`].
    pub fn insert_registry_entries(&self, entries: &[RegistryEntry]) -> Result<()> {
        debug_assert!(entries.len() <= REGISTRY_WRITE_BATCH);
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        for e in entries {
            tx.execute(
                "INSERT OR REPLACE INTO registry_entries
                    (workspace_id, build_id, path, preferred_path, aliases, namespace,
                     normalized_path, description, approval_mode, source_key, input_hint,
                     output_hint, required_keys, preview_keys, tool)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)",
                params![
                    e.workspace_id,
                    e.build_id,
                    e.path,
                    e.preferred_path,
                    serde_json::to_string(&e.aliases)?,
                    e.namespace,
                    e.normalized_path,
                    e.description,
                    e.approval_mode.as_str(),
                    e.source_key,
                    e.input_hint,
                    e.output_hint,
                    serde_json::to_string(&e.required_keys)?,
                    serde_json::to_string(&e.preview_keys)?,
                    e.tool.as_ref().map(serde_json::to_string).transpose()?,
                ],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    pub fn insert_registry_namespaces(&self, namespaces: &[RegistryNamespace]) -> Result<()> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        for n in namespaces {
            tx.execute(
                "INSERT OR REPLACE INTO registry_namespaces
                    (workspace_id, build_id, namespace, tool_count)
                 VALUES (?1, ?2, ?3, ?4)",
                params![n.workspace_id, n.build_id, n.namespace, n.tool_count],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    pub fn list_registry_entries(
        &self,
        workspace_id: &str,
        build_id: &str,
    ) -> Result<Vec<RegistryEntry>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {REGISTRY_COLS} FROM registry_entries
             WHERE workspace_id = ?1 AND build_id = ?2 ORDER BY path ASC"
        ))?;
        let rows = stmt.query_map(params![workspace_id, build_id], registry_entry_from_row)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Into::into)
    }

    pub fn get_registry_entry(
        &self,
        workspace_id: &str,
        build_id: &str,
        path: &str,
    ) -> Result<Option<RegistryEntry>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {REGISTRY_COLS} FROM registry_entries
             WHERE workspace_id = ?1 AND build_id = ?2 AND path = ?3"
        ))?;
        let mut rows = stmt.query_map(params![workspace_id, build_id, path], registry_entry_from_row)?;
        rows.next().transpose().map_err(Into::into)
    }

    pub fn find_registry_entries_normalized(
        &self,
        workspace_id: &str,
        build_id: &str,
        normalized_path: &str,
    ) -> Result<Vec<RegistryEntry>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {REGISTRY_COLS} FROM registry_entries
             WHERE workspace_id = ?1 AND build_id = ?2 AND normalized_path = ?3
             ORDER BY path ASC"
        ))?;
        let rows = stmt.query_map(
            params![workspace_id, build_id, normalized_path],
            registry_entry_from_row,
        )?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Into::into)
    }

    pub fn list_registry_namespaces(
        &self,
        workspace_id: &str,
        build_id: &str,
    ) -> Result<Vec<RegistryNamespace>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT workspace_id, build_id, namespace, tool_count
             FROM registry_namespaces
             WHERE workspace_id = ?1 AND build_id = ?2 ORDER BY namespace ASC",
        )?;
        let rows = stmt.query_map(params![workspace_id, build_id], |row| {
            Ok(RegistryNamespace {
                workspace_id: row.get(0)?,
                build_id: row.get(1)?,
                namespace: row.get(2)?,
                tool_count: row.get(3)?,
            })
        })?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Into::into)
    }

    /// Delete rows for all builds except the given ones.
    pub fn prune_registry_builds(&self, workspace_id: &str, keep: &[String]) -> Result<usize> {
        let conn = self.lock();
        let keep_json = serde_json::to_string(keep)?;
        let removed = conn.execute(
            "DELETE FROM registry_entries
             WHERE workspace_id = ?1
               AND build_id NOT IN (SELECT value FROM json_each(?2))",
            params![workspace_id, keep_json],
        )?;
        conn.execute(
            "DELETE FROM registry_namespaces
             WHERE workspace_id = ?1
               AND build_id NOT IN (SELECT value FROM json_each(?2))",
            params![workspace_id, keep_json],
        )?;
        Ok(removed)
    }

    /// Distinct build ids present for a workspace. Test and pruning hook.
    pub fn list_registry_build_ids(&self, workspace_id: &str) -> Result<Vec<String>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT DISTINCT build_id FROM registry_entries WHERE workspace_id = ?1",
        )?;
        let rows = stmt.query_map(params![workspace_id], |row| row.get::<_, String>(0))?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Into::into)
    }

    // --- policies ---

    pub fn upsert_policy(&self, policy: &AccessPolicy) -> Result<AccessPolicy> {
        {
            let conn = self.lock();
            conn.execute(
                "INSERT INTO policies
                    (id, workspace_id, scope, organization_id, target_account_id, client_id,
                     resource_type, pattern, match_type, effect, approval_mode,
                     argument_conditions, priority, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)
                 ON CONFLICT(id) DO UPDATE SET
                     scope = excluded.scope,
                     organization_id = excluded.organization_id,
                     target_account_id = excluded.target_account_id,
                     client_id = excluded.client_id,
                     resource_type = excluded.resource_type,
                     pattern = excluded.pattern,
                     match_type = excluded.match_type,
                     effect = excluded.effect,
                     approval_mode = excluded.approval_mode,
                     argument_conditions = excluded.argument_conditions,
                     priority = excluded.priority",
                params![
                    policy.id,
                    policy.workspace_id,
                    policy.scope.as_str(),
                    policy.organization_id,
                    policy.target_account_id,
                    policy.client_id,
                    policy.resource_type.as_str(),
                    policy.pattern,
                    match policy.match_type {
                        MatchType::Exact => "exact",
                        MatchType::Glob => "glob",
                    },
                    match policy.effect {
                        PolicyEffect::Allow => "allow",
                        PolicyEffect::Deny => "deny",
                    },
                    policy.approval_mode.as_str(),
                    serde_json::to_string(&policy.argument_conditions)?,
                    policy.priority,
                    Utc::now().to_rfc3339(),
                ],
            )?;
        }
        let policies = self.list_policies(&policy.workspace_id)?;
        policies
            .into_iter()
            .find(|p| p.id == policy.id)
            .context("policy vanished after upsert")
    }

    /// Policies for a workspace in creation order; `created_order` carries
    /// the rowid for deterministic tie-breaking at decision time.
    pub fn list_policies(&self, workspace_id: &str) -> Result<Vec<AccessPolicy>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT id, workspace_id, scope, organization_id, target_account_id, client_id,
                    resource_type, pattern, match_type, effect, approval_mode,
                    argument_conditions, priority, rowid
             FROM policies WHERE workspace_id = ?1 ORDER BY rowid ASC",
        )?;
        let rows = stmt.query_map(params![workspace_id], policy_from_row)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Into::into)
    }

    // --- credentials ---

    pub fn upsert_credential(&self, record: &CredentialRecord) -> Result<()> {
        let conn = self.lock();
        conn.execute(
            "INSERT OR REPLACE INTO credentials
                (id, scope, workspace_id, account_id, source_key, auth_type, header_name,
                 secret, extra_headers, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                record.id,
                record.scope.as_str(),
                record.workspace_id,
                record.account_id,
                record.source_key,
                record.auth_type.as_str(),
                record.header_name,
                serde_json::to_string(&record.secret_json)?,
                serde_json::to_string(&record.extra_headers)?,
                Utc::now().to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub fn list_credentials(&self, workspace_id: &str) -> Result<Vec<CredentialRecord>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT id, scope, workspace_id, account_id, source_key, auth_type, header_name,
                    secret, extra_headers, updated_at
             FROM credentials WHERE workspace_id = ?1 ORDER BY rowid ASC",
        )?;
        let rows = stmt.query_map(params![workspace_id], credential_from_row)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Into::into)
    }

    // --- anonymous sessions ---

    /// Return the workspace/account pair for a session id, minting one on
    /// first sight. Idempotent per session id. A missing session id mints a
    /// throwaway pair without persisting it.
    pub fn anon_bootstrap(&self, session_id: Option<&str>) -> Result<(String, String)> {
        let Some(session_id) = session_id else {
            return Ok((
                format!("ws_{}", Uuid::new_v4().simple()),
                format!("acct_{}", Uuid::new_v4().simple()),
            ));
        };
        let conn = self.lock();
        let existing = conn
            .query_row(
                "SELECT workspace_id, account_id FROM anon_sessions WHERE session_id = ?1",
                params![session_id],
                |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)),
            )
            .ok();
        if let Some(pair) = existing {
            return Ok(pair);
        }
        let pair = (
            format!("ws_{}", Uuid::new_v4().simple()),
            format!("acct_{}", Uuid::new_v4().simple()),
        );
        conn.execute(
            "INSERT OR IGNORE INTO anon_sessions (session_id, workspace_id, account_id, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![session_id, pair.0, pair.1, Utc::now().to_rfc3339()],
        )?;
        // Re-read in case a concurrent bootstrap won the insert race.
        conn.query_row(
            "SELECT workspace_id, account_id FROM anon_sessions WHERE session_id = ?1",
            params![session_id],
            |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)),
        )
        .map_err(Into::into)
    }

    // --- workspace storage ---

    pub fn storage_put(&self, workspace_id: &str, key: &str, value: &Value) -> Result<()> {
        let conn = self.lock();
        conn.execute(
            "INSERT OR REPLACE INTO storage_items (workspace_id, key, value, updated_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                workspace_id,
                key,
                serde_json::to_string(value)?,
                Utc::now().to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub fn storage_get(&self, workspace_id: &str, key: &str) -> Result<Option<Value>> {
        let conn = self.lock();
        let raw: Option<String> = conn
            .query_row(
                "SELECT value FROM storage_items WHERE workspace_id = ?1 AND key = ?2",
                params![workspace_id, key],
                |row| row.get(0),
            )
            .ok();
        raw.map(|s| serde_json::from_str(&s).context("corrupt storage value"))
            .transpose()
    }

    pub fn storage_list(&self, workspace_id: &str) -> Result<Vec<String>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT key FROM storage_items WHERE workspace_id = ?1 ORDER BY key ASC",
        )?;
        let rows = stmt.query_map(params![workspace_id], |row| row.get::<_, String>(0))?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Into::into)
    }
}

const REGISTRY_COLS: &str = "workspace_id, build_id, path, preferred_path, aliases, namespace, \
     normalized_path, description, approval_mode, source_key, input_hint, output_hint, \
     required_keys, preview_keys, tool";

// --- row mapping ---

fn de_json(idx: usize, s: String) -> rusqlite::Result<Value> {
    serde_json::from_str(&s).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
    })
}

fn de_json_map(idx: usize, s: String) -> rusqlite::Result<HashMap<String, String>> {
    serde_json::from_str(&s).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
    })
}

fn de_json_vec(idx: usize, s: String) -> rusqlite::Result<Vec<String>> {
    serde_json::from_str(&s).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
    })
}

fn de_ts(idx: usize, s: String) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(&s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
        })
}

fn bad_enum(idx: usize, what: &str, value: &str) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        idx,
        rusqlite::types::Type::Text,
        format!("unknown {}: {}", what, value).into(),
    )
}

fn task_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Task> {
    let status_raw: String = row.get(7)?;
    let metadata: HashMap<String, Value> = serde_json::from_str(&row.get::<_, String>(6)?)
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(6, rusqlite::types::Type::Text, Box::new(e))
        })?;
    Ok(Task {
        id: row.get(0)?,
        workspace_id: row.get(1)?,
        account_id: row.get(2)?,
        code: row.get(3)?,
        runtime_id: row.get(4)?,
        timeout_ms: row.get::<_, i64>(5)? as u64,
        metadata,
        status: TaskStatus::from_str(&status_raw)
            .ok_or_else(|| bad_enum(7, "task status", &status_raw))?,
        queued_at: de_ts(8, row.get(8)?)?,
        started_at: row.get::<_, Option<String>>(9)?.map(|s| de_ts(9, s)).transpose()?,
        completed_at: row
            .get::<_, Option<String>>(10)?
            .map(|s| de_ts(10, s))
            .transpose()?,
        exit_code: row.get(11)?,
        error: row.get(12)?,
        result: row
            .get::<_, Option<String>>(13)?
            .map(|s| de_json(13, s))
            .transpose()?,
    })
}

fn approval_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Approval> {
    let status_raw: String = row.get(4)?;
    Ok(Approval {
        id: row.get(0)?,
        task_id: row.get(1)?,
        tool_path: row.get(2)?,
        input: de_json(3, row.get(3)?)?,
        status: ApprovalStatus::from_str(&status_raw)
            .ok_or_else(|| bad_enum(4, "approval status", &status_raw))?,
        reviewer_id: row.get(5)?,
        reason: row.get(6)?,
        resolved_at: row
            .get::<_, Option<String>>(7)?
            .map(|s| de_ts(7, s))
            .transpose()?,
        created_at: de_ts(8, row.get(8)?)?,
    })
}

fn tool_call_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ToolCall> {
    let status_raw: String = row.get(4)?;
    Ok(ToolCall {
        task_id: row.get(0)?,
        call_id: row.get(1)?,
        tool_path: row.get(2)?,
        input: de_json(3, row.get(3)?)?,
        status: ToolCallStatus::from_str(&status_raw)
            .ok_or_else(|| bad_enum(4, "tool call status", &status_raw))?,
        approval_id: row.get(5)?,
        output: row
            .get::<_, Option<String>>(6)?
            .map(|s| de_json(6, s))
            .transpose()?,
        error: row.get(7)?,
        created_at: de_ts(8, row.get(8)?)?,
        updated_at: de_ts(9, row.get(9)?)?,
    })
}

fn tool_source_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ToolSource> {
    let kind_raw: String = row.get(2)?;
    Ok(ToolSource {
        id: row.get(0)?,
        workspace_id: row.get(1)?,
        kind: SourceKind::from_str(&kind_raw).ok_or_else(|| bad_enum(2, "source kind", &kind_raw))?,
        name: row.get(3)?,
        config: de_json(4, row.get(4)?)?,
        enabled: row.get(5)?,
        spec_hash: row.get(6)?,
        auth_fingerprint: row.get(7)?,
        updated_at: de_ts(8, row.get(8)?)?,
        created_at: de_ts(9, row.get(9)?)?,
    })
}

fn registry_entry_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RegistryEntry> {
    let approval_raw: String = row.get(8)?;
    Ok(RegistryEntry {
        workspace_id: row.get(0)?,
        build_id: row.get(1)?,
        path: row.get(2)?,
        preferred_path: row.get(3)?,
        aliases: de_json_vec(4, row.get(4)?)?,
        namespace: row.get(5)?,
        normalized_path: row.get(6)?,
        description: row.get(7)?,
        approval_mode: ApprovalMode::from_str(&approval_raw)
            .ok_or_else(|| bad_enum(8, "approval mode", &approval_raw))?,
        source_key: row.get(9)?,
        input_hint: row.get(10)?,
        output_hint: row.get(11)?,
        required_keys: de_json_vec(12, row.get(12)?)?,
        preview_keys: de_json_vec(13, row.get(13)?)?,
        tool: row
            .get::<_, Option<String>>(14)?
            .map(|s| de_json(14, s))
            .transpose()?,
    })
}

fn policy_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<AccessPolicy> {
    let scope_raw: String = row.get(2)?;
    let resource_raw: String = row.get(6)?;
    let match_raw: String = row.get(8)?;
    let effect_raw: String = row.get(9)?;
    let approval_raw: String = row.get(10)?;
    let conditions: Vec<types::ArgumentCondition> = serde_json::from_str(&row.get::<_, String>(11)?)
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(11, rusqlite::types::Type::Text, Box::new(e))
        })?;
    Ok(AccessPolicy {
        id: row.get(0)?,
        workspace_id: row.get(1)?,
        scope: PolicyScope::from_str(&scope_raw)
            .ok_or_else(|| bad_enum(2, "policy scope", &scope_raw))?,
        organization_id: row.get(3)?,
        target_account_id: row.get(4)?,
        client_id: row.get(5)?,
        resource_type: ResourceType::from_str(&resource_raw)
            .ok_or_else(|| bad_enum(6, "resource type", &resource_raw))?,
        pattern: row.get(7)?,
        match_type: match match_raw.as_str() {
            "exact" => MatchType::Exact,
            "glob" => MatchType::Glob,
            other => return Err(bad_enum(8, "match type", other)),
        },
        effect: match effect_raw.as_str() {
            "allow" => PolicyEffect::Allow,
            "deny" => PolicyEffect::Deny,
            other => return Err(bad_enum(9, "policy effect", other)),
        },
        approval_mode: ApprovalMode::from_str(&approval_raw)
            .ok_or_else(|| bad_enum(10, "approval mode", &approval_raw))?,
        argument_conditions: conditions,
        priority: row.get(12)?,
        created_order: row.get(13)?,
    })
}

fn credential_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<CredentialRecord> {
    let scope_raw: String = row.get(1)?;
    let auth_raw: String = row.get(5)?;
    let extra: HashMap<String, String> = serde_json::from_str(&row.get::<_, String>(8)?)
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(8, rusqlite::types::Type::Text, Box::new(e))
        })?;
    Ok(CredentialRecord {
        id: row.get(0)?,
        scope: PolicyScope::from_str(&scope_raw)
            .ok_or_else(|| bad_enum(1, "credential scope", &scope_raw))?,
        workspace_id: row.get(2)?,
        account_id: row.get(3)?,
        source_key: row.get(4)?,
        auth_type: AuthType::from_str(&auth_raw)
            .ok_or_else(|| bad_enum(5, "auth type", &auth_raw))?,
        header_name: row.get(6)?,
        secret_json: de_json(7, row.get(7)?)?,
        extra_headers: extra,
        updated_at: de_ts(9, row.get(9)?)?,
    })
}

// --- hashing ---

/// Canonical JSON with object keys sorted recursively; makes spec hashes
/// stable regardless of key insertion order.
pub fn canonical_json(value: &Value) -> String {
    fn canonical_value(value: &Value) -> Value {
        match value {
            Value::Object(map) => {
                let sorted: std::collections::BTreeMap<&String, Value> =
                    map.iter().map(|(k, v)| (k, canonical_value(v))).collect();
                Value::Object(sorted.into_iter().map(|(k, v)| (k.clone(), v)).collect())
            }
            Value::Array(arr) => Value::Array(arr.iter().map(canonical_value).collect()),
            other => other.clone(),
        }
    }
    serde_json::to_string(&canonical_value(value)).unwrap_or_default()
}

pub fn sha256_hex(input: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    hex::encode(hasher.finalize())
}
