pub mod index;

use crate::errors::ExecutorError;
use crate::sources::ToolExecutor;
use crate::store::{REGISTRY_WRITE_BATCH, Repository};
use crate::store::types::{RegistryEntry, RegistryNamespace, RegistryState, ToolSource};
use anyhow::Result;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use uuid::Uuid;

/// Bump to force a global rebuild after an index format change.
const SIGNATURE_VERSION_PREFIX: &str = "toolreg_v6|";

/// A build claimed longer than this with no commit is considered abandoned
/// and may be superseded by a new claim.
const BUILD_ABANDON_THRESHOLD: Duration = Duration::from_secs(120);

/// How readers wait on a build another worker already claimed.
const BUILD_WAIT_POLL: Duration = Duration::from_millis(100);
const BUILD_WAIT_LIMIT: Duration = Duration::from_secs(30);

/// Observable registry condition for one workspace.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistryStatus {
    Ready,
    Building,
    Stale,
    Failed,
}

/// Outcome of resolving a requested tool path against the catalog.
#[derive(Debug)]
pub enum Resolution {
    Found(RegistryEntry),
    /// No entry; nearest neighbors for the error message.
    Unknown { suggestions: Vec<String> },
}

/// Compiles a workspace's enabled tool sources into a versioned catalog.
pub struct ToolRegistry {
    repo: Arc<Repository>,
    executor: ToolExecutor,
}

impl ToolRegistry {
    pub fn new(repo: Arc<Repository>, executor: ToolExecutor) -> Self {
        Self { repo, executor }
    }

    /// The signature of an enabled-source set. Identical sets (same ids and
    /// `updated_at` values) always produce identical signatures.
    pub fn signature(sources: &[ToolSource]) -> String {
        let mut parts: Vec<String> = sources
            .iter()
            .filter(|s| s.enabled)
            .map(|s| format!("{}:{}:1", s.id, s.updated_at.to_rfc3339()))
            .collect();
        parts.sort();
        format!("{}{}", SIGNATURE_VERSION_PREFIX, parts.join(","))
    }

    pub fn current_signature(&self, workspace_id: &str) -> Result<String> {
        let sources = self.repo.list_tool_sources(workspace_id, true)?;
        Ok(Self::signature(&sources))
    }

    /// Classify a stored state against the current enabled-source set.
    pub fn status(state: &RegistryState, current_signature: &str) -> RegistryStatus {
        if let (Some(_), Some(started)) = (&state.building_build_id, state.building_started_at) {
            let age = Utc::now().signed_duration_since(started);
            if age.to_std().map(|d| d < BUILD_ABANDON_THRESHOLD).unwrap_or(false) {
                return RegistryStatus::Building;
            }
            // Abandoned claim: fall through to staleness classification.
        }
        if state.signature != current_signature || state.ready_build_id.is_none() {
            if state.ready_build_id.is_none() && !state.warnings.is_empty() {
                return RegistryStatus::Failed;
            }
            return RegistryStatus::Stale;
        }
        RegistryStatus::Ready
    }

    /// The ready build id for reads, or a typed "not ready" error. Reads are
    /// valid only when the stored signature matches the current sources.
    pub fn ready_build_id(&self, workspace_id: &str) -> Result<String, ExecutorError> {
        let current = self
            .current_signature(workspace_id)
            .map_err(ExecutorError::Internal)?;
        let state = self
            .repo
            .get_registry_state(workspace_id)
            .map_err(ExecutorError::Internal)?;
        match state {
            Some(state)
                if Self::status(&state, &current) == RegistryStatus::Ready =>
            {
                Ok(state.ready_build_id.expect("ready status implies a build id"))
            }
            _ => Err(ExecutorError::RegistryNotReady {
                workspace_id: workspace_id.to_string(),
            }),
        }
    }

    /// Return a usable state, rebuilding if the catalog is stale or absent.
    /// A build already claimed by another worker is waited on rather than
    /// raced.
    pub async fn ensure_ready(&self, workspace_id: &str) -> Result<RegistryState> {
        let mut waited = Duration::ZERO;
        loop {
            let current = self.current_signature(workspace_id)?;
            if let Some(state) = self.repo.get_registry_state(workspace_id)? {
                match Self::status(&state, &current) {
                    RegistryStatus::Ready => return Ok(state),
                    RegistryStatus::Building if waited < BUILD_WAIT_LIMIT => {
                        tokio::time::sleep(BUILD_WAIT_POLL).await;
                        waited += BUILD_WAIT_POLL;
                        continue;
                    }
                    _ => {}
                }
            }
            return self.rebuild(workspace_id).await;
        }
    }

    /// Compile the enabled sources into a new build and flip `ready_build_id`
    /// atomically with the commit. Incomplete builds stay invisible; a
    /// failed build keeps the prior ready build if one exists.
    pub async fn rebuild(&self, workspace_id: &str) -> Result<RegistryState> {
        let sources = self.repo.list_tool_sources(workspace_id, true)?;
        let signature = Self::signature(&sources);

        // Claim the build, respecting a live claim from another worker.
        let prior = self.repo.get_registry_state(workspace_id)?;
        if let Some(prior) = &prior {
            if let (Some(_), Some(started)) = (&prior.building_build_id, prior.building_started_at)
            {
                let age = Utc::now().signed_duration_since(started);
                if age.to_std().map(|d| d < BUILD_ABANDON_THRESHOLD).unwrap_or(false) {
                    info!(
                        "registry build already in progress for {} (claimed {}s ago)",
                        workspace_id,
                        age.num_seconds()
                    );
                    return Ok(prior.clone());
                }
                warn!(
                    "superseding abandoned registry build {} for {}",
                    prior.building_build_id.as_deref().unwrap_or("?"),
                    workspace_id
                );
            }
        }

        let build_id = Uuid::new_v4().to_string();
        let prior_ready = prior.as_ref().and_then(|s| s.ready_build_id.clone());
        let mut state = RegistryState {
            workspace_id: workspace_id.to_string(),
            signature: signature.clone(),
            ready_build_id: prior_ready.clone(),
            building_build_id: Some(build_id.clone()),
            building_started_at: Some(Utc::now()),
            source_states: HashMap::new(),
            warnings: Vec::new(),
            tool_count: 0,
            namespace_count: 0,
            types_storage_id: prior.as_ref().and_then(|s| s.types_storage_id.clone()),
        };
        self.repo.put_registry_state(&state)?;

        // Scan every enabled source; loaders degrade to warnings.
        let mut entries: Vec<RegistryEntry> = Vec::new();
        let mut seen_paths: HashMap<String, String> = HashMap::new();
        for source in &sources {
            let outcome = self.executor.load_source(source).await;
            let loaded = outcome.tools.len();
            state.source_states.insert(
                source.id.clone(),
                if outcome.warnings.is_empty() {
                    format!("ok:{}", loaded)
                } else {
                    format!("warn:{}", loaded)
                },
            );
            state.warnings.extend(outcome.warnings);

            for tool in &outcome.tools {
                if let Some(owner) = seen_paths.get(&tool.path) {
                    state.warnings.push(format!(
                        "path collision: {} from {} shadowed by {}",
                        tool.path,
                        source.source_key(),
                        owner
                    ));
                    continue;
                }
                seen_paths.insert(tool.path.clone(), tool.source_key.clone());
                entries.push(index::entry_from_tool(workspace_id, &build_id, tool));
            }
        }

        // Stage entries in bounded batches; readers cannot see them until
        // the state commit below.
        for chunk in entries.chunks(REGISTRY_WRITE_BATCH) {
            self.repo.insert_registry_entries(chunk)?;
        }

        let mut namespace_counts: HashMap<String, i64> = HashMap::new();
        for entry in &entries {
            *namespace_counts.entry(entry.namespace.clone()).or_default() += 1;
        }
        let namespaces: Vec<RegistryNamespace> = namespace_counts
            .iter()
            .map(|(namespace, count)| RegistryNamespace {
                workspace_id: workspace_id.to_string(),
                build_id: build_id.clone(),
                namespace: namespace.clone(),
                tool_count: *count,
            })
            .collect();
        self.repo.insert_registry_namespaces(&namespaces)?;

        // Commit: the ready flip and bookkeeping land in one state write.
        state.ready_build_id = Some(build_id.clone());
        state.building_build_id = None;
        state.building_started_at = None;
        state.tool_count = entries.len() as i64;
        state.namespace_count = namespaces.len() as i64;
        state.types_storage_id = Some(build_id.clone());
        self.repo.put_registry_state(&state)?;

        // Retain at most two builds: the new one and the one it replaced.
        let mut keep = vec![build_id.clone()];
        if let Some(prior_ready) = prior_ready {
            keep.push(prior_ready);
        }
        self.repo.prune_registry_builds(workspace_id, &keep)?;

        info!(
            "registry build {} committed for {}: {} tools, {} namespaces, {} warnings",
            build_id,
            workspace_id,
            state.tool_count,
            state.namespace_count,
            state.warnings.len()
        );
        Ok(state)
    }

    /// Resolve a requested path in the ready build: exact match first, then
    /// the normalized form. Multiple normalized matches prefer the entry
    /// whose preferred form equals the request, then the shortest canonical
    /// path, then lexicographic order.
    pub fn resolve(&self, workspace_id: &str, requested: &str) -> Result<Resolution, ExecutorError> {
        let build_id = self.ready_build_id(workspace_id)?;

        if let Some(entry) = self
            .repo
            .get_registry_entry(workspace_id, &build_id, requested)
            .map_err(ExecutorError::Internal)?
        {
            return Ok(Resolution::Found(entry));
        }

        let normalized = index::normalize_path(requested);
        let mut matches = self
            .repo
            .find_registry_entries_normalized(workspace_id, &build_id, &normalized)
            .map_err(ExecutorError::Internal)?;

        // Aliases share the entry's normalized form, so alias hits land here.
        if !matches.is_empty() {
            matches.sort_by(|a, b| {
                let a_preferred = a.preferred_path == requested;
                let b_preferred = b.preferred_path == requested;
                b_preferred
                    .cmp(&a_preferred)
                    .then_with(|| a.path.len().cmp(&b.path.len()))
                    .then_with(|| a.path.cmp(&b.path))
            });
            return Ok(Resolution::Found(matches.remove(0)));
        }

        let entries = self
            .repo
            .list_registry_entries(workspace_id, &build_id)
            .map_err(ExecutorError::Internal)?;
        let suggestions = index::suggest(requested, entries.iter().map(|e| e.path.as_str()));
        Ok(Resolution::Unknown { suggestions })
    }
}
