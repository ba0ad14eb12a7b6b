use crate::store::types::SourceKind;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;
use uuid::Uuid;

const DEFAULT_PORT: u16 = 3011;
const DEFAULT_WORKER_POLL_MS: u64 = 2000;
const DEFAULT_WORKER_BATCH_SIZE: usize = 4;
const DEFAULT_REPOSITORY_URL: &str = "codeplane.db";

/// A tool source seeded from `EXECUTOR_TOOL_SOURCES` at startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolSourceSeed {
    #[serde(rename = "type")]
    pub kind: SourceKind,
    pub name: String,
    pub config: Value,
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Workspace to seed into; omitted seeds land in the default workspace.
    #[serde(default)]
    pub workspace_id: Option<String>,
}

fn default_true() -> bool {
    true
}

/// Process configuration, resolved from the environment once at startup.
#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    /// Base URL sandboxes use to reach the internal bridge endpoints.
    pub internal_base_url: String,
    pub public_base_url: Option<String>,
    /// Shared secret for `/internal/*`. Generated per process when unset.
    pub internal_token: String,
    pub auto_tailscale_funnel: bool,
    pub tool_sources: Vec<ToolSourceSeed>,
    /// Run the scheduler inside the server process.
    pub server_auto_execute: bool,
    /// Sandbox runtime variant id exposed in `/api/runtime-targets`.
    pub sandbox_runtime_variant: Option<String>,
    pub worker_poll_ms: u64,
    pub worker_batch_size: usize,
    /// SQLite path backing the repository.
    pub repository_url: String,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let port = match std::env::var("PORT") {
            Ok(raw) => raw
                .parse::<u16>()
                .with_context(|| format!("PORT is not a valid port number: {}", raw))?,
            Err(_) => DEFAULT_PORT,
        };

        let internal_token = std::env::var("EXECUTOR_INTERNAL_TOKEN")
            .ok()
            .filter(|t| !t.is_empty())
            .unwrap_or_else(|| {
                let token = Uuid::new_v4().simple().to_string();
                warn!("EXECUTOR_INTERNAL_TOKEN not set; generated an ephemeral token");
                token
            });

        let internal_base_url = std::env::var("EXECUTOR_INTERNAL_BASE_URL")
            .ok()
            .filter(|u| !u.is_empty())
            .unwrap_or_else(|| format!("http://127.0.0.1:{}", port));

        let tool_sources = match std::env::var("EXECUTOR_TOOL_SOURCES") {
            Ok(raw) if !raw.trim().is_empty() => serde_json::from_str(&raw)
                .context("EXECUTOR_TOOL_SOURCES is not a valid JSON array of source configs")?,
            _ => Vec::new(),
        };

        Ok(Self {
            port,
            internal_base_url,
            public_base_url: std::env::var("EXECUTOR_PUBLIC_BASE_URL")
                .ok()
                .filter(|u| !u.is_empty()),
            internal_token,
            auto_tailscale_funnel: env_flag("EXECUTOR_AUTO_TAILSCALE_FUNNEL", false),
            tool_sources,
            server_auto_execute: env_flag("EXECUTOR_SERVER_AUTO_EXECUTE", true),
            sandbox_runtime_variant: std::env::var("EXECUTOR_VERCEL_SANDBOX_RUNTIME")
                .ok()
                .filter(|v| !v.is_empty()),
            worker_poll_ms: env_number("EXECUTOR_WORKER_POLL_MS", DEFAULT_WORKER_POLL_MS),
            worker_batch_size: env_number("EXECUTOR_WORKER_BATCH_SIZE", DEFAULT_WORKER_BATCH_SIZE),
            repository_url: std::env::var("EXECUTOR_REPOSITORY_URL")
                .ok()
                .filter(|u| !u.is_empty())
                .unwrap_or_else(|| DEFAULT_REPOSITORY_URL.to_string()),
        })
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            internal_base_url: format!("http://127.0.0.1:{}", DEFAULT_PORT),
            public_base_url: None,
            internal_token: Uuid::new_v4().simple().to_string(),
            auto_tailscale_funnel: false,
            tool_sources: Vec::new(),
            server_auto_execute: true,
            sandbox_runtime_variant: None,
            worker_poll_ms: DEFAULT_WORKER_POLL_MS,
            worker_batch_size: DEFAULT_WORKER_BATCH_SIZE,
            repository_url: DEFAULT_REPOSITORY_URL.to_string(),
        }
    }
}

/// `"0"`, `"false"`, and `"no"` disable; anything else set enables.
fn env_flag(name: &str, default: bool) -> bool {
    match std::env::var(name) {
        Ok(raw) => !matches!(raw.trim(), "0" | "false" | "no"),
        Err(_) => default,
    }
}

fn env_number<T: std::str::FromStr + Copy>(name: &str, default: T) -> T {
    match std::env::var(name) {
        Ok(raw) => raw.trim().parse().unwrap_or_else(|_| {
            warn!("{} is not a number: {:?}; using default", name, raw);
            default
        }),
        Err(_) => default,
    }
}

#[cfg(test)]
mod tests;
