use crate::approvals::ApprovalCoordinator;
use crate::config::Config;
use crate::gateway::{self, AppState};
use crate::hub::EventHub;
use crate::invoke::InvocationPipeline;
use crate::registry::ToolRegistry;
use crate::runtime::sandbox::SandboxRuntime;
use crate::runtime::{LocalEchoRuntime, RuntimeRegistry};
use crate::scheduler::TaskScheduler;
use crate::sources::ToolExecutor;
use crate::store::Repository;
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Workspace that `EXECUTOR_TOOL_SOURCES` seeds land in when they name none.
const DEFAULT_SEED_WORKSPACE: &str = "ws_default";

#[derive(Parser)]
#[command(name = "codeplane", version = crate::VERSION, about = "Code-execution control plane")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the gateway (and, unless disabled, the task scheduler).
    Serve {
        /// Override the PORT environment variable.
        #[arg(long)]
        port: Option<u16>,
    },
}

pub async fn run() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Some(Command::Serve { port }) => serve(port).await,
        None => serve(None).await,
    }
}

async fn serve(port_override: Option<u16>) -> Result<()> {
    let mut config = Config::from_env()?;
    if let Some(port) = port_override {
        config.port = port;
        config.internal_base_url = format!("http://127.0.0.1:{}", port);
    }
    if config.auto_tailscale_funnel {
        // Funnel automation is provisioned outside this process.
        info!("EXECUTOR_AUTO_TAILSCALE_FUNNEL is set; expecting an external funnel");
    }

    let hub = Arc::new(EventHub::new());
    let repo = Arc::new(
        Repository::open(&config.repository_url, hub)
            .with_context(|| format!("failed to open repository {}", config.repository_url))?,
    );
    let executor = ToolExecutor::new();
    let registry = Arc::new(ToolRegistry::new(repo.clone(), executor.clone()));
    let pipeline = Arc::new(InvocationPipeline::new(
        repo.clone(),
        registry.clone(),
        executor,
    ));
    let approvals = Arc::new(ApprovalCoordinator::new(repo.clone()));

    seed_tool_sources(&repo, &config)?;

    let mut runtimes = RuntimeRegistry::new();
    runtimes.register(Arc::new(LocalEchoRuntime));
    let default_runtime_id = match &config.sandbox_runtime_variant {
        Some(variant) => {
            let command = sandbox_command(variant);
            info!("registering sandbox runtime '{}' ({:?})", variant, command);
            runtimes.register(Arc::new(SandboxRuntime::new(
                variant.clone(),
                format!("Sandbox runtime ({})", variant),
                command,
                config.internal_base_url.clone(),
                config.internal_token.clone(),
            )));
            variant.clone()
        }
        None => "local".to_string(),
    };
    let runtimes = Arc::new(runtimes);

    let state = AppState {
        repo: repo.clone(),
        registry,
        pipeline: pipeline.clone(),
        approvals,
        runtimes: runtimes.clone(),
        internal_token: config.internal_token.clone(),
        default_runtime_id,
    };
    let (gateway_handle, addr) = gateway::start(state, config.port).await?;
    if let Some(public) = &config.public_base_url {
        info!("public base url: {}", public);
    }

    let scheduler = if config.server_auto_execute {
        let scheduler = TaskScheduler::new(
            repo,
            pipeline,
            runtimes,
            Duration::from_millis(config.worker_poll_ms),
            config.worker_batch_size,
        );
        let handle = scheduler.start();
        Some((scheduler, handle))
    } else {
        info!("EXECUTOR_SERVER_AUTO_EXECUTE disabled; expecting external workers");
        None
    };

    info!("codeplane {} ready on {}", crate::VERSION, addr);
    wait_for_shutdown().await;
    info!("shutting down");

    if let Some((scheduler, handle)) = scheduler {
        // Stop the pump, let the in-flight drain finish.
        scheduler.shutdown();
        let _ = handle.await;
    }
    gateway_handle.abort();
    Ok(())
}

fn seed_tool_sources(repo: &Repository, config: &Config) -> Result<()> {
    for seed in &config.tool_sources {
        let workspace_id = seed
            .workspace_id
            .clone()
            .unwrap_or_else(|| DEFAULT_SEED_WORKSPACE.to_string());
        let source = repo.upsert_tool_source(
            &workspace_id,
            Some(&format!("seed_{}_{}", workspace_id, seed.name)),
            seed.kind,
            &seed.name,
            &seed.config,
            seed.enabled,
        )?;
        info!("seeded tool source {} in {}", source.source_key(), workspace_id);
    }
    Ok(())
}

/// The runner command for a sandbox variant. Variants are expected to be a
/// program name (plus arguments, space-separated) resolvable on PATH.
fn sandbox_command(variant: &str) -> Vec<String> {
    match std::env::var("EXECUTOR_SANDBOX_COMMAND") {
        Ok(raw) if !raw.trim().is_empty() => {
            raw.split_whitespace().map(str::to_string).collect()
        }
        _ => {
            warn!(
                "EXECUTOR_SANDBOX_COMMAND not set; sandbox runtime '{}' will fail to spawn",
                variant
            );
            vec!["node".to_string(), "runner.mjs".to_string()]
        }
    }
}

async fn wait_for_shutdown() {
    #[cfg(unix)]
    {
        let mut sigterm = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(signal) => signal,
            Err(e) => {
                warn!("failed to install SIGTERM handler: {}", e);
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
