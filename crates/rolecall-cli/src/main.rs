use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand, ValueEnum};
use rolecall_core::{DeletionKind, SecretResolver};
use rolecall_lifecycle::{DeletionRequest, Lifecycle, LifecycleConfig};
use rolecall_storage::{ArtifactStore, HttpClientConfig, HttpFetcher, MemoryStore, Store};
use rolecall_sync::{seed_registry, Scheduler, SyncConfig};
use rolecall_web::AppState;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use uuid::Uuid;

#[derive(Debug, Parser)]
#[command(name = "rolecall-cli")]
#[command(about = "RoleCall job posting tracker command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum KindArg {
    Soft,
    Hard,
}

impl From<KindArg> for DeletionKind {
    fn from(kind: KindArg) -> Self {
        match kind {
            KindArg::Soft => DeletionKind::Soft,
            KindArg::Hard => DeletionKind::Hard,
        }
    }
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Seed the registry and run every due source once.
    Sync,
    /// Run one source immediately, regardless of its schedule.
    Run { source_id: Uuid },
    /// Load sources.yaml into the store without crawling.
    Seed {
        #[arg(long)]
        path: Option<PathBuf>,
    },
    /// Show what deleting a source would touch.
    Impact { source_id: Uuid },
    /// Delete a source's jobs (soft by default; hard requires --reason).
    Delete {
        source_id: Uuid,
        #[arg(long, value_enum, default_value_t = KindArg::Soft)]
        kind: KindArg,
        #[arg(long)]
        reason: Option<String>,
        #[arg(long)]
        dry_run: bool,
        #[arg(long)]
        export: bool,
        #[arg(long)]
        recrawl: bool,
        #[arg(long, default_value = "cli")]
        actor: String,
    },
    /// Clear soft-delete markers for a source.
    Restore {
        source_id: Uuid,
        #[arg(long)]
        reason: Option<String>,
        #[arg(long)]
        recrawl: bool,
        #[arg(long, default_value = "cli")]
        actor: String,
    },
    /// Print the audit trail for a source.
    Audits { source_id: Uuid },
    /// Serve the JSON API (and the cron scheduler when enabled).
    Serve {
        #[arg(long)]
        port: Option<u16>,
    },
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,rolecall=debug"));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer())
        .init();
}

struct Components {
    store: Arc<MemoryStore>,
    scheduler: Arc<Scheduler>,
    lifecycle: Arc<Lifecycle>,
    config: SyncConfig,
}

fn build_components() -> Result<Components> {
    let config = SyncConfig::from_env();
    let store = MemoryStore::shared();
    let http = Arc::new(
        HttpFetcher::new(HttpClientConfig {
            timeout: Duration::from_secs(config.http_timeout_secs),
            user_agent: Some(config.user_agent.clone()),
            ..HttpClientConfig::default()
        })
        .context("building http fetcher")?,
    );
    let scheduler = Arc::new(Scheduler::new(
        store.clone(),
        http,
        ArtifactStore::new(config.artifacts_dir.clone()),
        Arc::new(SecretResolver::from_env()),
        config.policy(),
        config.worker_concurrency,
    ));
    let lifecycle = Arc::new(Lifecycle::new(store.clone(), LifecycleConfig::from_env()));
    Ok(Components {
        store,
        scheduler,
        lifecycle,
        config,
    })
}

async fn maybe_seed(components: &Components, path: Option<&PathBuf>) -> Result<()> {
    let path = path.unwrap_or(&components.config.registry_path);
    if !path.exists() {
        info!(path = %path.display(), "no registry file, skipping seed");
        return Ok(());
    }
    let summary = seed_registry(components.store.as_ref(), path).await?;
    info!(
        seeded = summary.seeded,
        skipped = summary.skipped,
        invalid = summary.invalid,
        "registry seeded"
    );
    Ok(())
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();
    let cli = Cli::parse();
    let components = build_components()?;

    match cli.command.unwrap_or(Commands::Sync) {
        Commands::Sync => {
            maybe_seed(&components, None).await?;
            let summary = components.scheduler.run_due(Utc::now()).await?;
            print_json(&summary)?;
        }
        Commands::Run { source_id } => {
            let run = components.scheduler.run_source(source_id).await?;
            print_json(&run)?;
        }
        Commands::Seed { path } => {
            maybe_seed(&components, path.as_ref()).await?;
            let sources = components.store.list_sources().await?;
            print_json(&sources)?;
        }
        Commands::Impact { source_id } => {
            let report = components.lifecycle.impact(source_id).await?;
            print_json(&report)?;
        }
        Commands::Delete {
            source_id,
            kind,
            reason,
            dry_run,
            export,
            recrawl,
            actor,
        } => {
            let request = DeletionRequest {
                source_id,
                kind: kind.into(),
                actor,
                reason,
                dry_run,
                export_first: export,
                recrawl,
            };
            let summary = components.lifecycle.execute(&request).await?;
            print_json(&summary)?;
            if recrawl && !dry_run {
                let run = components.scheduler.run_source(source_id).await?;
                print_json(&run)?;
            }
        }
        Commands::Restore {
            source_id,
            reason,
            recrawl,
            actor,
        } => {
            let summary = components.lifecycle.restore(source_id, &actor, reason).await?;
            print_json(&summary)?;
            if recrawl {
                let run = components.scheduler.recrawl_source(source_id).await?;
                print_json(&run)?;
            }
        }
        Commands::Audits { source_id } => {
            let audits = components.lifecycle.audits(source_id).await?;
            print_json(&audits)?;
        }
        Commands::Serve { port } => {
            maybe_seed(&components, None).await?;
            if components.config.scheduler_enabled {
                let cron = components
                    .scheduler
                    .build_cron(&components.config.sync_cron)
                    .await?;
                cron.start().await.context("starting cron scheduler")?;
                info!(cron = %components.config.sync_cron, "cron scheduler started");
            }
            let port = port
                .or_else(|| {
                    std::env::var("ROLECALL_WEB_PORT")
                        .ok()
                        .and_then(|v| v.parse().ok())
                })
                .unwrap_or(8000);
            info!(port, "serving json api");
            let state = AppState::new(
                components.store.clone(),
                components.scheduler.clone(),
                components.lifecycle.clone(),
            );
            rolecall_web::serve(state, port).await?;
        }
    }

    Ok(())
}
