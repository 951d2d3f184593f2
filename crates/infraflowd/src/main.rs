mod api;
mod daemon;
mod deployer;

use clap::{Parser, Subcommand};
use colored::Colorize;
use infraflow_config::TaskConfig;
use infraflow_controlplane::{EntityService, TaskManager};
use infraflow_core::{EntityStore, MemoryEntityStore, parse_manifest_file};
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "infraflowd")]
#[command(about = "InfraFlow control plane daemon", version)]
struct Cli {
    /// Config file (default: discovered infraflow.kdl)
    #[arg(short, long, global = true, env = "INFRAFLOW_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the controller, workers and Entity API
    Serve {
        /// Seed or update entities from a manifest before starting
        #[arg(short, long)]
        manifest: Option<PathBuf>,
    },
    /// Run deployers behind the task RPC endpoint
    Deployer {
        /// Listen address
        #[arg(short, long, default_value = "0.0.0.0:7421")]
        listen: String,
    },
    /// Check a manifest without touching any state
    Validate {
        manifest: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    match cli.command {
        Commands::Validate { manifest } => validate(&manifest).await,
        Commands::Serve { manifest } => {
            let config = infraflow_config::load(cli.config.as_deref())?;
            print_banner("control plane", &config.server.listen);
            daemon::serve(config, manifest.as_deref()).await
        }
        Commands::Deployer { listen } => {
            let config = infraflow_config::load(cli.config.as_deref())?;
            print_banner("deployer", &listen);
            daemon::serve_deployer(config, &listen).await
        }
    }
}

fn print_banner(role: &str, listen: &str) {
    println!(
        "{} {} {}",
        "infraflowd".bold().cyan(),
        env!("CARGO_PKG_VERSION").dimmed(),
        format!("({})", role).dimmed()
    );
    println!("  {} {}", "listen:".bold(), listen);
    println!();
}

/// Apply the manifest to a throwaway in-memory store so hierarchy and
/// placement rules are checked exactly as the daemon would check them.
async fn validate(path: &Path) -> anyhow::Result<()> {
    let decls = match parse_manifest_file(path) {
        Ok(decls) => decls,
        Err(e) => {
            println!("{} {}: {}", "✗".red().bold(), path.display(), e);
            anyhow::bail!("manifest is invalid");
        }
    };

    let store = Arc::new(MemoryEntityStore::new());
    let tasks = Arc::new(TaskManager::new(store.clone(), TaskConfig::default()));
    let service = EntityService::new(store.clone(), tasks);
    if let Err(e) = service.apply_manifest(decls).await {
        println!("{} {}: {}", "✗".red().bold(), path.display(), e);
        anyhow::bail!("manifest is invalid");
    }

    for entity in store.list().await? {
        let parent = entity
            .parent()
            .map(|p| format!(" ← {}", p))
            .unwrap_or_default();
        println!(
            "  {} {} {}{}",
            entity.kind().to_string().cyan(),
            entity.id.bold(),
            format!("[{} {}]", entity.spec.cloud, entity.spec.infra_version).dimmed(),
            parent.dimmed()
        );
    }
    println!("{} {} is valid", "✓".green().bold(), path.display());
    Ok(())
}
