use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use demobot_storage::SnapshotStore;
use demobot_sync::{AnnouncePipeline, RunConfig, RunSummary};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "demobot")]
#[command(about = "Announce registered assemblies on social channels")]
struct Cli {
    /// Log at debug level unless RUST_LOG is set.
    #[arg(short, long, global = true)]
    verbose: bool,
    /// Snapshot file, overriding SNAPSHOT_PATH.
    #[arg(long, global = true)]
    snapshot: Option<PathBuf>,
    /// Dataset endpoint, overriding DATASET_URL.
    #[arg(long, global = true)]
    dataset_url: Option<String>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Announce new and changed assemblies.
    Update,
    /// Reshare earlier announcements of today's assemblies.
    Remind,
    /// Print what the next update would announce.
    Preview,
    /// Create an empty snapshot if none exists.
    Init,
}

fn init_tracing(verbose: bool) {
    let fallback = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

fn print_summary(summary: &RunSummary) {
    println!(
        "{} complete: run_id={} publishers={} records={} candidates={} succeeded={} failed={}",
        summary.mode,
        summary.run_id,
        summary.publishers,
        summary.fetched_records,
        summary.candidates,
        summary.succeeded,
        summary.failed
    );
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let mut config = RunConfig::from_env();
    if let Some(path) = cli.snapshot {
        config.snapshot_path = path;
    }
    if let Some(url) = cli.dataset_url {
        config.dataset_url = url;
    }

    match cli.command {
        Commands::Init => {
            let store = SnapshotStore::new(config.snapshot_path.clone());
            let created = store
                .init_empty()
                .await
                .with_context(|| format!("initializing {}", store.path().display()))?;
            if created {
                println!("created empty snapshot at {}", store.path().display());
            } else {
                println!("snapshot already exists at {}", store.path().display());
            }
        }
        Commands::Update => {
            let pipeline = AnnouncePipeline::new(&config)
                .await
                .context("setting up update run")?;
            let summary = pipeline.run_update().await.context("update run failed")?;
            print_summary(&summary);
        }
        Commands::Remind => {
            let pipeline = AnnouncePipeline::new(&config)
                .await
                .context("setting up remind run")?;
            let summary = pipeline.run_remind().await.context("remind run failed")?;
            println!("reshared={} no_match={}", summary.reshared, summary.no_match);
            print_summary(&summary);
        }
        Commands::Preview => {
            let pipeline = AnnouncePipeline::new(&config)
                .await
                .context("setting up preview")?;
            let posts = pipeline.preview().await.context("preview failed")?;
            for preview in &posts {
                match &preview.post.content_warning {
                    Some(label) => println!("--- {} [CW: {label}]", preview.assembly.date),
                    None => println!("--- {}", preview.assembly.date),
                }
                println!("{}\n", preview.post.text);
            }
            println!("{} post(s) would be announced", posts.len());
        }
    }

    Ok(())
}
