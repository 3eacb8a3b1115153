//! agenda-sync: synchronize a JSON-lines event source into a remote agenda
//! platform.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use agenda_sync::pipeline::image::HttpImageProbe;
use agenda_sync::platform::HttpPlatform;
use agenda_sync::{JsonLinesSource, SyncConfig, SyncEngine};

#[derive(Debug, Parser)]
#[command(name = "agenda-sync", version, about)]
struct Cli {
    /// TOML configuration file.
    #[arg(short, long, env = "AGENDA_SYNC_CONFIG")]
    config: Option<PathBuf>,

    /// JSON-lines source file (overrides `[source] path`).
    #[arg(short, long)]
    source: Option<PathBuf>,

    /// Working directory for staged records, error snapshots and the database.
    #[arg(short, long)]
    working_dir: Option<PathBuf>,

    /// Run every decision without mutating the target or the store.
    #[arg(long)]
    simulate: bool,

    /// Update entities even when nothing changed.
    #[arg(long)]
    force_update: bool,

    /// Stop after staging the source records.
    #[arg(long)]
    download_only: bool,

    /// Replace rejected images with the default image instead of failing.
    #[arg(long)]
    no_bail_on_invalid_image: bool,

    #[arg(long)]
    default_image_url: Option<String>,

    /// Abort the run after this many seconds.
    #[arg(long)]
    timeout: Option<u64>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("agenda_sync=info")),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();
    let mut config = SyncConfig::load_or_default(cli.config.as_deref())
        .context("Failed to load configuration")?;

    let options = &mut config.sync;
    options.simulate |= cli.simulate;
    options.force_update |= cli.force_update;
    options.download_only |= cli.download_only;
    options.no_bail_on_invalid_image |= cli.no_bail_on_invalid_image;
    if cli.working_dir.is_some() {
        options.working_dir = cli.working_dir;
    }
    if cli.default_image_url.is_some() {
        options.default_image_url = cli.default_image_url;
    }
    if cli.timeout.is_some() {
        options.run_timeout_secs = cli.timeout;
    }

    let Some(source_path) = cli.source.or_else(|| config.source.path.clone()) else {
        bail!("No source file given (use --source or `[source] path`)");
    };
    if config.platform.resolve_access_token().is_none() {
        warn!(
            env = %config.platform.access_token_env,
            "no access token configured, mutations will be rejected"
        );
    }

    let working_dir = config.sync.working_dir();
    let platform = HttpPlatform::new(&config.platform).context("Failed to build HTTP client")?;
    let probe = HttpImageProbe::new(Duration::from_secs(config.platform.timeout_secs))
        .context("Failed to build image probe")?;
    let engine = SyncEngine::open(
        Arc::new(JsonLinesSource::new(source_path)),
        Arc::new(platform),
        &working_dir,
    )
    .with_context(|| format!("Failed to open store in {}", working_dir.display()))?
    .with_image_probe(Arc::new(probe));

    let cancel = engine.cancel_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, finishing current item");
            cancel.cancel();
        }
    });

    info!(working_dir = %working_dir.display(), "starting");
    let stats = engine.run(&config.sync).await;
    println!("{}", serde_json::to_string_pretty(&stats)?);

    if stats.fatal_error.is_some() || stats.source_error.is_some() {
        std::process::exit(1);
    }
    Ok(())
}
