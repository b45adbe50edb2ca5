//! metadata-scripts - run the lifecycle scripts named in instance metadata.
//!
//! Invoked once per boot phase. Scripts are looked up on the instance
//! first and then on the project, run one after another, and deleted.

use clap::Parser;
use gce_metadata::{fetch_snapshot, ClientConfig, MetadataClient, WatcherConfig, DEFAULT_METADATA_URL};
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

mod fetch;
mod runner;
mod script;

use fetch::{FetchConfig, Fetcher};
use script::ScriptKind;

/// Run startup, shutdown or specialize scripts from metadata.
#[derive(Debug, Parser)]
#[command(name = "metadata-scripts", author, version, about, long_about = None)]
struct Cli {
    /// Which scripts to run.
    #[arg(value_enum)]
    kind: ScriptKind,

    /// Metadata server base URL.
    #[arg(long, env = "GCE_METADATA_URL", default_value = DEFAULT_METADATA_URL)]
    metadata_url: String,

    /// Program used to copy gs:// URLs.
    #[arg(long, env = "GCE_GSUTIL", default_value = "gsutil")]
    gsutil: String,
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().compact().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();

    if let Err(e) = run(cli).await {
        eprintln!("Error: {e:#}");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    info!(kind = %cli.kind, "Starting {} scripts", cli.kind);

    let client = MetadataClient::new(ClientConfig::with_base_url(&cli.metadata_url))?;
    let document = fetch_snapshot(&client, &WatcherConfig::default()).await;

    let entries = script::find_scripts(&document, cli.kind);
    if entries.is_empty() {
        info!("No {} scripts to run", cli.kind);
        return Ok(());
    }

    let fetcher = Fetcher::new(FetchConfig {
        gsutil: cli.gsutil,
        ..FetchConfig::default()
    })?;

    for entry in &entries {
        let local = match fetcher.materialize(entry).await {
            Ok(local) => local,
            Err(e) => {
                warn!(key = %entry.key, error = %e, "Failed to fetch script");
                continue;
            }
        };

        if let Err(e) = runner::run(&local).await {
            warn!(key = %entry.key, error = %e, "Failed to run script");
        }

        if let Err(e) = tokio::fs::remove_file(&local.path).await {
            warn!(path = %local.path.display(), error = %e, "Failed to delete script");
        }
    }

    info!("Finished running {} scripts", cli.kind);
    Ok(())
}
