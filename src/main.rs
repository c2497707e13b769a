use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use futures::future::join_all;
use tokio::signal::unix::{SignalKind, signal};

use restream::catalogue::{Catalogue, FileCatalogue};
use restream::cli::{Cli, Commands};
use restream::config::{self, AppConfig};
use restream::distribution;
use restream::outdir::{ensure_output_dir, resolve_output_dir};
use restream::supervisor::Supervisor;
use restream::supervisor::artifacts::ArtifactSet;
use restream::supervisor::recovery::{OrphanReaper, ProcessTableReaper};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let cli = Cli::parse();
    tracing::info!("restream starting");

    let config = config::load_config(&cli)?;
    tracing::info!(
        output_dir = %config.output_dir.display(),
        sink_base = %config.sink_base,
        streams_file = %config.streams_file.display(),
        "Config loaded"
    );

    match cli.command {
        Commands::Run { ids, report_every } => run(&config, ids, report_every).await,
        Commands::Check { stream } => check(&config, stream.as_deref()).await,
        Commands::Reclaim { id } => reclaim(&config, &id).await,
        Commands::Purge { id } => purge(&config, &id),
    }
}

fn open_catalogue(config: &AppConfig) -> anyhow::Result<Arc<FileCatalogue>> {
    let catalogue = FileCatalogue::open(&config.streams_file, &config.state_dir)
        .with_context(|| format!("Failed to open catalogue {}", config.streams_file.display()))?;
    Ok(Arc::new(catalogue))
}

/// Start the requested streams and supervise them until SIGINT/SIGTERM.
async fn run(config: &AppConfig, requested: Vec<String>, report_every: u64) -> anyhow::Result<()> {
    let catalogue = open_catalogue(config)?;
    let ids = if requested.is_empty() {
        catalogue.list_ids()?
    } else {
        requested
    };
    if ids.is_empty() {
        anyhow::bail!("No streams to supervise in {}", config.streams_file.display());
    }

    let supervisor = Supervisor::init(config, catalogue.clone())?;

    let results = join_all(ids.iter().map(|id| supervisor.start(id))).await;
    for (id, result) in ids.iter().zip(results) {
        match result {
            Ok(outcome) => println!("{id}: {}", serde_json::to_string(&outcome)?),
            Err(e) => eprintln!("{id}: {e}"),
        }
    }

    let mut sigterm = signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;
    let mut ticker = tokio::time::interval(Duration::from_secs(report_every.max(1)));
    // The first tick fires immediately; skip it so the report follows the starts.
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Interrupt received");
                break;
            }
            _ = sigterm.recv() => {
                tracing::info!("SIGTERM received");
                break;
            }
            _ = ticker.tick() => {
                for id in &ids {
                    println!("{}", serde_json::to_string(&supervisor.status(id))?);
                }
            }
        }
    }

    supervisor.shutdown().await;
    tracing::info!("All streams stopped");
    Ok(())
}

/// Verify the output directory and the distribution server.
async fn check(config: &AppConfig, stream: Option<&str>) -> anyhow::Result<()> {
    let dir = ensure_output_dir(&config.output_dir)?;
    println!("output dir: {} (writable)", dir.display());

    let mut healthy = true;
    match distribution::probe_server(&config.playback_base).await {
        Ok(status) => println!("distribution: {} (HTTP {status})", config.playback_base),
        Err(e) => {
            healthy = false;
            println!("distribution: {e}");
        }
    }

    if let Some(id) = stream {
        match distribution::probe_playlist(&config.playback_base, id).await {
            Ok(()) => println!(
                "playlist: {}",
                distribution::playback_url(&config.playback_base, &format!("{id}.m3u8"))
            ),
            Err(e) => {
                healthy = false;
                println!("playlist: {e}");
            }
        }
    }

    if !healthy {
        anyhow::bail!("Distribution check failed");
    }
    Ok(())
}

/// Kill workers left behind for `id` by an earlier supervisor instance.
async fn reclaim(config: &AppConfig, id: &str) -> anyhow::Result<()> {
    let catalogue = open_catalogue(config)?;
    let known_pid = catalogue.recorded_process(id);
    let output_dir = resolve_output_dir(&config.output_dir);
    let reaper = ProcessTableReaper::new(&config.worker.binary, &config.sink_base, &output_dir);

    let report = reaper.reclaim(id, known_pid).await;
    println!("{}", serde_json::to_string(&report)?);

    if let Err(e) = catalogue.record_process(id, None) {
        tracing::warn!(stream_id = %id, error = %e, "Failed to clear recorded pid");
    }
    Ok(())
}

fn purge(config: &AppConfig, id: &str) -> anyhow::Result<()> {
    let removed = ArtifactSet::for_stream(id)
        .purge(&config.output_dir)
        .with_context(|| format!("Failed to purge {}", config.output_dir.display()))?;
    for path in &removed {
        println!("removed {}", path.display());
    }
    println!("{} artifact(s) removed for stream {id}", removed.len());
    Ok(())
}
