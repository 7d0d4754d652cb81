//! Local image loader
//!
//! Loads the images described in a JSON configuration from local storage
//! onto an in-memory canvas:
//! - Steps all loads on a fixed tick until shutdown (or once, with --once)
//! - Reloads images with an update interval
//! - Optionally writes the resulting frame as PNG

use anyhow::Context;
use clap::Parser;
use local_image::config::{Config, DEFAULT_CONFIG_PATH};
use local_image::{FrameBuffer, ImageManager, LoadStatus, Scheduler};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Command line arguments
#[derive(Parser, Debug)]
#[command(name = "local-image")]
#[command(about = "Load BMP/JPEG/PNG images from local storage onto a canvas")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = DEFAULT_CONFIG_PATH)]
    config: String,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Write the final frame to this PNG file
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Exit once all loads have settled
    #[arg(long)]
    once: bool,

    /// Load only these images instead of the configured startup set
    #[arg(long = "load", value_name = "ID")]
    load: Vec<String>,

    /// Reload an image from another path, as ID=PATH
    #[arg(long = "reload", value_name = "ID=PATH", value_parser = parse_reload)]
    reload: Vec<(String, String)>,
}

fn parse_reload(value: &str) -> Result<(String, String), String> {
    value
        .split_once('=')
        .filter(|(id, path)| !id.is_empty() && !path.is_empty())
        .map(|(id, path)| (id.to_string(), path.to_string()))
        .ok_or_else(|| format!("expected ID=PATH, got '{}'", value))
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    init_logging(args.verbose);

    tracing::info!("Starting local image loader");

    // Configuration errors are fatal
    let config = Config::load(&args.config)
        .with_context(|| format!("Failed to load config from {}", args.config))?;
    let mut manager = config.build_manager()?;

    start_loads(&mut manager, &config, &args)?;

    let manager = Arc::new(Mutex::new(manager));
    let scheduler = Scheduler::new(Arc::clone(&manager), config.loader.tick())
        .with_periodic_reloads(config.update_intervals());

    let (shutdown_tx, _) = broadcast::channel::<()>(1);

    if args.once {
        let shutdown = shutdown_tx.subscribe();
        let signal_tx = shutdown_tx.clone();
        let signals = tokio::spawn(async move {
            if let Err(e) = wait_for_shutdown().await {
                tracing::error!("Signal handling failed: {}", e);
                return;
            }
            let _ = signal_tx.send(());
        });

        scheduler.run_until_idle(shutdown).await;
        signals.abort();
    } else {
        let scheduler_shutdown = shutdown_tx.subscribe();
        let scheduler_handle = tokio::spawn(async move {
            scheduler.run(scheduler_shutdown).await;
        });

        wait_for_shutdown().await?;
        tracing::info!("Shutdown signal received");

        let _ = shutdown_tx.send(());

        tokio::select! {
            _ = scheduler_handle => {},
            _ = tokio::time::sleep(std::time::Duration::from_secs(5)) => {
                tracing::warn!("Scheduler shutdown timeout");
            }
        }
    }

    let mut manager = manager.lock().await;
    report(&manager);
    if let Some(path) = &args.output {
        let drawn = manager.draw_all();
        tracing::debug!("Redrew {} images before saving", drawn);
        save_output(&manager, path)?;
    }

    tracing::info!("Shutdown complete");
    Ok(())
}

/// Start the loads requested on the command line, or the configured
/// startup set when none were given
fn start_loads(
    manager: &mut ImageManager<FrameBuffer>,
    config: &Config,
    args: &Args,
) -> anyhow::Result<()> {
    let explicit = !args.load.is_empty() || !args.reload.is_empty();
    let names = if explicit {
        args.load.clone()
    } else {
        config.startup_images()
    };

    for name in &names {
        let id = manager.resolve(name)?;
        manager.load(id)?;
    }

    for (name, path) in &args.reload {
        let id = manager.resolve(name)?;
        manager.reload(id, Some(path))?;
    }

    Ok(())
}

/// Log the final status of every image
fn report(manager: &ImageManager<FrameBuffer>) {
    for resource in manager.resources() {
        match (resource.status(), resource.last_error()) {
            (LoadStatus::Failed, Some(code)) => {
                tracing::warn!("{}: failed, {}", resource.name(), code)
            }
            (status, _) => tracing::info!("{}: {}", resource.name(), status),
        }
    }
}

#[cfg(feature = "png")]
fn save_output(manager: &ImageManager<FrameBuffer>, path: &std::path::Path) -> anyhow::Result<()> {
    manager.canvas().save_png(path)?;
    Ok(())
}

#[cfg(not(feature = "png"))]
fn save_output(_manager: &ImageManager<FrameBuffer>, _path: &std::path::Path) -> anyhow::Result<()> {
    anyhow::bail!("--output needs the 'png' feature")
}

/// Initialize tracing/logging
///
/// Default level is "warn". Use --verbose for "debug".
fn init_logging(verbose: bool) {
    let level = if verbose { "debug" } else { "warn" };

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| format!("local_image={}", level).into());

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();
}

/// Wait for shutdown signals (SIGTERM, SIGINT)
async fn wait_for_shutdown() -> std::io::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    tokio::select! {
        _ = sigterm.recv() => {
            tracing::info!("Received SIGTERM");
        }
        _ = sigint.recv() => {
            tracing::info!("Received SIGINT");
        }
    }
    Ok(())
}
