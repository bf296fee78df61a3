use anyhow::{Context, Result};
use clap::Parser;
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;
use tokio::sync::watch;
use tracing::{debug, info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use wedding_gallery::config::{LogFormat, ServiceConfig};
use wedding_gallery::view::ModalSnapshot;
use wedding_gallery::{
    gateway, Config, FeedOptions, FeedState, GalleryView, ImageCompressor, InMemoryPreviews,
    ItemStatus, PhotoFeed, PickedFile, UploadLimits, UploadPipeline, ViewOptions,
};

/// Shared wedding photo gallery
#[derive(Parser, Debug)]
#[command(name = "wedding-gallery", version, about)]
struct Cli {
    /// Name shown next to your photos
    #[arg(short, long)]
    name: Option<String>,

    /// Exit after uploading instead of following new photos
    #[arg(long)]
    once: bool,

    /// Photos to upload
    files: Vec<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Load configuration
    let config = Config::load().context("Failed to load configuration")?;

    // Initialize logging
    init_tracing(&config.service);

    info!(
        service = %config.service.name,
        backend = ?config.store.backend,
        "Starting wedding gallery"
    );

    let gateway = gateway::connect(&config)
        .await
        .context("Failed to initialize storage gateway")?;

    let feed = Arc::new(PhotoFeed::start(gateway.clone(), FeedOptions::from(&config.feed)).await);
    let pipeline = Arc::new(UploadPipeline::new(
        gateway,
        Arc::new(ImageCompressor),
        UploadLimits::from(&config.upload),
    ));
    let previews = Arc::new(InMemoryPreviews::new());
    let view = GalleryView::new(
        feed,
        pipeline,
        previews.clone(),
        ViewOptions::from(&config),
    );

    let state = view
        .watch_feed()
        .wait_for(|state| !state.loading)
        .await
        .context("Photo feed stopped before loading")?
        .clone();
    if let Some(error) = &state.error {
        println!("{error}");
    }
    println!("{} fotos compartidas", state.photos.len());

    if !cli.files.is_empty() {
        let mut files = Vec::with_capacity(cli.files.len());
        for path in &cli.files {
            let file = PickedFile::read(path)
                .await
                .with_context(|| format!("Failed to read {}", path.display()))?;
            files.push(file);
        }

        view.open_modal();
        if let Some(name) = &cli.name {
            view.set_uploader_name(name);
        }
        view.pick_files(files);

        let progress = tokio::spawn(print_progress(view.watch_modal()));
        let outcome = view.start_upload().await;
        progress.abort();

        for item in &view.snapshot().modal.batch.items {
            if item.status == ItemStatus::Error {
                println!(
                    "{}: {}",
                    item.name,
                    item.error.as_deref().unwrap_or_default()
                );
            }
        }
        if let Some(outcome) = outcome {
            println!(
                "{} fotos subidas, {} con error",
                outcome.success_count, outcome.error_count
            );
        }
    }

    if cli.once {
        view.dispose();
        debug!(live_previews = previews.len(), "Gallery view disposed");
        return Ok(());
    }

    let seen = state.photos.iter().map(|p| p.id.clone()).collect();
    let follower = tokio::spawn(print_arrivals(view.watch_feed(), seen));

    info!("Following new photos");

    // Wait for shutdown signal
    shutdown_signal().await;

    follower.abort();
    view.dispose();
    debug!(live_previews = previews.len(), "Gallery view disposed");

    info!("Wedding gallery stopped");

    Ok(())
}

/// Initialize tracing/logging
fn init_tracing(service: &ServiceConfig) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&service.log_level));

    let registry = tracing_subscriber::registry().with(env_filter);

    // stdout is for the gallery itself
    match service.log_format {
        LogFormat::Json => registry
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init(),
        LogFormat::Pretty => registry
            .with(fmt::layer().with_writer(std::io::stderr))
            .init(),
    }
}

async fn print_progress(mut modal: watch::Receiver<ModalSnapshot>) {
    let mut last = None;
    while modal.changed().await.is_ok() {
        let batch = modal.borrow_and_update().batch.clone();
        if batch.current != last {
            if let Some(current) = batch.current {
                println!("Subiendo {} de {}", current, batch.items.len());
            }
            last = batch.current;
        }
    }
}

async fn print_arrivals(mut feed: watch::Receiver<FeedState>, mut seen: HashSet<String>) {
    while feed.changed().await.is_ok() {
        let state = feed.borrow_and_update().clone();
        if let Some(error) = &state.error {
            warn!(error = %error, "Feed reported an error");
        }
        for photo in state.photos.iter().rev() {
            if seen.insert(photo.id.clone()) {
                println!(
                    "Nueva foto de {}: {}",
                    photo.uploader_name.as_deref().unwrap_or("un invitado"),
                    photo.image_url
                );
            }
        }
    }
}

/// Wait for shutdown signal (SIGINT or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C signal");
        }
        _ = terminate => {
            info!("Received SIGTERM signal");
        }
    }
}
