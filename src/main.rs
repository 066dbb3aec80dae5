#![deny(clippy::all)]

mod api;
mod capture;
mod config;
mod console;
mod controller;
mod directory;
mod error;
mod models;
mod preferences;
mod roster;
mod transport;

use anyhow::Context;
use api::{ApiClient, AttendanceApi};
use capture::{CaptureGate, DirectoryFrameSource, FrameScheduler};
use config::Config;
use controller::{attach_transport, spawn_refresh_ticker, SessionController};
use directory::SessionDirectory;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use transport::RecognitionTransport;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing for structured logging (RUST_LOG, default info)
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    // Load configuration from embedded config.toml plus environment overrides
    let config = Config::load().context("Failed to load configuration")?;
    info!(base_url = %config.api.base_url, "Starting facemark");

    let api = Arc::new(ApiClient::new(
        &config.api.base_url,
        Duration::from_secs(config.api.request_timeout_secs),
    )?);
    match api.health().await {
        Ok(()) => info!("Backend is healthy"),
        Err(e) => warn!("Backend health check failed, continuing: {}", e),
    }

    let transport = Arc::new(
        RecognitionTransport::connect(&config.api.base_url, &config.transport)
            .context("Failed to set up the recognition channel")?,
    );

    let source = match DirectoryFrameSource::open(&config.capture.frames_dir) {
        Ok(source) => {
            info!(frames = source.len(), "Frame source ready");
            source
        }
        Err(e) => {
            warn!("No frames available, capture will send nothing: {}", e);
            DirectoryFrameSource::from_frames(Vec::new())
        }
    };
    let scheduler = FrameScheduler::new(
        CaptureGate::new(),
        Box::new(source),
        transport.clone(),
        config.frame_interval(),
    );

    let department_filter = preferences::get_department_filter();
    if let Some(department) = &department_filter {
        info!(department = %department, "Using saved department filter");
    }
    let directory = SessionDirectory::new(api.clone(), department_filter);

    let controller = Arc::new(SessionController::new(
        api,
        directory,
        scheduler,
        config.directory.auto_select,
    ));
    let events = controller.subscribe();
    let link = attach_transport(controller.clone(), &transport);
    let ticker = spawn_refresh_ticker(controller.clone(), config.refresh_interval());

    if let Err(e) = controller.refresh_students().await {
        warn!("Could not load students, manual marks use ids as names: {}", e);
    }

    let result = console::run(controller.clone(), events).await;

    // Teardown: capture first, then the socket
    ticker.abort();
    controller.shutdown().await;
    transport.shutdown().await;
    link.abort();
    info!("Goodbye");

    result.context("Console failed")
}
