//! lanscreen: serve a live screen feed as MJPEG to browsers on the LAN

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use color_eyre::{eyre::WrapErr, Result};
use lanscreen::capture::{push_source, FramePusher, FrameSource, TestPatternSource};
use lanscreen::{utils, Config, LatestFrameCache, Pipeline, PixelConverter, SourceKind, StreamServer};
use tracing::{error, info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "lanscreen")]
#[command(about = "Stream a screen to any browser on the local network")]
#[command(version)]
struct Cli {
    /// Path to a TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Listen port (0 picks a free one)
    #[arg(short, long)]
    port: Option<u16>,

    /// Target stream rate per viewer, 1-30
    #[arg(long)]
    fps: Option<u32>,

    /// JPEG quality, 0-100
    #[arg(short, long)]
    quality: Option<u8>,

    /// Downscale frames wider than this
    #[arg(long)]
    target_width: Option<u32>,

    /// Enable debug logging
    #[arg(short, long)]
    verbose: bool,
}

impl Cli {
    fn apply(&self, config: &mut Config) {
        if let Some(port) = self.port {
            config.server.port = port;
        }
        if let Some(fps) = self.fps {
            config.stream.fps = fps;
        }
        if let Some(quality) = self.quality {
            config.capture.jpeg_quality = quality;
        }
        if let Some(width) = self.target_width {
            config.capture.target_width = width;
        }
    }
}

fn init_tracing(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("lanscreen=debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("lanscreen=info"))
    };

    let registry = tracing_subscriber::registry().with(filter).with(
        tracing_subscriber::fmt::layer().with_timer(tracing_subscriber::fmt::time::uptime()),
    );

    #[cfg(feature = "profiling")]
    let registry = registry.with(tracing_tracy::TracyLayer::default());

    registry.init();
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    info!("lanscreen launching...");

    let mut config = Config::load(cli.config.as_deref()).wrap_err("Failed to load configuration")?;
    cli.apply(&mut config);
    config.validate()?;

    if config.stream.fps != config.stream.effective_fps() {
        warn!(
            requested = config.stream.fps,
            used = config.stream.effective_fps(),
            "fps out of range, clamped"
        );
    }

    let cache = Arc::new(LatestFrameCache::new());
    let converter = Arc::new(PixelConverter::new(&config.capture));

    // The pusher is held so an idle push source stays connected
    let (source, _pusher): (Box<dyn FrameSource>, Option<FramePusher>) = match config.capture.source {
        SourceKind::TestPattern => {
            let source = TestPatternSource::new(
                config.capture.pattern_width,
                config.capture.pattern_height,
                config.capture.source_fps,
            );
            (Box::new(source), None)
        }
        SourceKind::None => {
            info!("No capture source configured, serving without frames");
            let (pusher, source) = push_source();
            (Box::new(source), Some(pusher))
        }
    };

    let mut pipeline = Pipeline::start(source, converter, Arc::clone(&cache))?;

    let server = StreamServer::bind(&config.server, &config.stream, cache)
        .await
        .wrap_err("Cannot start the stream server")?;
    let shutdown = server.shutdown_handle();

    let port = server.local_addr().port();
    match utils::local_ip() {
        Some(ip) => info!("Open http://{ip}:{port}/ on any device on this network"),
        None => info!("Listening on {}", server.local_addr()),
    }

    let server_task = tokio::spawn(server.serve());

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");

    // Server drain and pipeline stop run side by side
    shutdown.shutdown();
    let pipeline_task = tokio::task::spawn_blocking(move || pipeline.shutdown());
    let (server_result, pipeline_result) = tokio::join!(server_task, pipeline_task);

    match server_result {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!(error = %e, "Server exited with error"),
        Err(e) => error!(error = %e, "Server task failed"),
    }
    pipeline_result?;

    info!("lanscreen stopped");
    Ok(())
}
