//! Barcam Reader – takes a still on request, optionally reads a barcode
//! from it, and serves the captured images over HTTP.
//!
//! This binary:
//! 1. Reads configuration from `barcam.conf` and the environment
//! 2. Reads the zone tag used in image filenames
//! 3. Wires the camera and barcode adapters into the capture coordinator
//! 4. Runs the axum HTTP server until interrupted

mod coordinator;
mod decoder;
mod device;
mod server;
mod store;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use barcam_common::config::{self, FilenameScheme};
use barcam_common::naming::FileNamer;
use tracing::{debug, info, warn};

use crate::coordinator::{Coordinator, Settings};
use crate::decoder::{BarcodeDecoder, ZbarDecoder};
use crate::device::StillCommandDevice;
use crate::server::AppState;
use crate::store::ImageStore;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    // ── load config ──────────────────────────────────────────────────
    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let config = config::load(config_path.as_deref()).context("Config load failed")?;

    info!(
        "Barcam Reader starting (port={}, prefix={}, decode={})",
        config.port,
        if config.prefix.is_empty() { "/" } else { config.prefix.as_str() },
        config.decode
    );

    let (zone, fallback) = config::read_zone(&config.zone_file);
    if fallback {
        warn!(
            "No zone in {}, using placeholder {zone}",
            config.zone_file.display()
        );
    } else {
        info!("Zone {zone} read from {}", config.zone_file.display());
    }
    if config.filename_scheme == FilenameScheme::Random {
        info!("Filename scheme: random (zone tag unused)");
    }

    std::fs::create_dir_all(&config.image_dir).with_context(|| {
        format!("Cannot create image directory {}", config.image_dir.display())
    })?;

    // ── ctrl-c ───────────────────────────────────────────────────────
    ctrlc::set_handler(move || {
        info!("Caught interrupt signal");
        info!("Exiting");
        std::process::exit(2);
    })
    .context("Cannot set Ctrl-C handler")?;

    // ── adapters + coordinator ───────────────────────────────────────
    let store = ImageStore::new(&config.image_dir);
    let device = Arc::new(StillCommandDevice::new(
        config.capture_program.clone(),
        config.capture_timeout_ms,
        config.capture_extra_args.clone(),
    ));
    let decoder: Option<Arc<dyn BarcodeDecoder>> = if config.decode {
        info!(
            "Decoding with {} (symbologies: {})",
            config.decoder_program,
            config.symbologies.join(",")
        );
        Some(Arc::new(ZbarDecoder::new(
            config.decoder_program.clone(),
            config.symbologies.clone(),
            config.decode_timeout(),
        )))
    } else {
        None
    };

    let coordinator = Coordinator::new(
        store.clone(),
        device,
        decoder,
        FileNamer::new(config.filename_scheme, zone),
        Settings {
            admission: config.admission,
            completion_timeout: config.completion_timeout(),
            decode_timeout: config.decode_timeout(),
        },
    );

    let mut states = coordinator.subscribe();
    tokio::spawn(async move {
        while states.changed().await.is_ok() {
            debug!("Capture state: {}", *states.borrow());
        }
    });

    // ── HTTP server ──────────────────────────────────────────────────
    let state = AppState {
        coordinator: Arc::new(coordinator),
        store,
        take_response: config.take_response,
        start_time: Instant::now(),
    };

    server::run(state, &config.prefix, &config.listen_addr()).await?;

    info!("Barcam Reader stopped");
    Ok(())
}
