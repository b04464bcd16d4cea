//! motion_hub - device ingest hub daemon
//!
//! This daemon:
//! 1. Loads configuration (JSON file + environment + CLI flags)
//! 2. Opens the SQLite alert store
//! 3. Serves the device/viewer protocol over TCP
//! 4. Logs a health line every 30 seconds until Ctrl-C

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::time::Duration;

use motion_hub::{
    server::{HubServer, ServerConfig},
    AdaptiveFactory, HubConfig, MotionHub, SqliteAlertStore,
};

const HEALTH_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "Ingest frames from network cameras and broadcast motion alerts"
)]
struct Args {
    /// JSON configuration file.
    #[arg(long, env = "MOTION_HUB_CONFIG")]
    config: Option<PathBuf>,

    /// Listen address (overrides the config file).
    #[arg(long, env = "MOTION_HUB_ADDR")]
    addr: Option<String>,

    /// SQLite database for alerts (overrides the config file).
    #[arg(long, env = "MOTION_HUB_DB_PATH")]
    db_path: Option<String>,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let mut config = HubConfig::load_from(args.config.as_deref())?;
    if let Some(addr) = args.addr {
        config.listen_addr = addr;
    }
    if let Some(db_path) = args.db_path {
        config.db_path = db_path;
    }

    let store = SqliteAlertStore::open(&config.db_path)
        .with_context(|| format!("open alert store {}", config.db_path))?;
    log::info!(
        "alert store {} holds {} alerts and {} reference frames",
        config.db_path,
        store.alert_count()?,
        store.reference_count()?
    );
    let hub = Arc::new(MotionHub::new(
        &config,
        Arc::new(store),
        Arc::new(AdaptiveFactory),
    ));
    let handle = HubServer::new(ServerConfig::from(&config), hub.clone()).spawn()?;
    log::info!(
        "motion_hub running on {}. writing alerts to {}",
        handle.addr,
        config.db_path
    );
    log::info!(
        "motion detection {}: threshold={} min_area={} cooldown={}s",
        if config.detection.enabled { "on" } else { "off" },
        config.detection.motion_threshold,
        config.detection.min_contour_area,
        config.detection.cooldown.as_secs()
    );

    let (tx, rx) = mpsc::channel();
    ctrlc::set_handler(move || {
        let _ = tx.send(());
    })
    .map_err(|e| anyhow!("error setting Ctrl-C handler: {}", e))?;

    loop {
        match rx.recv_timeout(HEALTH_INTERVAL) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
            Err(RecvTimeoutError::Timeout) => {
                let stats = hub.stats();
                log::info!(
                    "health: devices={} streams={} frames={} rejected={} alerts={} viewers={} dropped={} faults={} buffered={}B",
                    stats.active_devices,
                    stats.active_streams,
                    stats.frames_processed,
                    stats.frames_rejected,
                    stats.motion_alerts,
                    stats.viewers,
                    stats.broadcasts_dropped,
                    stats.detection_faults,
                    stats.buffered_frame_bytes
                );
            }
        }
    }

    log::info!("shutdown signal received, stopping motion hub...");
    handle.stop()?;
    Ok(())
}
