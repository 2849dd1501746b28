//! occupancyd - doorway occupancy daemon
//!
//! This daemon:
//! 1. Opens the session log and seeds the live occupancy tally from it
//! 2. Starts the notification worker (MQTT when configured, log otherwise)
//! 3. Serves status, history, camera control and the live feed on loopback
//! 4. Runs the pipeline: camera -> tracker -> crossings -> sessions
//! 5. On Ctrl-C releases the camera and drains pending notifications

use anyhow::{anyhow, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use occupancy_kernel::{
    api::{ApiConfig, ApiServer},
    config::OccupancydConfig,
    detect::tracker_from_config,
    ingest::device_from_config,
    transport::{LogNotifier, MqttNotifier},
    CameraSource, Control, NotificationDispatcher, Notifier, PipelineDriver, SqliteSessionStore,
};

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cfg = OccupancydConfig::load()?;
    log::info!(
        "occupancyd {} starting. writing to {}",
        env!("CARGO_PKG_VERSION"),
        cfg.db_path
    );

    let notifier: Box<dyn Notifier> = match &cfg.mqtt {
        Some(settings) => Box::new(MqttNotifier::connect(settings)?),
        None => {
            log::info!("no MQTT broker configured; notifications go to the log");
            Box::new(LogNotifier)
        }
    };
    let dispatcher = NotificationDispatcher::spawn(notifier)?;

    let control = Arc::new(Control::new());
    let api_config = ApiConfig {
        addr: cfg.api_addr.clone(),
        token_path: cfg.api_token_path.clone(),
        db_path: cfg.db_path.clone(),
        ..ApiConfig::default()
    };
    let api_handle = ApiServer::new(api_config, control.clone()).spawn()?;
    if let Some(path) = &api_handle.token_path {
        log::info!("camera control token written to {}", path.display());
    } else {
        log::warn!(
            "camera control token (handle securely): {}",
            api_handle.token
        );
    }

    let device = device_from_config(&cfg.device_config())?;
    let source = CameraSource::new(
        device,
        cfg.backoff(),
        cfg.camera.max_attempts,
        dispatcher.handle(),
    );
    let tracker = tracker_from_config(
        &cfg.tracker,
        cfg.camera.width,
        cfg.camera.height,
        cfg.counting.line_y,
    )?;
    let store = SqliteSessionStore::open(&cfg.db_path)?;
    let mut driver = PipelineDriver::new(
        source,
        tracker,
        Box::new(store),
        control.clone(),
        dispatcher.handle(),
        cfg.pipeline_settings(),
    )?;

    let shutdown = Arc::new(AtomicBool::new(false));
    let pipeline = {
        let shutdown = shutdown.clone();
        std::thread::Builder::new()
            .name("occupancy-pipeline".to_string())
            .spawn(move || driver.run(&shutdown))?
    };

    let outcome = control.set_active(true, Duration::from_secs(5))?;
    if !outcome.acknowledged {
        log::warn!("pipeline did not acknowledge camera activation in time");
    }

    let (tx, rx) = std::sync::mpsc::channel();
    ctrlc::set_handler(move || {
        let _ = tx.send(());
    })
    .map_err(|e| anyhow!("error setting Ctrl-C handler: {}", e))?;

    log::info!("occupancyd running; waiting for shutdown signal (Ctrl-C)...");
    let _ = rx.recv();
    log::info!("shutdown signal received, stopping pipeline...");

    shutdown.store(true, Ordering::SeqCst);
    // Wake the pipeline out of its tick wait.
    control.set_active(false, Duration::from_secs(2))?;
    match pipeline.join() {
        Ok(result) => result?,
        Err(_) => return Err(anyhow!("pipeline thread panicked")),
    }
    api_handle.stop()?;
    dispatcher.stop();
    log::info!("occupancyd stopped");
    Ok(())
}
