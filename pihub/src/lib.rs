pub mod config;
pub mod dispatch;
mod error;
pub mod health;
pub mod hid;
pub mod input;
pub mod keymap;
pub mod metrics;
pub mod network;
pub mod pipeline;
pub mod timing;
mod utils;

use std::sync::Arc;

use anyhow::Context;
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use config::Config;
use dispatch::Dispatcher;
pub use error::AppError;
use health::HealthAggregator;
use hid::{HidChannel, NullTransport};
use input::{DeviceReader, EdgeNormalizer, ReaderConfig};
use keymap::{Keymap, KeymapResolver};
use metrics::RuntimeMetrics;
use network::BackendSession;
use pipeline::Pipeline;
use timing::TimingEngine;

const EDGE_QUEUE_CAPACITY: usize = 64;
const ACTION_QUEUE_CAPACITY: usize = 64;
const COMMAND_QUEUE_CAPACITY: usize = 16;

fn init_logging(debug: bool) -> Result<(), AppError> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(if debug { "debug" } else { "info" }));

    tracing_subscriber::fmt()
        .with_target(false)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .with_env_filter(filter)
        .try_init()
        .map_err(|err| AppError::LoggingInit(err.to_string()))
}

fn init_rustls_crypto_provider() {
    if rustls::crypto::CryptoProvider::get_default().is_some() {
        return;
    }

    if rustls::crypto::ring::default_provider()
        .install_default()
        .is_err()
    {
        warn!("rustls CryptoProvider was already installed");
    } else {
        info!("rustls CryptoProvider initialized with ring");
    }
}

pub fn run() -> anyhow::Result<()> {
    // Config parsing warns about bad values, so the subscriber comes first.
    if let Err(init_err) = init_logging(Config::debug_from_env()) {
        eprintln!("logging bootstrap failed: {init_err}");
    }
    let config = Config::from_env();
    init_rustls_crypto_provider();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to build tokio runtime")?;
    runtime.block_on(serve(config))
}

/// Wires every component, runs until a shutdown signal and tears down in order.
pub async fn serve(config: Config) -> anyhow::Result<()> {
    let token = config.load_token().map_err(AppError::from)?;
    let (keymap_path, keymap) =
        Keymap::load_first(&config.keymap_candidates()).map_err(AppError::from)?;

    info!(
        ws = config.ha_ws_url.as_str(),
        event = config.ha_cmd_event.as_str(),
        activity = config.ha_activity.as_str(),
        keymap = %keymap_path.display(),
        "starting pihub"
    );

    let health = Arc::new(HealthAggregator::new());
    let metrics = RuntimeMetrics::shared();
    let scancode_map = keymap.scancode_map().clone();
    let resolver = Arc::new(KeymapResolver::new(keymap, config.key_timing()));

    let (edge_tx, edge_rx) = mpsc::channel(EDGE_QUEUE_CAPACITY);
    let (action_tx, action_rx) = mpsc::channel(ACTION_QUEUE_CAPACITY);
    let (command_tx, command_rx) = mpsc::channel(COMMAND_QUEUE_CAPACITY);

    let hid = Arc::new(HidChannel::new(
        Arc::new(NullTransport),
        Arc::clone(&health),
    ));
    warn!(
        adapter = config.ble_adapter.as_str(),
        device_name = config.ble_device_name.as_str(),
        "no BLE HID stack linked; continuing without wireless HID"
    );

    let session = Arc::new(BackendSession::new(
        config.session(token),
        Arc::clone(&resolver),
        Arc::clone(&health),
        Arc::clone(&metrics),
        command_tx,
    ));
    let dispatcher = Arc::new(Dispatcher::new(
        Arc::clone(&session),
        Arc::clone(&hid),
        Arc::clone(&metrics),
    ));

    let mut session_task = tokio::spawn(Arc::clone(&session).run());
    let workers = dispatcher.spawn_workers(action_rx, command_rx);
    let pipeline_task = tokio::spawn(
        Pipeline::new(
            TimingEngine::new(config.repeat()),
            Arc::clone(&resolver),
            action_tx,
            Arc::clone(&metrics),
        )
        .run(edge_rx),
    );
    let reader_task = tokio::spawn(
        DeviceReader::new(
            ReaderConfig {
                path: config.usb_device.clone(),
                grab: config.usb_grab,
            },
            EdgeNormalizer::new(scancode_map),
            edge_tx,
            Arc::clone(&health),
            Arc::clone(&metrics),
        )
        .run(),
    );

    info!(
        host = config.health_host.as_str(),
        port = config.health_port,
        "health snapshot ready for the status surface"
    );

    let outcome = tokio::select! {
        _ = shutdown_signal() => {
            info!("shutdown requested");
            Ok(())
        }
        ended = &mut session_task => match ended {
            Ok(Ok(())) => Err(AppError::Runtime("backend session exited".to_string())),
            Ok(Err(err)) => Err(AppError::Backend(err)),
            Err(join_err) => Err(AppError::Runtime(join_err.to_string())),
        },
    };

    reader_task.abort();
    pipeline_task.abort();
    workers.abort();
    session_task.abort();
    if let Err(err) = session.close().await {
        warn!("failed to close backend session: {err}");
    }
    hid.close();

    let report = metrics.lock().await.report();
    for warning in &report.warnings {
        warn!("{warning}");
    }
    match serde_json::to_string(&report) {
        Ok(report) => info!(report, "runtime metrics"),
        Err(err) => warn!("failed to serialize metrics report: {err}"),
    }
    info!(health = ?health.snapshot().status, "pihub stopped");

    if let Err(err) = &outcome {
        error!("pihub stopped on error: {err}");
    }
    outcome.map_err(anyhow::Error::from)
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!("failed to listen for ctrl-c: {err}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};

        match signal(SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(err) => {
                warn!("failed to listen for SIGTERM: {err}");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
