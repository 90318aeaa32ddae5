//! AQIoT Agent - particulate sensor telemetry for the field
//!
//! Polls a PMS5003 sensor, posts each reading to the collection service and
//! keeps its base URL and polling interval in sync with a remote config
//! document.
//!
//! ## Configuration
//!
//! Operating parameters (base URL, credentials, interval) live in a JSON
//! file. Process settings are loaded from environment variables:
//!
//! - `AQIOT_CONFIG_PATH`: Operating config file (default: config.json)
//! - `AQIOT_REMOTE_CONFIG_URL`: Remote config document (default: https://krupp.dev/aqiot/config.json)
//! - `AQIOT_SENSOR_DEVICE`: Serial device of the sensor (default: /dev/ttyS0)
//! - `AQIOT_SENSOR_TIMEOUT_MS`: Time allowed for one sensor frame (default: 2000)
//! - `AQIOT_RETRY_DELAY_MS`: Pause before each sensor read attempt (default: 1000)
//! - `AQIOT_ESCALATION_THRESHOLD`: Consecutive failures before escalating (default: 100)
//! - `AQIOT_REQUEST_TIMEOUT_SECS`: HTTP request timeout (default: 30)
//! - `RUST_LOG`: Logging level filter (default: info)
//!
//! The process exits with status 1 if the operating config cannot be loaded
//! or the sensor device is unusable, and with status 0 after Ctrl+C/SIGTERM.

use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use aqiot_agent::agent::Agent;
use aqiot_agent::client::RemoteClient;
use aqiot_agent::config::{AgentSettings, FileConfigStore};
use aqiot_agent::sensor::{Pms5003, RetryPolicy, SensorReader};

#[tokio::main]
async fn main() {
    // Initialize tracing subscriber with environment filter
    init_tracing();

    info!("Starting AQIoT agent...");

    let settings = match AgentSettings::from_env() {
        Ok(settings) => {
            info!(
                config_path = %settings.config_path.display(),
                remote_config_url = %settings.remote_config_url,
                sensor_device = %settings.sensor_device.display(),
                "Settings loaded"
            );
            settings
        }
        Err(e) => {
            error!(error = %e, "Failed to load settings");
            std::process::exit(1);
        }
    };

    let client = match RemoteClient::new(&settings) {
        Ok(client) => client,
        Err(e) => {
            error!(error = %e, "Failed to create HTTP client");
            std::process::exit(1);
        }
    };

    let reader = SensorReader::new(
        Pms5003::from_settings(&settings),
        RetryPolicy::from_settings(&settings),
    );
    let store = FileConfigStore::new(&settings.config_path);

    let mut agent = match Agent::initialize(store, client, reader).await {
        Ok(agent) => agent,
        Err(e) => {
            error!(error = %e, "Config not loading properly");
            std::process::exit(1);
        }
    };

    let cancel = CancellationToken::new();
    tokio::spawn(shutdown_on_signal(cancel.clone()));

    if let Err(e) = agent.run(&cancel).await {
        error!(error = %e, "AQIoT agent stopped");
        std::process::exit(1);
    }

    info!("AQIoT agent stopped");
}

/// Initialize the tracing subscriber with environment-based filtering.
fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .compact()
        .init();
}

/// Cancel `cancel` on Ctrl+C or, on Unix, SIGTERM.
async fn shutdown_on_signal(cancel: CancellationToken) {
    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            if let Err(e) = result {
                error!(error = %e, "Failed to listen for shutdown signal");
                return;
            }
        }
        _ = terminate => {}
    }

    info!("Shutdown signal received, stopping...");
    cancel.cancel();
}
