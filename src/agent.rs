//! The control loop: reconcile, read, record, report, sleep.
//!
//! [`Agent::initialize`] is the initializing state; failure there is fatal
//! for the process. [`Agent::run`] is the running state and only returns on
//! cancellation or a fatal sensor error.

use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::client::{Delivery, RemoteClient};
use crate::config::{ConfigError, ConfigStore, OperatingConfig};
use crate::model::{LogEvent, Sample};
use crate::sensor::{SampleSource, SensorError, SensorReader};
use crate::sync::{ConfigSync, Reconciled};

/// Reasons the agent stops.
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("unable to load config: {0}")]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Sensor(#[from] SensorError),
}

/// What happened during one cycle, minus the sleep.
#[derive(Debug)]
pub struct CycleReport {
    pub reconciled: Reconciled,
    pub sample: Sample,
    pub delivery: Delivery,
}

/// Owns the operating config and drives the sensor, sync and client.
pub struct Agent<T, S> {
    config: OperatingConfig,
    client: RemoteClient,
    reader: SensorReader<T>,
    sync: ConfigSync<S>,
}

impl<T: SampleSource, S: ConfigStore> Agent<T, S> {
    /// Load the operating config and assemble the agent.
    ///
    /// # Errors
    ///
    /// Returns `AgentError::Config` if the config is missing, unreadable or
    /// invalid.
    pub async fn initialize(
        store: S,
        client: RemoteClient,
        reader: SensorReader<T>,
    ) -> Result<Self, AgentError> {
        let config = store.load().await?;

        Ok(Self {
            config,
            client,
            reader,
            sync: ConfigSync::new(store),
        })
    }

    pub fn config(&self) -> &OperatingConfig {
        &self.config
    }

    /// Run cycles until `cancel` fires.
    ///
    /// Returns `Ok(())` on cancellation and an error only for a fatal sensor
    /// failure.
    pub async fn run(&mut self, cancel: &CancellationToken) -> Result<(), AgentError> {
        info!(
            config = ?self.config,
            retry_delay_ms = self.reader.policy().delay.as_millis() as u64,
            escalation_threshold = self.reader.policy().escalation_threshold,
            "Starting AQIoT service"
        );
        self.client
            .submit_log(&self.config, &LogEvent::power_on())
            .await;

        loop {
            match self.run_cycle(cancel).await {
                Ok(report) => {
                    if !report.delivery.is_delivered() {
                        warn!(delivery = ?report.delivery, "Reading dropped");
                    }
                }
                Err(SensorError::Cancelled) => break,
                Err(e) => return Err(e.into()),
            }

            // Read after reconcile so a new interval applies to this cycle.
            let interval = self.config.interval();
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(interval) => {}
            }
        }

        info!("Control loop stopped");
        Ok(())
    }

    /// One cycle without the trailing sleep.
    pub async fn run_cycle(
        &mut self,
        cancel: &CancellationToken,
    ) -> Result<CycleReport, SensorError> {
        let reconciled = self.sync.reconcile(&self.client, &mut self.config).await;

        let sample = {
            let sink = self.client.log_sink(&self.config);
            self.reader.read_sample(&sink, cancel).await?
        };

        info!("{}", sample);

        let delivery = self.client.submit_sample(&self.config, &sample).await;

        Ok(CycleReport {
            reconciled,
            sample,
            delivery,
        })
    }
}
