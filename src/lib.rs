//! AQIoT Agent Library
//!
//! Components of a field agent that polls a PMS5003 particulate sensor and
//! reports readings to a remote collection service:
//!
//! - **config**: Environment settings and the persisted operating config
//! - **model**: Samples, log events and their wire formats
//! - **sensor**: PMS5003 transport and the retrying sensor reader
//! - **client**: Best-effort HTTP client for readings, logs and remote config
//! - **sync**: Reconciliation of the operating config with the remote copy
//! - **agent**: The control loop tying everything together
//!
//! # Example
//!
//! ```no_run
//! use aqiot_agent::agent::Agent;
//! use aqiot_agent::client::RemoteClient;
//! use aqiot_agent::config::{AgentSettings, FileConfigStore};
//! use aqiot_agent::sensor::{Pms5003, RetryPolicy, SensorReader};
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() {
//!     let settings = AgentSettings::from_env().expect("Failed to load settings");
//!
//!     let client = RemoteClient::new(&settings).expect("Failed to create client");
//!     let reader = SensorReader::new(
//!         Pms5003::from_settings(&settings),
//!         RetryPolicy::from_settings(&settings),
//!     );
//!     let store = FileConfigStore::new(&settings.config_path);
//!
//!     let mut agent = Agent::initialize(store, client, reader)
//!         .await
//!         .expect("Failed to load config");
//!     agent.run(&CancellationToken::new()).await.ok();
//! }
//! ```

// Module declarations
pub mod agent;
pub mod client;
pub mod config;
pub mod model;
pub mod sensor;
pub mod sync;

#[cfg(test)]
mod test_support;

// Re-export commonly used types at crate root for convenience
pub use agent::{Agent, AgentError, CycleReport};
pub use client::{ClientError, Delivery, LogSink, RemoteClient, RemoteConfig, RemoteConfigSource};
pub use config::{AgentSettings, ConfigError, ConfigStore, FileConfigStore, OperatingConfig};
pub use model::{LogCode, LogEvent, ReadingPayload, Sample, Severity};
pub use sensor::{Pms5003, RetryPolicy, SampleSource, SensorError, SensorReader, TransportError};
pub use sync::{ConfigSync, Reconciled};
