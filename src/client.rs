//! HTTP client for the collection service and the remote config document.
//!
//! Every call is best-effort: failures are logged and reported as a
//! [`Delivery`] value, never returned as an error, and nothing is retried.
//! The collection service accepts only `200 OK` and `201 Created` as success.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Method, RequestBuilder, StatusCode};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::config::{normalize_base_url, AgentSettings, OperatingConfig};
use crate::model::{LogEvent, Sample};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery {
    /// The service answered 200 or 201.
    Delivered(StatusCode),
    /// The service answered with any other status.
    Rejected(StatusCode),
    /// The request never got a response.
    Failed(String),
}

impl Delivery {
    pub fn is_delivered(&self) -> bool {
        matches!(self, Delivery::Delivered(_))
    }
}

/// Operating parameters published by the remote config document.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RemoteConfig {
    pub base_url: String,
    #[serde(rename = "interval")]
    pub interval_secs: i64,
}

impl RemoteConfig {
    /// Normalized base URL and interval, if both are acceptable.
    pub fn validated(&self) -> Option<(String, u64)> {
        if self.interval_secs <= 0 {
            warn!(interval = self.interval_secs, "Remote config interval must be positive");
            return None;
        }
        match normalize_base_url(&self.base_url) {
            Ok(base_url) => Some((base_url, self.interval_secs as u64)),
            Err(e) => {
                warn!(error = %e, "Remote config base_url rejected");
                None
            }
        }
    }
}

/// Errors raised while building the client.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("client configuration error: {0}")]
    Config(#[from] reqwest::Error),
}

#[async_trait]
pub trait LogSink: Send + Sync {
    async fn submit_log(&self, event: &LogEvent);
}

/// Source of the remote operating parameters.
#[async_trait]
pub trait RemoteConfigSource: Send + Sync {
    /// `None` when the document could not be fetched or parsed.
    async fn fetch_remote_config(&self) -> Option<RemoteConfig>;
}

/// HTTP client for readings, log events and the remote config document.
///
/// Credentials are not stored here; each submission takes the current
/// [`OperatingConfig`] so a reconciled base URL applies immediately.
pub struct RemoteClient {
    client: Client,
    config_url: String,
}

impl RemoteClient {
    pub fn new(settings: &AgentSettings) -> Result<Self, ClientError> {
        Self::with_settings(settings.remote_config_url.clone(), settings.request_timeout)
    }

    pub fn with_settings(
        config_url: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, ClientError> {
        let client = Client::builder()
            .timeout(timeout)
            .pool_max_idle_per_host(2)
            .pool_idle_timeout(Duration::from_secs(90))
            .build()?;

        Ok(Self {
            client,
            config_url: config_url.into(),
        })
    }

    pub async fn submit_sample(&self, config: &OperatingConfig, sample: &Sample) -> Delivery {
        self.post(config, &config.endpoint("readings"), &sample.payload())
            .await
    }

    pub async fn submit_log(&self, config: &OperatingConfig, event: &LogEvent) -> Delivery {
        self.post(config, &config.endpoint("logs"), event).await
    }

    /// A [`LogSink`] bound to a read-only snapshot of `config`.
    pub fn log_sink<'a>(&'a self, config: &'a OperatingConfig) -> RemoteLogSink<'a> {
        RemoteLogSink {
            client: self,
            config,
        }
    }

    async fn post<T: Serialize + ?Sized>(
        &self,
        config: &OperatingConfig,
        url: &str,
        body: &T,
    ) -> Delivery {
        let request = self
            .client
            .post(url)
            .basic_auth(&config.user_token, Some(&config.auth_token))
            .json(body);

        match exchange(Method::POST, url, request).await {
            Err(e) => Delivery::Failed(e),
            Ok((status, body)) => {
                let summary = summarize(&Method::POST, url, status, &body);
                if is_accepted(status) {
                    info!("{}", summary);
                    Delivery::Delivered(status)
                } else {
                    error!("{}", summary);
                    Delivery::Rejected(status)
                }
            }
        }
    }
}

/// Send `request` and collect status and body. A transport failure is logged
/// here at debug, since there is no response to summarize.
async fn exchange(
    method: Method,
    url: &str,
    request: RequestBuilder,
) -> Result<(StatusCode, String), String> {
    let response = match request.send().await {
        Ok(response) => response,
        Err(e) => {
            debug!(error = %e, "{} {}: no response", method, url);
            return Err(e.to_string());
        }
    };

    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    Ok((status, body))
}

fn summarize(method: &Method, url: &str, status: StatusCode, body: &str) -> String {
    format!(
        "{} {}: {} {} {}",
        method,
        url,
        status.as_u16(),
        status.canonical_reason().unwrap_or(""),
        body
    )
}

fn is_accepted(status: StatusCode) -> bool {
    status == StatusCode::OK || status == StatusCode::CREATED
}

#[async_trait]
impl RemoteConfigSource for RemoteClient {
    /// Unauthenticated GET of the fixed config document.
    async fn fetch_remote_config(&self) -> Option<RemoteConfig> {
        let url = self.config_url.as_str();
        let (status, body) = exchange(Method::GET, url, self.client.get(url))
            .await
            .ok()?;
        let summary = summarize(&Method::GET, url, status, &body);

        if !is_accepted(status) {
            error!("{}", summary);
            return None;
        }

        match serde_json::from_str::<RemoteConfig>(&body) {
            Ok(remote) => {
                info!("{}", summary);
                Some(remote)
            }
            Err(e) => {
                error!(error = %e, "{}", summary);
                None
            }
        }
    }
}

/// [`LogSink`] that forwards events to the collection service.
pub struct RemoteLogSink<'a> {
    client: &'a RemoteClient,
    config: &'a OperatingConfig,
}

#[async_trait]
impl<'a> LogSink for RemoteLogSink<'a> {
    async fn submit_log(&self, event: &LogEvent) {
        self.client.submit_log(self.config, event).await;
    }
}
