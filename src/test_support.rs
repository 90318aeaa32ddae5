//! In-memory stand-ins for the agent's collaborators.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::client::LogSink;
use crate::config::{ConfigError, ConfigStore, OperatingConfig};
use crate::model::{LogEvent, Sample};
use crate::sensor::{SampleSource, TransportError};

/// Plays back a fixed list of attempt outcomes, then fails transiently forever.
pub struct ScriptedSource {
    pub script: VecDeque<Result<Sample, TransportError>>,
    pub attempts: Arc<AtomicUsize>,
    cancel_after: Option<(usize, CancellationToken)>,
}

impl ScriptedSource {
    pub fn new(script: Vec<Result<Sample, TransportError>>) -> Self {
        Self {
            script: script.into(),
            attempts: Arc::new(AtomicUsize::new(0)),
            cancel_after: None,
        }
    }

    pub fn failing_then(failures: usize, sample: Sample) -> Self {
        let mut script: Vec<_> = (0..failures)
            .map(|i| Err(TransportError::Transient(format!("timeout {}", i))))
            .collect();
        script.push(Ok(sample));
        Self::new(script)
    }

    /// Cancel `token` during attempt number `attempt` (1-based).
    pub fn cancel_on(mut self, attempt: usize, token: CancellationToken) -> Self {
        self.cancel_after = Some((attempt, token));
        self
    }
}

#[async_trait]
impl SampleSource for ScriptedSource {
    async fn read(&mut self) -> Result<Sample, TransportError> {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some((limit, token)) = &self.cancel_after {
            if attempt >= *limit {
                token.cancel();
            }
        }
        self.script
            .pop_front()
            .unwrap_or_else(|| Err(TransportError::Transient("script exhausted".to_string())))
    }
}

/// Records events with the transport attempt count at the time of submission.
pub struct RecordingSink {
    events: Mutex<Vec<(LogEvent, usize)>>,
    attempts: Arc<AtomicUsize>,
}

impl RecordingSink {
    pub fn new(attempts: Arc<AtomicUsize>) -> Self {
        Self {
            events: Mutex::new(Vec::new()),
            attempts,
        }
    }

    pub fn events(&self) -> Vec<(LogEvent, usize)> {
        self.events.lock().unwrap().clone()
    }
}

#[async_trait]
impl LogSink for RecordingSink {
    async fn submit_log(&self, event: &LogEvent) {
        let attempts = self.attempts.load(Ordering::SeqCst);
        self.events.lock().unwrap().push((event.clone(), attempts));
    }
}

/// Config store that keeps every saved version.
#[derive(Default)]
pub struct MemoryStore {
    saved: Mutex<Vec<OperatingConfig>>,
    failing_writes: AtomicUsize,
}

impl MemoryStore {
    pub fn with_config(config: OperatingConfig) -> Self {
        Self {
            saved: Mutex::new(vec![config]),
            failing_writes: AtomicUsize::new(0),
        }
    }

    pub fn read_only() -> Self {
        Self::failing_first(usize::MAX)
    }

    /// Reject the first `writes` saves, then accept.
    pub fn failing_first(writes: usize) -> Self {
        Self {
            saved: Mutex::new(Vec::new()),
            failing_writes: AtomicUsize::new(writes),
        }
    }

    /// Number of stored versions, including a seeded one.
    pub fn versions(&self) -> usize {
        self.saved.lock().unwrap().len()
    }
}

#[async_trait]
impl ConfigStore for MemoryStore {
    async fn load(&self) -> Result<OperatingConfig, ConfigError> {
        self.saved
            .lock()
            .unwrap()
            .last()
            .cloned()
            .ok_or_else(|| ConfigError::Invalid {
                field: "config",
                message: "nothing saved".to_string(),
            })
    }

    async fn save(&self, config: &OperatingConfig) -> Result<(), ConfigError> {
        let rejected = self
            .failing_writes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if rejected {
            return Err(ConfigError::Write {
                path: "memory".into(),
                source: std::io::Error::new(std::io::ErrorKind::Other, "read-only"),
            });
        }
        self.saved.lock().unwrap().push(config.clone());
        Ok(())
    }
}

pub fn operating_config(base_url: &str, interval_secs: u64) -> OperatingConfig {
    OperatingConfig::new(base_url, "user", "token", interval_secs).unwrap()
}
