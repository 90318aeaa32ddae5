//! Reconciliation of the local operating config against the remote document.

use tracing::{error, info};

use crate::client::RemoteConfigSource;
use crate::config::{ConfigStore, OperatingConfig};

/// Result of one [`ConfigSync::reconcile`] pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reconciled {
    /// Remote values already match and nothing was waiting to be written.
    Unchanged,
    /// Local values were replaced. `persisted` is false if the save failed.
    Updated { persisted: bool },
    /// Remote values match, but an earlier failed save was attempted again.
    Resaved { persisted: bool },
    /// The remote document could not be fetched or was invalid.
    Unavailable,
}

/// Keeps `base_url` and `interval` in step with the remote document.
///
/// A save that fails is retried on every later pass until one succeeds, so
/// the durable copy catches up with memory even if the remote document
/// stops changing.
pub struct ConfigSync<S> {
    store: S,
    pending_save: bool,
}

impl<S: ConfigStore> ConfigSync<S> {
    pub fn new(store: S) -> Self {
        Self {
            store,
            pending_save: false,
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Fetch the remote document and apply it to `config` if it differs.
    ///
    /// Both fields are replaced together, and the whole config (tokens
    /// included) is persisted only when something changed.
    pub async fn reconcile(
        &mut self,
        remote: &dyn RemoteConfigSource,
        config: &mut OperatingConfig,
    ) -> Reconciled {
        let validated = remote
            .fetch_remote_config()
            .await
            .and_then(|fetched| fetched.validated());
        let Some((base_url, interval_secs)) = validated else {
            if self.pending_save {
                self.persist(config).await;
            }
            return Reconciled::Unavailable;
        };

        if base_url == config.base_url && interval_secs == config.interval_secs {
            if self.pending_save {
                let persisted = self.persist(config).await;
                return Reconciled::Resaved { persisted };
            }
            return Reconciled::Unchanged;
        }

        info!(
            old_base_url = %config.base_url,
            new_base_url = %base_url,
            old_interval = config.interval_secs,
            new_interval = interval_secs,
            "Config being updated"
        );
        config.base_url = base_url;
        config.interval_secs = interval_secs;

        let persisted = self.persist(config).await;
        Reconciled::Updated { persisted }
    }

    async fn persist(&mut self, config: &OperatingConfig) -> bool {
        match self.store.save(config).await {
            Ok(()) => {
                if self.pending_save {
                    info!("Pending config update persisted");
                }
                self.pending_save = false;
                true
            }
            Err(e) => {
                error!(error = %e, "Failed to persist updated config, will retry");
                self.pending_save = true;
                false
            }
        }
    }
}
