use std::{sync::Arc, time::Duration};

use chrono::TimeDelta;
use tokio::time::{sleep, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::domain::{
    clock::Clock,
    error::Error,
    event::{Event, EventDrivenBridge, SigningKeyCreated, SigningKeyDeleted, SigningKeyUpdated},
    Result,
};

use super::{
    cache::{KeySet, KeySetCache},
    AsymSigningKey, AsymSigningKeyFilter, AsymSigningKeyStatus, SigningKeyDrivenStorage,
    SigningKeyDrivenTx, SigningKeyPlugin,
};

/// A `Creating` row older than this is considered abandoned.
pub const CREATION_TIMEOUT: Duration = Duration::from_secs(5 * 60);
pub const WAIT_POLL_INTERVAL: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct SigningKeyConfig {
    pub plugin_type: String,
    pub issuer_url: String,
    pub audience: String,
    /// `None` disables rotation.
    pub rotation_period: Option<TimeDelta>,
    pub decommission_period: TimeDelta,
    pub creation_timeout: Duration,
    pub wait_poll_interval: Duration,
}
impl SigningKeyConfig {
    pub fn new(
        plugin_type: &str,
        issuer_url: &str,
        audience: &str,
        rotation_period_days: u32,
        decommission_period_days: u32,
    ) -> Self {
        let rotation_period = (rotation_period_days > 0)
            .then(|| TimeDelta::days(rotation_period_days.into()));

        Self {
            plugin_type: plugin_type.into(),
            issuer_url: issuer_url.into(),
            audience: audience.into(),
            rotation_period,
            decommission_period: TimeDelta::days(decommission_period_days.into()),
            creation_timeout: CREATION_TIMEOUT,
            wait_poll_interval: WAIT_POLL_INTERVAL,
        }
    }
}

/// Writes either straight to storage or inside an open transaction.
#[derive(Clone, Copy)]
enum Writer<'a> {
    Storage(&'a dyn SigningKeyDrivenStorage),
    Tx(&'a dyn SigningKeyDrivenTx),
}
impl Writer<'_> {
    async fn create(&self, key: &AsymSigningKey) -> Result<AsymSigningKey> {
        match self {
            Self::Storage(storage) => storage.create(key).await,
            Self::Tx(tx) => tx.create(key).await,
        }
    }
    async fn update(&self, key: &AsymSigningKey) -> Result<AsymSigningKey> {
        match self {
            Self::Storage(storage) => storage.update(key).await,
            Self::Tx(tx) => tx.update(key).await,
        }
    }
    async fn delete(&self, key: &AsymSigningKey) -> Result<()> {
        match self {
            Self::Storage(storage) => storage.delete(key).await,
            Self::Tx(tx) => tx.delete(key).await,
        }
    }
}

pub struct SigningKeyManager {
    pub(super) storage: Arc<dyn SigningKeyDrivenStorage>,
    pub(super) plugin: Arc<dyn SigningKeyPlugin>,
    pub(super) event: Arc<dyn EventDrivenBridge>,
    pub(super) clock: Arc<dyn Clock>,
    pub(super) cache: Arc<KeySetCache>,
    pub(super) config: SigningKeyConfig,
}
impl SigningKeyManager {
    pub fn new(
        storage: Arc<dyn SigningKeyDrivenStorage>,
        plugin: Arc<dyn SigningKeyPlugin>,
        event: Arc<dyn EventDrivenBridge>,
        clock: Arc<dyn Clock>,
        config: SigningKeyConfig,
    ) -> Self {
        Self {
            storage,
            plugin,
            event,
            clock,
            cache: Arc::new(KeySetCache::new()),
            config,
        }
    }

    pub fn cache(&self) -> Arc<KeySetCache> {
        self.cache.clone()
    }

    pub fn config(&self) -> &SigningKeyConfig {
        &self.config
    }

    pub fn rotation_enabled(&self) -> bool {
        self.config.rotation_period.is_some()
    }

    /// Recovers from crashed peers and makes sure exactly one key is active
    /// before any token is issued or verified.
    pub async fn initialize(&self, token: &CancellationToken) -> Result<()> {
        self.delete_expired_creating_keys().await?;

        let keys = self
            .storage
            .find(&AsymSigningKeyFilter::status(&[
                AsymSigningKeyStatus::Creating,
                AsymSigningKeyStatus::Active,
            ]))
            .await?;

        let active = keys
            .iter()
            .find(|key| key.status == AsymSigningKeyStatus::Active)
            .cloned();

        let key = match active {
            Some(key) => {
                info!(id = key.id, kid = key.pub_key_id, "using existing active signing key");
                key
            }
            None if keys.is_empty() => match self.create_key().await {
                Ok(key) => key,
                Err(Error::Conflict(message)) => {
                    info!(reason = message, "signing key created by another instance, waiting for it");
                    self.wait_for_active_key(token).await?
                }
                Err(error) => return Err(error),
            },
            None => {
                info!("signing key creation in progress on another instance, waiting for it");
                self.wait_for_active_key(token).await?
            }
        };

        if key.plugin_type != self.config.plugin_type {
            return Err(Error::Configuration(format!(
                "active signing key uses plugin {} but {} is configured",
                key.plugin_type, self.config.plugin_type
            )));
        }

        self.sync_key_set().await?;

        if self.rotation_enabled() && !self.plugin.supports_rotation() {
            return Err(Error::Configuration(format!(
                "signing key plugin {} does not support key rotation",
                self.config.plugin_type
            )));
        }

        Ok(())
    }

    /// Creates a new active key outside of any transaction. Fails with
    /// [`Error::Conflict`] when a peer created one first.
    pub async fn create_key(&self) -> Result<AsymSigningKey> {
        let key = self
            .create_key_with(Writer::Storage(self.storage.as_ref()))
            .await?;

        info!(id = key.id, kid = key.pub_key_id, "signing key created");
        self.notify(SigningKeyCreated::from(&key).into()).await;

        Ok(key)
    }

    async fn create_key_with(&self, writer: Writer<'_>) -> Result<AsymSigningKey> {
        let key = writer
            .create(&AsymSigningKey::new(
                &self.config.plugin_type,
                self.clock.now(),
            ))
            .await?;

        let plugin_key = match self.plugin.create(&key.id).await {
            Ok(plugin_key) => plugin_key,
            Err(error) => {
                error!(id = key.id, error = error.to_string(), "signing key plugin failed to create key");
                self.discard_creating_key(writer, &key, None).await?;
                return Err(error);
            }
        };

        let mut jwk = plugin_key.public_key;
        jwk.common.key_id = Some(key.pub_key_id.clone());

        let active = AsymSigningKey {
            status: AsymSigningKeyStatus::Active,
            public_key: Some(serde_json::to_vec(&jwk)?),
            plugin_data: Some(plugin_key.plugin_data.clone()),
            updated_at: self.clock.now(),
            ..key.clone()
        };

        match writer.update(&active).await {
            Ok(active) => Ok(active),
            Err(error) => {
                self.discard_creating_key(writer, &key, Some(&plugin_key.plugin_data))
                    .await?;
                Err(error)
            }
        }
    }

    /// Best-effort removal of a key whose creation did not complete. A failed
    /// row deletion is reported to the caller and never retried here.
    async fn discard_creating_key(
        &self,
        writer: Writer<'_>,
        key: &AsymSigningKey,
        plugin_data: Option<&[u8]>,
    ) -> Result<()> {
        if let Some(plugin_data) = plugin_data {
            if let Err(error) = self.plugin.delete(&key.id, plugin_data).await {
                warn!(id = key.id, error = error.to_string(), "failed to delete orphan plugin key");
            }
        }

        if let Err(error) = writer.delete(key).await {
            error!(id = key.id, error = error.to_string(), "failed to delete creating signing key");
            return Err(Error::Unexpected(format!(
                "failed to delete creating signing key {}: {error}",
                key.id
            )));
        }

        Ok(())
    }

    /// Polls until a peer's key becomes active.
    pub async fn wait_for_active_key(&self, token: &CancellationToken) -> Result<AsymSigningKey> {
        let deadline = Instant::now() + self.config.creation_timeout;

        loop {
            if let Some(key) = self.find_active_key().await? {
                return Ok(key);
            }

            if Instant::now() >= deadline {
                return Err(Error::Timeout(
                    "timed out waiting for an active signing key".into(),
                ));
            }

            tokio::select! {
                _ = token.cancelled() => {
                    return Err(Error::Canceled(
                        "canceled while waiting for an active signing key".into(),
                    ));
                }
                _ = sleep(self.config.wait_poll_interval) => {}
            }
        }
    }

    /// Deletes `Creating` rows left behind by processes that died mid
    /// creation. Returns how many rows were removed.
    pub async fn delete_expired_creating_keys(&self) -> Result<usize> {
        let timeout = TimeDelta::from_std(self.config.creation_timeout)?;
        let now = self.clock.now();

        let keys = self
            .storage
            .find(&AsymSigningKeyFilter::status(&[AsymSigningKeyStatus::Creating]))
            .await?;

        let mut deleted = 0;
        for key in keys.iter().filter(|key| now - key.created_at > timeout) {
            match self.storage.delete(key).await {
                Ok(()) => {
                    info!(id = key.id, "deleted abandoned creating signing key");
                    deleted += 1;
                }
                Err(Error::Conflict(_)) => {
                    debug!(id = key.id, "abandoned creating signing key already handled");
                }
                Err(error) => return Err(error),
            }
        }

        Ok(deleted)
    }

    pub async fn active_key(&self) -> Result<AsymSigningKey> {
        self.find_active_key()
            .await?
            .ok_or_else(|| Error::NotFound("no active signing key found".into()))
    }

    async fn find_active_key(&self) -> Result<Option<AsymSigningKey>> {
        let mut keys = self
            .storage
            .find(&AsymSigningKeyFilter::status(&[AsymSigningKeyStatus::Active]))
            .await?;

        if keys.len() > 1 {
            warn!(count = keys.len(), "more than one active signing key found");
        }

        keys.sort_by_key(|key| key.created_at);
        Ok(keys.pop())
    }

    /// Rotates the active key when it is older than the rotation period.
    /// Returns the replacement key when a rotation happened.
    pub async fn rotate_if_expired(&self) -> Result<Option<AsymSigningKey>> {
        let Some(rotation_period) = self.config.rotation_period else {
            return Ok(None);
        };

        let current = self.active_key().await?;
        if self.clock.now() - current.created_at <= rotation_period {
            return Ok(None);
        }

        info!(id = current.id, "active signing key expired, rotating");
        self.rotate(current).await.map(Some)
    }

    /// Decommissions `current` and creates its replacement in one
    /// transaction, so peers never observe a state without an active key.
    pub async fn rotate(&self, current: AsymSigningKey) -> Result<AsymSigningKey> {
        let tx = self.storage.begin().await?;

        let result: Result<(AsymSigningKey, AsymSigningKey)> = async {
            let decommissioned = tx
                .update(&AsymSigningKey {
                    status: AsymSigningKeyStatus::Decommissioning,
                    updated_at: self.clock.now(),
                    ..current
                })
                .await?;
            let replacement = self.create_key_with(Writer::Tx(tx.as_ref())).await?;

            Ok((decommissioned, replacement))
        }
        .await;

        let (decommissioned, replacement) = match result {
            Ok(keys) => keys,
            Err(error) => {
                if let Err(rollback_error) = tx.rollback().await {
                    warn!(error = rollback_error.to_string(), "failed to rollback key rotation");
                }
                return Err(error);
            }
        };
        if let Err(error) = tx.commit().await {
            if let Some(plugin_data) = replacement.plugin_data.as_deref() {
                if let Err(delete_error) = self.plugin.delete(&replacement.id, plugin_data).await {
                    warn!(
                        id = replacement.id,
                        error = delete_error.to_string(),
                        "failed to delete orphan plugin key"
                    );
                }
            }
            return Err(error);
        }

        info!(
            decommissioned = decommissioned.id,
            active = replacement.id,
            "signing key rotated"
        );
        self.notify(SigningKeyUpdated::from(&decommissioned).into())
            .await;
        self.notify(SigningKeyCreated::from(&replacement).into())
            .await;
        self.sync_key_set().await?;

        Ok(replacement)
    }

    /// Deletes every decommissioned key past its grace period, first the row
    /// and then the plugin's key material. A failure on one key does not stop
    /// the others. Returns how many keys were deleted.
    pub async fn delete_decommissioned_keys(&self) -> Result<usize> {
        let now = self.clock.now();

        let keys = self
            .storage
            .find(&AsymSigningKeyFilter::status(&[
                AsymSigningKeyStatus::Decommissioning,
            ]))
            .await?;

        let expired: Vec<&AsymSigningKey> = keys
            .iter()
            .filter(|key| now - key.updated_at > self.config.decommission_period)
            .collect();

        let mut deleted = 0;
        for key in expired.iter() {
            match self.delete_decommissioned_key(key).await {
                Ok(()) => deleted += 1,
                Err(error) => error!(
                    id = key.id,
                    error = error.to_string(),
                    "failed to delete decommissioned signing key"
                ),
            }
        }

        if !expired.is_empty() {
            self.sync_key_set().await?;
        }

        Ok(deleted)
    }

    async fn delete_decommissioned_key(&self, key: &AsymSigningKey) -> Result<()> {
        self.storage.delete(key).await?;
        self.notify(
            SigningKeyDeleted {
                id: key.id.clone(),
                pub_key_id: key.pub_key_id.clone(),
                deleted_at: self.clock.now(),
            }
            .into(),
        )
        .await;

        if let Some(plugin_data) = key.plugin_data.as_deref() {
            self.plugin.delete(&key.id, plugin_data).await?;
        }

        info!(id = key.id, "decommissioned signing key deleted");
        Ok(())
    }

    /// Rebuilds the verification cache from every key carrying a public key.
    pub async fn sync_key_set(&self) -> Result<()> {
        let keys = self
            .storage
            .find(&AsymSigningKeyFilter {
                status: vec![],
                public_key_not_empty: true,
            })
            .await?;

        let key_set = KeySet::try_from_keys(&keys)?;
        self.cache.replace(key_set).await;

        Ok(())
    }

    async fn notify(&self, event: Event) {
        let key = event.key();
        if let Err(error) = self.event.dispatch(event).await {
            warn!(event = key, error = error.to_string(), "failed to dispatch signing key event");
        }
    }
}
