use std::{collections::HashMap, path::Path, sync::Arc, time::Duration};

use anyhow::Result;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::{
    domain::{
        clock::SystemClock,
        error::Error,
        event::{EventDrivenBridge, EventDrivenSubscriber},
        signing_key::{
            manager::{SigningKeyConfig, SigningKeyManager},
            SigningKeyDrivenStorage, SigningKeyPlugin,
        },
    },
    driven::{
        broadcast::BroadcastEventBridge,
        kafka::{KafkaProducer, KafkaSubscriber},
        memory::{self, MemoryKeyPlugin},
        prometheus::metrics::MetricsDriven,
        sqlite::{signing_key::SqliteSigningKeyDrivenStorage, SqliteState},
        vault::{self, VaultKeyPlugin},
    },
    drivers::{cron, event, jwks},
};

pub async fn storage(db_path: &str) -> Result<Arc<dyn SigningKeyDrivenStorage>> {
    let sqlite = Arc::new(SqliteState::new(Path::new(db_path)).await?);
    sqlite.migrate().await?;

    Ok(Arc::new(SqliteSigningKeyDrivenStorage::new(sqlite)))
}

pub fn plugin(
    provider: &str,
    vault_config: Option<&VaultPluginConfig>,
) -> Result<Arc<dyn SigningKeyPlugin>, Error> {
    match (provider, vault_config) {
        (memory::PLUGIN_TYPE, _) => Ok(Arc::new(MemoryKeyPlugin::new())),
        (vault::PLUGIN_TYPE, Some(config)) => Ok(Arc::new(VaultKeyPlugin::try_new(
            &config.address,
            &config.token,
            &config.mount,
        )?)),
        (vault::PLUGIN_TYPE, None) => Err(Error::Configuration(
            "vault provider requires vault settings".into(),
        )),
        (provider, _) => Err(Error::Configuration(format!(
            "signing key provider {provider} not supported"
        ))),
    }
}

pub async fn run(config: SigningKeyDriverConfig) -> Result<()> {
    config.validate()?;

    let storage = storage(&config.db_path).await?;
    let plugin = plugin(&config.provider, config.vault.as_ref())?;
    let metrics = Arc::new(MetricsDriven::new()?);

    let bridge: Arc<dyn EventDrivenBridge>;
    let subscriber: Arc<dyn EventDrivenSubscriber>;
    if config.kafka_producer.is_empty() {
        info!("kafka not configured, using in-process event bus");
        if config.provider == vault::PLUGIN_TYPE {
            warn!("vault provider without kafka, peer processes will not be notified of key changes");
        }
        let broadcast = BroadcastEventBridge::new(64);
        subscriber = Arc::new(broadcast.subscribe());
        bridge = Arc::new(broadcast);
    } else {
        bridge = Arc::new(KafkaProducer::new(&config.topic, &config.kafka_producer)?);
        subscriber = Arc::new(KafkaSubscriber::new(&config.topic, &config.kafka_consumer)?);
    }

    let manager = Arc::new(SigningKeyManager::new(
        storage,
        plugin,
        bridge,
        Arc::new(SystemClock),
        (&config).into(),
    ));

    let token = CancellationToken::new();
    tokio::spawn({
        let token = token.clone();
        async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => info!("shutdown signal received"),
                Err(err) => error!(error = err.to_string(), "failed to listen for shutdown signal"),
            }
            token.cancel();
        }
    });

    manager.initialize(&token).await?;
    let active = manager.active_key().await?;
    info!(
        id = active.id,
        kid = active.pub_key_id,
        "signing key manager initialized"
    );

    tokio::try_join!(
        cron::schedule_rotation(
            manager.clone(),
            metrics.clone(),
            config.check_interval,
            token.clone()
        ),
        cron::schedule_cleanup(
            manager.clone(),
            metrics.clone(),
            config.check_interval,
            token.clone()
        ),
        event::subscribe(manager.clone(), subscriber, metrics.clone(), token.clone()),
        jwks::server(&config.jwks_addr, manager.clone(), metrics.clone(), token.clone()),
    )?;

    Ok(())
}

#[derive(Debug, Clone)]
pub struct VaultPluginConfig {
    pub address: String,
    pub token: String,
    pub mount: String,
}

pub struct SigningKeyDriverConfig {
    pub db_path: String,
    pub provider: String,
    pub vault: Option<VaultPluginConfig>,
    pub issuer_url: String,
    pub audience: String,
    pub rotation_period_days: u32,
    pub decommission_period_days: u32,
    pub check_interval: Duration,
    pub jwks_addr: String,
    pub topic: String,
    pub kafka_producer: HashMap<String, String>,
    pub kafka_consumer: HashMap<String, String>,
}

impl SigningKeyDriverConfig {
    pub fn validate(&self) -> Result<(), Error> {
        if self.check_interval.is_zero() {
            return Err(Error::Configuration(
                "check interval must be greater than zero".into(),
            ));
        }

        Ok(())
    }
}

impl From<&SigningKeyDriverConfig> for SigningKeyConfig {
    fn from(value: &SigningKeyDriverConfig) -> Self {
        SigningKeyConfig::new(
            &value.provider,
            &value.issuer_url,
            &value.audience,
            value.rotation_period_days,
            value.decommission_period_days,
        )
    }
}
