use std::{collections::HashMap, env, time::Duration};

use anyhow::Result;
use dotenv::dotenv;
use keyward::drivers::signing_key::{SigningKeyDriverConfig, VaultPluginConfig};
use serde::Deserialize;
use tracing::Level;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();

    let env_filter = EnvFilter::builder()
        .with_default_directive(Level::INFO.into())
        .with_env_var("RUST_LOG")
        .from_env_lossy();

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(env_filter)
        .init();

    let config = Config::new()?;

    keyward::drivers::signing_key::run(config.into()).await
}

fn default_provider() -> String {
    "memory".into()
}
fn default_rotation_period_days() -> u32 {
    30
}
fn default_decommission_period_days() -> u32 {
    7
}
fn default_check_interval() -> u64 {
    3600
}
fn default_jwks_addr() -> String {
    "0.0.0.0:8080".into()
}
fn default_topic() -> String {
    "events".into()
}

#[derive(Debug, Deserialize)]
struct VaultConfig {
    address: String,
    token: String,
    mount: String,
}

#[derive(Debug, Deserialize)]
struct Config {
    db_path: String,
    issuer_url: String,
    audience: String,
    #[serde(default = "default_provider")]
    provider: String,
    vault: Option<VaultConfig>,
    #[serde(default = "default_rotation_period_days")]
    rotation_period_days: u32,
    #[serde(default = "default_decommission_period_days")]
    decommission_period_days: u32,
    /// Seconds between rotation and cleanup checks.
    #[serde(default = "default_check_interval")]
    check_interval: u64,
    #[serde(default = "default_jwks_addr")]
    jwks_addr: String,
    #[serde(default = "default_topic")]
    topic: String,
    #[serde(default)]
    kafka_producer: HashMap<String, String>,
    #[serde(default)]
    kafka_consumer: HashMap<String, String>,
}
impl Config {
    pub fn new() -> Result<Self> {
        let config = config::Config::builder()
            .add_source(
                config::File::with_name(&env::var("DAEMON_CONFIG").unwrap_or("daemon.toml".into()))
                    .required(false),
            )
            .add_source(config::Environment::with_prefix("daemon").separator("__"))
            .build()?
            .try_deserialize()?;

        Ok(config)
    }
}

impl From<Config> for SigningKeyDriverConfig {
    fn from(value: Config) -> Self {
        Self {
            db_path: value.db_path,
            provider: value.provider,
            vault: value.vault.map(|vault| VaultPluginConfig {
                address: vault.address,
                token: vault.token,
                mount: vault.mount,
            }),
            issuer_url: value.issuer_url,
            audience: value.audience,
            rotation_period_days: value.rotation_period_days,
            decommission_period_days: value.decommission_period_days,
            check_interval: Duration::from_secs(value.check_interval),
            jwks_addr: value.jwks_addr,
            topic: value.topic,
            kafka_producer: value.kafka_producer,
            kafka_consumer: value.kafka_consumer,
        }
    }
}
