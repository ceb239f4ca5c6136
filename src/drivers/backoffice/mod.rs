use std::sync::Arc;

use anyhow::Result;
use comfy_table::Table;
use serde_json::json;
use tracing::info;

use crate::{
    domain::{
        clock::SystemClock,
        signing_key::{
            manager::{SigningKeyConfig, SigningKeyManager},
            token::VerifyRules,
            AsymSigningKey, AsymSigningKeyFilter,
        },
    },
    driven::{broadcast::BroadcastEventBridge, memory::MemoryKeyPlugin},
    drivers::signing_key::storage,
};

pub async fn fetch_keys(config: BackofficeConfig, output: OutputFormat) -> Result<()> {
    let storage = storage(&config.db_path).await?;

    info!("Collecting signing keys");
    let keys = storage.find(&AsymSigningKeyFilter::default()).await?;

    match output {
        OutputFormat::Table => output_table_keys(&keys),
        OutputFormat::Json => output_json_keys(&keys)?,
    }

    Ok(())
}

pub async fn fetch_jwks(config: BackofficeConfig) -> Result<()> {
    let manager = verifier(&config).await?;
    manager.sync_key_set().await?;

    let key_set: serde_json::Value = serde_json::from_slice(&manager.public_key_set().await?)?;
    println!("{}", serde_json::to_string_pretty(&key_set)?);

    Ok(())
}

pub async fn verify_token(
    config: BackofficeConfig,
    token: &str,
    audience: Option<String>,
) -> Result<()> {
    let manager = verifier(&config).await?;
    manager.sync_key_set().await?;

    let rules = VerifyRules {
        audience,
        ..Default::default()
    };
    let output = manager.verify(token, &rules).await?;

    let json = json!({
        "claims": output.claims,
        "private_claims": output.private_claims,
    });
    println!("{}", serde_json::to_string_pretty(&json)?);

    Ok(())
}

/// Manager limited to verification. Nothing here signs or publishes, so the
/// plugin and the bus are never reached.
async fn verifier(config: &BackofficeConfig) -> Result<SigningKeyManager> {
    let storage = storage(&config.db_path).await?;

    Ok(SigningKeyManager::new(
        storage,
        Arc::new(MemoryKeyPlugin::new()),
        Arc::new(BroadcastEventBridge::new(1)),
        Arc::new(SystemClock),
        SigningKeyConfig::new(&config.provider, &config.issuer_url, &config.audience, 0, 0),
    ))
}

fn key_rows(keys: &[AsymSigningKey]) -> Vec<Vec<String>> {
    keys.iter()
        .enumerate()
        .map(|(i, key)| {
            vec![
                (i + 1).to_string(),
                key.id.clone(),
                key.pub_key_id.clone(),
                key.status.to_string(),
                key.plugin_type.clone(),
                key.version.to_string(),
                key.created_at.to_rfc3339(),
                key.updated_at.to_rfc3339(),
            ]
        })
        .collect()
}

fn output_table_keys(keys: &[AsymSigningKey]) {
    let mut table = Table::new();
    table.set_header(vec![
        "",
        "id",
        "kid",
        "status",
        "plugin",
        "version",
        "createdAt",
        "updatedAt",
    ]);

    for row in key_rows(keys) {
        table.add_row(row);
    }

    println!("{table}");
}

fn output_json_keys(keys: &[AsymSigningKey]) -> Result<()> {
    let json: Vec<serde_json::Value> = keys
        .iter()
        .map(|key| {
            json!({
                "id": key.id,
                "kid": key.pub_key_id,
                "status": key.status.to_string(),
                "plugin": key.plugin_type,
                "version": key.version,
                "created_at": key.created_at,
                "updated_at": key.updated_at,
            })
        })
        .collect();

    println!("{}", serde_json::to_string_pretty(&json)?);
    Ok(())
}

pub enum OutputFormat {
    Table,
    Json,
}

pub struct BackofficeConfig {
    pub db_path: String,
    pub provider: String,
    pub issuer_url: String,
    pub audience: String,
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use crate::domain::signing_key::AsymSigningKeyStatus;

    use super::*;

    #[test]
    fn it_should_build_one_row_per_key() {
        let creating = AsymSigningKey::new("memory", Utc::now());
        let active = AsymSigningKey {
            status: AsymSigningKeyStatus::Active,
            version: 2,
            ..AsymSigningKey::new("memory", Utc::now())
        };

        let rows = key_rows(&[creating.clone(), active.clone()]);

        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0][1], creating.id);
        assert_eq!(rows[0][3], "creating");
        assert_eq!(rows[1][2], active.pub_key_id);
        assert_eq!(rows[1][5], "2");
    }
}
