use std::time::Duration;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use tracing::{debug, error, info, instrument};
use vaultrs::{
    api::transit::{
        requests::{
            CreateKeyRequest, ExportKeyType, ExportVersion, UpdateKeyConfigurationRequest,
        },
        KeyType,
    },
    client::{VaultClient, VaultClientSettingsBuilder},
    token,
    transit::{data, key},
};

use crate::domain::{
    error::Error,
    signing_key::{ed25519_jwk, PluginKey, SigningKeyPlugin},
    Result,
};

pub const PLUGIN_TYPE: &str = "vault";

/// Ed25519 keys kept in a Vault transit engine; private halves never leave
/// Vault. `plugin_data` holds the transit key name.
pub struct VaultKeyPlugin {
    client: VaultClient,
    mount: String,
}
impl VaultKeyPlugin {
    pub fn try_new(address: &str, token: &str, mount: &str) -> Result<Self, Error> {
        let settings = VaultClientSettingsBuilder::default()
            .address(address)
            .token(token)
            .verify(false)
            .build()?;
        let client = VaultClient::new(settings.clone())?;

        // Background thread for token renewal.
        tokio::spawn(run(VaultClient::new(settings)?));
        Ok(Self {
            client,
            mount: mount.into(),
        })
    }

    pub fn key_name(key_id: &str) -> String {
        format!("keyward-{key_id}")
    }

    fn name_from(plugin_data: &[u8]) -> Result<String> {
        String::from_utf8(plugin_data.to_vec())
            .map_err(|err| Error::Unexpected(format!("Invalid vault key name: {err}")))
    }
}

#[async_trait::async_trait]
impl SigningKeyPlugin for VaultKeyPlugin {
    fn supports_rotation(&self) -> bool {
        true
    }

    async fn create(&self, key_id: &str) -> Result<PluginKey> {
        let name = Self::key_name(key_id);

        key::create(
            &self.client,
            &self.mount,
            &name,
            Some(CreateKeyRequest::builder().key_type(KeyType::Ed25519)),
        )
        .await?;

        let response = key::export(
            &self.client,
            &self.mount,
            &name,
            ExportKeyType::PublicKey,
            ExportVersion::Latest,
        )
        .await?;
        let public_key = response
            .keys
            .get("1")
            .ok_or_else(|| Error::Unexpected(format!("Vault returned no public key for {name}")))?;
        let public_key = STANDARD.decode(public_key).map_err(|err| {
            Error::Unexpected(format!("Failed to decode vault response: {:?}", err))
        })?;

        info!(name, "vault signing key created");
        Ok(PluginKey {
            public_key: ed25519_jwk(&public_key),
            plugin_data: name.into_bytes(),
        })
    }

    async fn sign(
        &self,
        payload: &[u8],
        _key_id: &str,
        plugin_data: &[u8],
        _pub_key_id: &str,
    ) -> Result<Vec<u8>> {
        let name = Self::name_from(plugin_data)?;
        let response = data::sign(
            &self.client,
            &self.mount,
            &name,
            &STANDARD.encode(payload),
            None,
        )
        .await?;
        STANDARD
            .decode(response.signature.replace("vault:v1:", ""))
            .map_err(|err| Error::Unexpected(err.to_string()))
    }

    async fn delete(&self, _key_id: &str, plugin_data: &[u8]) -> Result<()> {
        let name = Self::name_from(plugin_data)?;

        key::update(
            &self.client,
            &self.mount,
            &name,
            Some(UpdateKeyConfigurationRequest::builder().deletion_allowed(true)),
        )
        .await?;
        key::delete(&self.client, &self.mount, &name).await?;

        debug!(name, "vault signing key deleted");
        Ok(())
    }
}

#[instrument("vault-token-renewer", skip_all)]
pub async fn run(client: VaultClient) -> Result<()> {
    loop {
        tokio::time::sleep(Duration::from_secs(60)).await;
        match token::renew_self(&client, Some("1h")).await {
            Ok(response) => {
                debug!(response =? response, "renewed vault token");
            }
            Err(err) => {
                error!(err =? err, "failed to renew vault token");
            }
        };
    }
}
