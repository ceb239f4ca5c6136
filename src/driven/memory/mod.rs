use std::collections::HashMap;

use ed25519_dalek::{Signer, SigningKey};
use rand::rngs::OsRng;
use tokio::sync::RwLock;
use tracing::debug;

use crate::domain::{
    error::Error,
    signing_key::{ed25519_jwk, PluginKey, SigningKeyPlugin},
    Result,
};

pub const PLUGIN_TYPE: &str = "memory";

/// Ed25519 keys held in process memory. Key material does not survive a
/// restart, so this provider suits tests and single-process deployments.
#[derive(Default)]
pub struct MemoryKeyPlugin {
    keys: RwLock<HashMap<String, SigningKey>>,
}
impl MemoryKeyPlugin {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn contains(&self, key_id: &str) -> bool {
        self.keys.read().await.contains_key(key_id)
    }
}

#[async_trait::async_trait]
impl SigningKeyPlugin for MemoryKeyPlugin {
    fn supports_rotation(&self) -> bool {
        true
    }

    async fn create(&self, key_id: &str) -> Result<PluginKey> {
        let signing_key = SigningKey::generate(&mut OsRng);
        let public_key = ed25519_jwk(&signing_key.verifying_key().to_bytes());

        self.keys
            .write()
            .await
            .insert(key_id.to_string(), signing_key);
        debug!(key_id, "memory signing key generated");

        Ok(PluginKey {
            public_key,
            plugin_data: key_id.as_bytes().to_vec(),
        })
    }

    async fn sign(
        &self,
        payload: &[u8],
        key_id: &str,
        _plugin_data: &[u8],
        _pub_key_id: &str,
    ) -> Result<Vec<u8>> {
        let keys = self.keys.read().await;
        let signing_key = keys
            .get(key_id)
            .ok_or_else(|| Error::Unexpected(format!("memory signing key {key_id} not found")))?;

        Ok(signing_key.sign(payload).to_bytes().to_vec())
    }

    async fn delete(&self, key_id: &str, _plugin_data: &[u8]) -> Result<()> {
        self.keys.write().await.remove(key_id);
        Ok(())
    }
}
