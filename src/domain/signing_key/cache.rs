use std::{collections::BTreeMap, sync::Arc};

use jsonwebtoken::{
    jwk::{Jwk, JwkSet},
    DecodingKey,
};
use tokio::sync::RwLock;
use tracing::debug;

use crate::domain::Result;

use super::AsymSigningKey;

#[derive(Clone)]
pub struct VerificationKey {
    pub jwk: Jwk,
    pub decoding_key: DecodingKey,
}

/// Verification keys indexed by `kid`.
#[derive(Clone, Default)]
pub struct KeySet {
    keys: BTreeMap<String, VerificationKey>,
}
impl KeySet {
    /// Builds the set from every row carrying a public key; rows still being
    /// created are skipped.
    pub fn try_from_keys(keys: &[AsymSigningKey]) -> Result<Self> {
        let mut set = BTreeMap::new();

        for key in keys {
            let Some(mut jwk) = key.jwk()? else {
                continue;
            };
            jwk.common.key_id = Some(key.pub_key_id.clone());

            let decoding_key = DecodingKey::from_jwk(&jwk)?;
            set.insert(key.pub_key_id.clone(), VerificationKey { jwk, decoding_key });
        }

        Ok(Self { keys: set })
    }

    pub fn get(&self, kid: &str) -> Option<VerificationKey> {
        self.keys.get(kid).cloned()
    }

    pub fn contains(&self, kid: &str) -> bool {
        self.keys.contains_key(kid)
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn jwk_set(&self) -> JwkSet {
        JwkSet {
            keys: self.keys.values().map(|key| key.jwk.clone()).collect(),
        }
    }
}

/// Process-local verification cache. Readers take a snapshot; a resync swaps
/// the whole set at once.
#[derive(Default)]
pub struct KeySetCache {
    inner: RwLock<Arc<KeySet>>,
}
impl KeySetCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn snapshot(&self) -> Arc<KeySet> {
        self.inner.read().await.clone()
    }

    pub async fn replace(&self, key_set: KeySet) {
        let key_set = Arc::new(key_set);
        let mut inner = self.inner.write().await;
        debug!(size = key_set.len(), "replacing signing key set");
        *inner = key_set;
    }
}
