//! Asymmetric signing keys used to issue and verify the service's JWTs.
//!
//! Every API process shares the same key rows. A key moves through
//! `Creating -> Active -> Decommissioning` and is then removed; at most one
//! row is `Active` at any instant. Peers coordinate through optimistic
//! concurrency on the rows, surfaced as [`Error::Conflict`].

use std::{fmt::Display, str::FromStr};

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use chrono::{DateTime, Utc};
use jsonwebtoken::jwk::{
    AlgorithmParameters, CommonParameters, EllipticCurve, Jwk, OctetKeyPairParameters,
    OctetKeyPairType,
};
use uuid::Uuid;

use super::{error::Error, Result};

pub mod cache;
pub mod manager;
pub mod token;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AsymSigningKeyStatus {
    Creating,
    Active,
    Decommissioning,
}
impl FromStr for AsymSigningKeyStatus {
    type Err = Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "creating" => Ok(Self::Creating),
            "active" => Ok(Self::Active),
            "decommissioning" => Ok(Self::Decommissioning),
            _ => Err(Error::Unexpected("signing key status not supported".into())),
        }
    }
}
impl Display for AsymSigningKeyStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Creating => write!(f, "creating"),
            Self::Active => write!(f, "active"),
            Self::Decommissioning => write!(f, "decommissioning"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AsymSigningKey {
    pub id: String,
    pub status: AsymSigningKeyStatus,
    pub plugin_type: String,
    pub pub_key_id: String,
    /// JSON encoded JWK, absent while the key is still being created.
    pub public_key: Option<Vec<u8>>,
    pub plugin_data: Option<Vec<u8>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub version: i64,
}
impl AsymSigningKey {
    pub fn new(plugin_type: &str, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            status: AsymSigningKeyStatus::Creating,
            plugin_type: plugin_type.into(),
            pub_key_id: Uuid::new_v4().to_string(),
            public_key: None,
            plugin_data: None,
            created_at: now,
            updated_at: now,
            version: 0,
        }
    }

    pub fn jwk(&self) -> Result<Option<Jwk>> {
        match self.public_key.as_deref() {
            Some(public_key) if !public_key.is_empty() => {
                Ok(Some(serde_json::from_slice(public_key)?))
            }
            _ => Ok(None),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct AsymSigningKeyFilter {
    /// Empty means any status.
    pub status: Vec<AsymSigningKeyStatus>,
    pub public_key_not_empty: bool,
}
impl AsymSigningKeyFilter {
    pub fn status(status: &[AsymSigningKeyStatus]) -> Self {
        Self {
            status: status.to_vec(),
            public_key_not_empty: false,
        }
    }
}

/// Row storage for signing keys.
///
/// `update` and `delete` compare the row version with the stored one and
/// fail with [`Error::Conflict`] on mismatch. `create` fails with
/// [`Error::Conflict`] when it would produce a second `Creating` or `Active`
/// row.
#[async_trait::async_trait]
pub trait SigningKeyDrivenStorage: Send + Sync {
    async fn find(&self, filter: &AsymSigningKeyFilter) -> Result<Vec<AsymSigningKey>>;
    async fn create(&self, key: &AsymSigningKey) -> Result<AsymSigningKey>;
    async fn update(&self, key: &AsymSigningKey) -> Result<AsymSigningKey>;
    async fn delete(&self, key: &AsymSigningKey) -> Result<()>;
    async fn begin(&self) -> Result<Box<dyn SigningKeyDrivenTx>>;
}

/// Write operations bound to one database transaction. Dropping it without
/// `commit` rolls the transaction back.
#[async_trait::async_trait]
pub trait SigningKeyDrivenTx: Send + Sync {
    async fn create(&self, key: &AsymSigningKey) -> Result<AsymSigningKey>;
    async fn update(&self, key: &AsymSigningKey) -> Result<AsymSigningKey>;
    async fn delete(&self, key: &AsymSigningKey) -> Result<()>;
    async fn commit(self: Box<Self>) -> Result<()>;
    async fn rollback(self: Box<Self>) -> Result<()>;
}

/// OKP JWK for a raw 32 byte Ed25519 public key.
pub fn ed25519_jwk(public_key: &[u8]) -> Jwk {
    Jwk {
        common: CommonParameters::default(),
        algorithm: AlgorithmParameters::OctetKeyPair(OctetKeyPairParameters {
            key_type: OctetKeyPairType::OctetKeyPair,
            curve: EllipticCurve::Ed25519,
            x: URL_SAFE_NO_PAD.encode(public_key),
        }),
    }
}

pub struct PluginKey {
    pub public_key: Jwk,
    pub plugin_data: Vec<u8>,
}

/// Crypto backend owning the private half of every signing key.
#[cfg_attr(test, mockall::automock)]
#[async_trait::async_trait]
pub trait SigningKeyPlugin: Send + Sync {
    fn supports_rotation(&self) -> bool;
    async fn create(&self, key_id: &str) -> Result<PluginKey>;
    async fn sign(
        &self,
        payload: &[u8],
        key_id: &str,
        plugin_data: &[u8],
        pub_key_id: &str,
    ) -> Result<Vec<u8>>;
    async fn delete(&self, key_id: &str, plugin_data: &[u8]) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn it_should_parse_status() {
        for status in [
            AsymSigningKeyStatus::Creating,
            AsymSigningKeyStatus::Active,
            AsymSigningKeyStatus::Decommissioning,
        ] {
            assert_eq!(status.to_string().parse::<AsymSigningKeyStatus>().unwrap(), status);
        }
        assert!("deleted".parse::<AsymSigningKeyStatus>().is_err());
    }

    #[test]
    fn it_should_return_no_jwk_while_creating() {
        let key = AsymSigningKey::new("memory", Utc::now());

        assert!(key.jwk().unwrap().is_none());
    }
}
