use std::collections::HashMap;

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use chrono::{DateTime, Utc};
use jsonwebtoken::{decode, decode_header, Algorithm, Header, Validation};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::domain::{error::Error, Result};

use super::manager::SigningKeyManager;

/// Caller claims are embedded under this prefix so they never shadow the
/// registered ones.
pub const PRIVATE_CLAIM_PREFIX: &str = "keyward_";
/// Tolerated clock skew between issuer and verifier, in seconds.
pub const CLOCK_LEEWAY: i64 = 60;

#[derive(Debug, Clone, Default)]
pub struct TokenInput {
    pub subject: String,
    /// Defaults to the configured audience.
    pub audience: Option<String>,
    pub expiration: Option<DateTime<Utc>>,
    pub jwt_id: Option<String>,
    pub claims: HashMap<String, String>,
}

/// Additional checks applied after signature and registered claims pass.
#[derive(Debug, Clone, Default)]
pub struct VerifyRules {
    pub audience: Option<String>,
    /// Private claims (without prefix) that must be present with this value.
    pub required_claims: HashMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StandardClaims {
    pub iss: String,
    pub sub: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aud: Option<String>,
    pub iat: i64,
    pub nbf: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exp: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jti: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct TokenClaims {
    #[serde(flatten)]
    standard: StandardClaims,
    #[serde(flatten)]
    extra: HashMap<String, Value>,
}

#[derive(Debug, Clone)]
pub struct VerifyTokenOutput {
    pub claims: StandardClaims,
    pub private_claims: HashMap<String, String>,
}

impl SigningKeyManager {
    /// Signs a new token with the key currently active in storage.
    pub async fn issue(&self, input: TokenInput) -> Result<String> {
        let key = self.active_key().await?;
        let plugin_data = key.plugin_data.as_deref().ok_or_else(|| {
            Error::Unexpected(format!("active signing key {} has no plugin data", key.id))
        })?;

        let now = self.clock.now().timestamp();
        let claims = TokenClaims {
            standard: StandardClaims {
                iss: self.config.issuer_url.clone(),
                sub: input.subject,
                aud: Some(input.audience.unwrap_or_else(|| self.config.audience.clone())),
                iat: now,
                nbf: now,
                exp: input.expiration.map(|exp| exp.timestamp()),
                jti: input.jwt_id,
            },
            extra: input
                .claims
                .into_iter()
                .map(|(name, value)| (format!("{PRIVATE_CLAIM_PREFIX}{name}"), Value::String(value)))
                .collect(),
        };

        let mut header = Header::new(Algorithm::EdDSA);
        header.kid = Some(key.pub_key_id.clone());

        let signing_input = format!(
            "{}.{}",
            URL_SAFE_NO_PAD.encode(serde_json::to_vec(&header)?),
            URL_SAFE_NO_PAD.encode(serde_json::to_vec(&claims)?)
        );

        let signature = self
            .plugin
            .sign(
                signing_input.as_bytes(),
                &key.id,
                plugin_data,
                &key.pub_key_id,
            )
            .await
            .map_err(|error| Error::Unexpected(format!("failed to sign token: {error}")))?;

        Ok(format!(
            "{signing_input}.{}",
            URL_SAFE_NO_PAD.encode(signature)
        ))
    }

    /// Verifies a token against the cached key set. An unknown `kid` forces a
    /// single resync before the token is rejected.
    pub async fn verify(&self, token: &str, rules: &VerifyRules) -> Result<VerifyTokenOutput> {
        let result = self.verify_token(token, rules).await;
        if let Err(error) = &result {
            debug!(error = error.to_string(), "token rejected");
        }
        result
    }

    async fn verify_token(&self, token: &str, rules: &VerifyRules) -> Result<VerifyTokenOutput> {
        let header = decode_header(token)
            .map_err(|error| Error::InvalidToken(format!("malformed token header: {error}")))?;
        let kid = header
            .kid
            .ok_or_else(|| Error::InvalidToken("token header has no key id".into()))?;

        let verification_key = match self.cache.snapshot().await.get(&kid) {
            Some(key) => key,
            None => {
                self.sync_key_set().await?;
                self.cache
                    .snapshot()
                    .await
                    .get(&kid)
                    .ok_or_else(|| Error::InvalidToken(format!("unknown key id {kid}")))?
            }
        };

        let mut validation = Validation::new(Algorithm::EdDSA);
        validation.set_issuer(&[self.config.issuer_url.as_str()]);
        validation.set_required_spec_claims(&["iss", "sub"]);
        validation.validate_exp = false;
        validation.validate_nbf = false;
        match &rules.audience {
            Some(audience) => validation.set_audience(&[audience.as_str()]),
            None => validation.validate_aud = false,
        }

        let data = decode::<TokenClaims>(token, &verification_key.decoding_key, &validation)
            .map_err(|error| Error::InvalidToken(format!("token validation failed: {error}")))?;
        let claims = data.claims;

        let now = self.clock.now().timestamp();
        if claims.standard.exp.is_some_and(|exp| exp + CLOCK_LEEWAY < now) {
            return Err(Error::InvalidToken("token expired".into()));
        }
        if claims.standard.nbf - CLOCK_LEEWAY > now {
            return Err(Error::InvalidToken("token not valid yet".into()));
        }

        let private_claims: HashMap<String, String> = claims
            .extra
            .into_iter()
            .filter_map(|(name, value)| {
                let name = name.strip_prefix(PRIVATE_CLAIM_PREFIX)?.to_string();
                let value = match value {
                    Value::String(value) => value,
                    value => value.to_string(),
                };
                Some((name, value))
            })
            .collect();

        for (name, expected) in &rules.required_claims {
            if private_claims.get(name) != Some(expected) {
                return Err(Error::InvalidToken(format!(
                    "claim {name} does not match the expected value"
                )));
            }
        }

        Ok(VerifyTokenOutput {
            claims: claims.standard,
            private_claims,
        })
    }

    /// JSON encoded JWKS of every key in the cache.
    pub async fn public_key_set(&self) -> Result<Vec<u8>> {
        let key_set = self.cache.snapshot().await;
        Ok(serde_json::to_vec(&key_set.jwk_set())?)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::TimeDelta;
    use jsonwebtoken::{encode, jwk::JwkSet, EncodingKey};
    use tokio_util::sync::CancellationToken;

    use crate::domain::clock::Clock;
    use crate::domain::signing_key::{
        manager::{
            tests::{Backend, CountingStorage},
            SigningKeyConfig,
        },
        AsymSigningKeyStatus,
    };

    use super::*;

    fn token_input() -> TokenInput {
        TokenInput {
            subject: "user-1".into(),
            claims: HashMap::from([("role".into(), "admin".into())]),
            ..Default::default()
        }
    }

    async fn initialized(backend: &Backend) -> SigningKeyManager {
        let manager = backend.manager();
        manager.initialize(&CancellationToken::new()).await.unwrap();
        manager
    }

    #[tokio::test]
    async fn it_should_verify_token_issued_after_initialization() {
        let backend = Backend::new().await;
        let manager = initialized(&backend).await;

        let token = manager.issue(token_input()).await.unwrap();
        let output = manager.verify(&token, &VerifyRules::default()).await.unwrap();

        assert_eq!(output.claims.sub, "user-1");
        assert_eq!(output.claims.iss, "https://keyward.test");
        assert_eq!(output.claims.aud.as_deref(), Some("keyward"));
        assert_eq!(output.private_claims.get("role").map(String::as_str), Some("admin"));
    }

    #[tokio::test]
    async fn it_should_put_active_kid_in_token_header() {
        let backend = Backend::new().await;
        let manager = initialized(&backend).await;

        let token = manager.issue(token_input()).await.unwrap();
        let header = decode_header(&token).unwrap();

        assert_eq!(header.alg, Algorithm::EdDSA);
        assert_eq!(header.kid, Some(manager.active_key().await.unwrap().pub_key_id));
    }

    #[tokio::test]
    async fn it_should_fail_issue_without_active_key() {
        let backend = Backend::new().await;
        let manager = backend.manager();

        let result = manager.issue(token_input()).await;

        assert!(matches!(result, Err(Error::NotFound(_))));
    }

    #[tokio::test]
    async fn it_should_verify_tokens_across_rotation_until_grace_period_ends() {
        let backend = Backend::new().await;
        let manager = initialized(&backend).await;

        backend.clock.advance(TimeDelta::minutes(30));
        let token = manager.issue(token_input()).await.unwrap();

        backend.clock.advance(TimeDelta::minutes(31));
        assert!(manager.rotate_if_expired().await.unwrap().is_some());

        backend.clock.advance(TimeDelta::minutes(4));
        assert_eq!(manager.delete_decommissioned_keys().await.unwrap(), 0);
        assert!(manager.verify(&token, &VerifyRules::default()).await.is_ok());

        backend.clock.advance(TimeDelta::minutes(60));
        assert_eq!(manager.delete_decommissioned_keys().await.unwrap(), 1);
        let result = manager.verify(&token, &VerifyRules::default()).await;

        assert!(matches!(result, Err(Error::InvalidToken(_))));
        assert_eq!(backend.keys(AsymSigningKeyStatus::Active).await.len(), 1);
    }

    #[tokio::test]
    async fn it_should_resync_once_on_cache_miss() {
        let backend = Backend::new().await;
        let issuer = initialized(&backend).await;
        let token = issuer.issue(token_input()).await.unwrap();

        let storage = Arc::new(CountingStorage::new(backend.storage.clone()));
        let verifier = SigningKeyManager::new(
            storage.clone(),
            backend.plugin.clone(),
            backend.event.clone(),
            backend.clock.clone(),
            SigningKeyConfig::default(),
        );

        assert!(verifier.verify(&token, &VerifyRules::default()).await.is_ok());
        assert_eq!(storage.public_key_reads(), 1);

        assert!(verifier.verify(&token, &VerifyRules::default()).await.is_ok());
        assert_eq!(storage.public_key_reads(), 1);
    }

    #[tokio::test]
    async fn it_should_fail_with_unknown_kid_after_one_resync() {
        let other = Backend::new().await;
        let foreign = initialized(&other).await.issue(token_input()).await.unwrap();

        let backend = Backend::new().await;
        initialized(&backend).await;
        let storage = Arc::new(CountingStorage::new(backend.storage.clone()));
        let verifier = SigningKeyManager::new(
            storage.clone(),
            backend.plugin.clone(),
            backend.event.clone(),
            backend.clock.clone(),
            SigningKeyConfig::default(),
        );

        let result = verifier.verify(&foreign, &VerifyRules::default()).await;

        assert!(matches!(result, Err(Error::InvalidToken(_))));
        assert_eq!(storage.public_key_reads(), 1);
    }

    #[tokio::test]
    async fn it_should_reject_token_without_kid() {
        let backend = Backend::new().await;
        let manager = initialized(&backend).await;
        let token = encode(
            &Header::default(),
            &serde_json::json!({ "iss": "https://keyward.test", "sub": "user-1" }),
            &EncodingKey::from_secret(b"secret"),
        )
        .unwrap();

        let result = manager.verify(&token, &VerifyRules::default()).await;

        assert!(matches!(result, Err(Error::InvalidToken(_))));
    }

    #[tokio::test]
    async fn it_should_reject_malformed_token() {
        let backend = Backend::new().await;
        let manager = initialized(&backend).await;

        let result = manager.verify("not-a-token", &VerifyRules::default()).await;

        assert!(matches!(result, Err(Error::InvalidToken(_))));
    }

    #[tokio::test]
    async fn it_should_reject_tampered_token() {
        let backend = Backend::new().await;
        let manager = initialized(&backend).await;
        let token = manager.issue(token_input()).await.unwrap();

        let forged = manager
            .issue(TokenInput {
                subject: "user-2".into(),
                ..token_input()
            })
            .await
            .unwrap();
        let mut parts: Vec<&str> = token.split('.').collect();
        parts[1] = forged.split('.').nth(1).unwrap();

        let result = manager.verify(&parts.join("."), &VerifyRules::default()).await;

        assert!(matches!(result, Err(Error::InvalidToken(_))));
    }

    #[tokio::test]
    async fn it_should_reject_expired_token() {
        let backend = Backend::new().await;
        let manager = initialized(&backend).await;
        let token = manager
            .issue(TokenInput {
                expiration: Some(backend.clock.now() + TimeDelta::minutes(1)),
                ..token_input()
            })
            .await
            .unwrap();

        assert!(manager.verify(&token, &VerifyRules::default()).await.is_ok());

        backend.clock.advance(TimeDelta::minutes(5));
        let result = manager.verify(&token, &VerifyRules::default()).await;

        assert!(matches!(result, Err(Error::InvalidToken(_))));
    }

    #[tokio::test]
    async fn it_should_reject_token_from_other_issuer() {
        let backend = Backend::new().await;
        let manager = initialized(&backend).await;
        let token = manager.issue(token_input()).await.unwrap();

        let verifier = backend.manager_with(SigningKeyConfig {
            issuer_url: "https://other.test".into(),
            ..Default::default()
        });
        let result = verifier.verify(&token, &VerifyRules::default()).await;

        assert!(matches!(result, Err(Error::InvalidToken(_))));
    }

    #[tokio::test]
    async fn it_should_apply_verify_rules() {
        let backend = Backend::new().await;
        let manager = initialized(&backend).await;
        let token = manager.issue(token_input()).await.unwrap();

        let matching = VerifyRules {
            audience: Some("keyward".into()),
            required_claims: HashMap::from([("role".into(), "admin".into())]),
        };
        assert!(manager.verify(&token, &matching).await.is_ok());

        let wrong_audience = VerifyRules {
            audience: Some("billing".into()),
            ..Default::default()
        };
        let result = manager.verify(&token, &wrong_audience).await;
        assert!(matches!(result, Err(Error::InvalidToken(_))));

        let wrong_claim = VerifyRules {
            required_claims: HashMap::from([("role".into(), "viewer".into())]),
            ..Default::default()
        };
        let result = manager.verify(&token, &wrong_claim).await;
        assert!(matches!(result, Err(Error::InvalidToken(_))));
    }

    #[tokio::test]
    async fn it_should_publish_key_set() {
        let backend = Backend::new().await;
        let manager = initialized(&backend).await;
        let active = manager.active_key().await.unwrap();

        let jwks: JwkSet = serde_json::from_slice(&manager.public_key_set().await.unwrap()).unwrap();

        assert_eq!(jwks.keys.len(), 1);
        assert!(jwks.find(&active.pub_key_id).is_some());
    }
}
