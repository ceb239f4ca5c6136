use std::{sync::Arc, time::Duration};

use anyhow::Result;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument};

use crate::{
    domain::{error::Error, signing_key::manager::SigningKeyManager},
    driven::prometheus::metrics::MetricsDriven,
};

/// Rotates the active key once it outlives the rotation period. Returns
/// straight away when rotation is disabled.
#[instrument("signing-key-rotation", skip_all)]
pub async fn schedule_rotation(
    manager: Arc<SigningKeyManager>,
    metrics: Arc<MetricsDriven>,
    period: Duration,
    token: CancellationToken,
) -> Result<()> {
    if !manager.rotation_enabled() {
        info!("signing key rotation disabled");
        return Ok(());
    }

    let mut ticker = tokio::time::interval(period);
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = token.cancelled() => {
                info!("rotation task shutting down");
                return Ok(());
            }
            _ = ticker.tick() => {
                match manager.rotate_if_expired().await {
                    Ok(Some(key)) => {
                        info!(id = key.id, kid = key.pub_key_id, "signing key rotated");
                        metrics.signing_key_operation("rotation", "success");
                    }
                    Ok(None) => debug!("active signing key still valid"),
                    Err(Error::Conflict(message)) => {
                        info!(reason = message, "signing key rotated by another instance");
                        metrics.signing_key_operation("rotation", "conflict");
                    }
                    Err(err) => {
                        error!(error = err.to_string(), "Error running signing key rotation");
                        metrics.signing_key_operation("rotation", "error");
                    }
                }
            }
        }
    }
}

/// Removes abandoned `Creating` rows and decommissioned keys past their
/// grace period.
#[instrument("signing-key-cleanup", skip_all)]
pub async fn schedule_cleanup(
    manager: Arc<SigningKeyManager>,
    metrics: Arc<MetricsDriven>,
    period: Duration,
    token: CancellationToken,
) -> Result<()> {
    let mut ticker = tokio::time::interval(period);
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = token.cancelled() => {
                info!("cleanup task shutting down");
                return Ok(());
            }
            _ = ticker.tick() => {
                if let Err(err) = manager.delete_expired_creating_keys().await {
                    error!(error = err.to_string(), "Error deleting abandoned signing keys");
                }

                match manager.delete_decommissioned_keys().await {
                    Ok(deleted) => {
                        debug!(deleted, "decommissioned signing keys cleaned up");
                        metrics.signing_key_operation("cleanup", "success");
                    }
                    Err(err) => {
                        error!(error = err.to_string(), "Error running signing key cleanup");
                        metrics.signing_key_operation("cleanup", "error");
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeDelta;

    use crate::domain::signing_key::{
        manager::{tests::Backend, SigningKeyConfig},
        AsymSigningKeyStatus,
    };

    use super::*;

    const TICK: Duration = Duration::from_millis(20);

    async fn initialized(backend: &Backend, config: SigningKeyConfig) -> Arc<SigningKeyManager> {
        let manager = Arc::new(backend.manager_with(config));
        manager.initialize(&CancellationToken::new()).await.unwrap();
        manager
    }

    #[tokio::test]
    async fn it_should_rotate_expired_key_on_tick() {
        let backend = Backend::new().await;
        let manager = initialized(&backend, SigningKeyConfig::default()).await;
        let metrics = Arc::new(MetricsDriven::new().unwrap());
        let token = CancellationToken::new();

        backend.clock.advance(TimeDelta::minutes(61));
        let handle = tokio::spawn(schedule_rotation(
            manager.clone(),
            metrics.clone(),
            TICK,
            token.clone(),
        ));
        tokio::time::sleep(TICK * 5).await;
        token.cancel();

        assert!(handle.await.unwrap().is_ok());
        assert_eq!(backend.keys(AsymSigningKeyStatus::Active).await.len(), 1);
        assert_eq!(
            backend.keys(AsymSigningKeyStatus::Decommissioning).await.len(),
            1
        );
        let rotations = metrics
            .signing_key_operations
            .with_label_values(&["rotation", "success"])
            .get();
        assert_eq!(rotations, 1);
    }

    #[tokio::test]
    async fn it_should_return_when_rotation_disabled() {
        let backend = Backend::new().await;
        let manager = initialized(
            &backend,
            SigningKeyConfig {
                rotation_period: None,
                ..Default::default()
            },
        )
        .await;
        let metrics = Arc::new(MetricsDriven::new().unwrap());

        let result =
            schedule_rotation(manager, metrics, TICK, CancellationToken::new()).await;

        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn it_should_stop_rotation_when_cancelled() {
        let backend = Backend::new().await;
        let manager = initialized(&backend, SigningKeyConfig::default()).await;
        let metrics = Arc::new(MetricsDriven::new().unwrap());
        let token = CancellationToken::new();
        token.cancel();

        let result = schedule_rotation(manager, metrics, Duration::from_secs(3600), token).await;

        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn it_should_cleanup_decommissioned_key_on_tick() {
        let backend = Backend::new().await;
        let manager = initialized(&backend, SigningKeyConfig::default()).await;
        let metrics = Arc::new(MetricsDriven::new().unwrap());
        let token = CancellationToken::new();

        backend.clock.advance(TimeDelta::minutes(61));
        manager.rotate_if_expired().await.unwrap();
        backend.clock.advance(TimeDelta::minutes(61));

        let handle = tokio::spawn(schedule_cleanup(
            manager.clone(),
            metrics.clone(),
            TICK,
            token.clone(),
        ));
        tokio::time::sleep(TICK * 5).await;
        token.cancel();

        assert!(handle.await.unwrap().is_ok());
        assert!(backend
            .keys(AsymSigningKeyStatus::Decommissioning)
            .await
            .is_empty());
        assert_eq!(backend.keys(AsymSigningKeyStatus::Active).await.len(), 1);
    }
}
