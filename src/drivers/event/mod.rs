use std::sync::Arc;

use anyhow::Result;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument};

use crate::{
    domain::{event::EventDrivenSubscriber, signing_key::manager::SigningKeyManager},
    driven::prometheus::metrics::MetricsDriven,
};

/// Resyncs the key set cache on every signing key notification. Events are
/// only a trigger, the cache is always rebuilt from storage.
#[instrument("signing-key-listener", skip_all)]
pub async fn subscribe(
    manager: Arc<SigningKeyManager>,
    subscriber: Arc<dyn EventDrivenSubscriber>,
    metrics: Arc<MetricsDriven>,
    token: CancellationToken,
) -> Result<()> {
    info!("Subscriber running");
    loop {
        tokio::select! {
            _ = token.cancelled() => {
                info!("listener shutting down");
                return Ok(());
            }
            result = subscriber.next() => match result {
                Ok(Some(event)) => match manager.sync_key_set().await {
                    Ok(()) => {
                        info!(event = event.key(), "signing key set synchronized");
                        metrics.signing_key_operation("sync", "success");
                    }
                    Err(err) => {
                        error!(
                            error = err.to_string(),
                            event = event.key(),
                            "Failed to sync signing key set"
                        );
                        metrics.signing_key_operation("sync", "error");
                    }
                },
                Ok(None) => {
                    info!("event stream closed");
                    return Ok(());
                }
                Err(err) => error!(error = err.to_string(), "event subscribe error"),
            }
        }
    }
}
