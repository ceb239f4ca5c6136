use tokio::sync::{
    broadcast::{self, error::RecvError},
    Mutex,
};
use tracing::warn;

use crate::domain::{
    event::{Event, EventDrivenBridge, EventDrivenSubscriber},
    Result,
};

/// In-process bus for deployments where every manager shares one process.
pub struct BroadcastEventBridge {
    sender: broadcast::Sender<Event>,
}
impl BroadcastEventBridge {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn subscribe(&self) -> BroadcastEventSubscriber {
        BroadcastEventSubscriber {
            receiver: Mutex::new(self.sender.subscribe()),
        }
    }
}
#[async_trait::async_trait]
impl EventDrivenBridge for BroadcastEventBridge {
    async fn dispatch(&self, event: Event) -> Result<()> {
        // No subscriber is not an error.
        let _ = self.sender.send(event);
        Ok(())
    }
}

pub struct BroadcastEventSubscriber {
    receiver: Mutex<broadcast::Receiver<Event>>,
}
#[async_trait::async_trait]
impl EventDrivenSubscriber for BroadcastEventSubscriber {
    async fn next(&self) -> Result<Option<Event>> {
        let mut receiver = self.receiver.lock().await;
        loop {
            match receiver.recv().await {
                Ok(event) => return Ok(Some(event)),
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "event subscriber lagged behind");
                }
                Err(RecvError::Closed) => return Ok(None),
            }
        }
    }
}
