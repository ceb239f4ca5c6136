use std::{collections::HashMap, time::Duration};

use rdkafka::{
    consumer::{CommitMode, Consumer, StreamConsumer},
    message::BorrowedMessage,
    producer::{FutureProducer, FutureRecord},
    ClientConfig, Message,
};
use tracing::{error, info};
use uuid::Uuid;

use crate::domain::{
    error::Error,
    event::{Event, EventDrivenBridge, EventDrivenSubscriber},
    Result,
};

fn client_config(properties: &HashMap<String, String>) -> ClientConfig {
    let mut client_config = ClientConfig::new();
    for (k, v) in properties.iter() {
        client_config.set(k, v);
    }
    client_config
}

const DEFAULT_GROUP_ID: &str = "keyward";

/// Consumer settings with a group of its own for this process, so every
/// running instance receives every signing key event.
pub fn consumer_properties(properties: &HashMap<String, String>) -> HashMap<String, String> {
    let mut properties = properties.clone();

    let group = properties
        .get("group.id")
        .cloned()
        .unwrap_or_else(|| DEFAULT_GROUP_ID.into());
    properties.insert("group.id".into(), format!("{group}-{}", Uuid::new_v4()));
    properties.insert("auto.offset.reset".into(), "latest".into());

    properties
}

pub struct KafkaProducer {
    producer: FutureProducer,
    topic: String,
}
impl KafkaProducer {
    pub fn new(topic: &str, properties: &HashMap<String, String>) -> Result<Self> {
        let producer = client_config(properties).create()?;

        Ok(Self {
            producer,
            topic: topic.to_string(),
        })
    }
}
#[async_trait::async_trait]
impl EventDrivenBridge for KafkaProducer {
    async fn dispatch(&self, event: Event) -> Result<()> {
        let key = event.key();
        let payload = serde_json::to_vec(&event)?;

        let record = FutureRecord::to(&self.topic).payload(&payload).key(&key);
        self.producer
            .send(record, Duration::from_secs(5))
            .await
            .map_err(|(err, _)| Error::Unexpected(err.to_string()))?;

        info!(event = key, "event sent");
        Ok(())
    }
}

pub struct KafkaSubscriber {
    consumer: StreamConsumer,
}
impl KafkaSubscriber {
    pub fn new(topic: &str, properties: &HashMap<String, String>) -> Result<Self> {
        let properties = consumer_properties(properties);
        let consumer: StreamConsumer = client_config(&properties).create()?;
        consumer.subscribe(&[topic])?;
        info!(
            group = properties.get("group.id").map(String::as_str),
            topic,
            "kafka subscriber created"
        );

        Ok(Self { consumer })
    }
}
#[async_trait::async_trait]
impl EventDrivenSubscriber for KafkaSubscriber {
    async fn next(&self) -> Result<Option<Event>> {
        loop {
            let message = self.consumer.recv().await?;
            let event = Event::try_from(&message);
            self.consumer.commit_message(&message, CommitMode::Async)?;

            match event {
                Ok(event) => return Ok(Some(event)),
                Err(error) => {
                    error!(error = error.to_string(), "fail to convert message to event")
                }
            }
        }
    }
}

impl TryFrom<&BorrowedMessage<'_>> for Event {
    type Error = Error;

    fn try_from(message: &BorrowedMessage<'_>) -> Result<Self> {
        let key = message
            .key()
            .map(String::from_utf8_lossy)
            .ok_or_else(|| Error::Unexpected("event message without key".into()))?;
        let payload = message
            .payload()
            .ok_or_else(|| Error::Unexpected("event message without payload".into()))?;

        Event::from_key(&key, payload)
    }
}
