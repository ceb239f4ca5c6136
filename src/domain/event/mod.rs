use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::Result;

use super::{
    error::Error,
    signing_key::{AsymSigningKey, AsymSigningKeyStatus},
};

macro_rules! into_event {
    ($name:ident) => {
        impl From<$name> for Event {
            fn from(value: $name) -> Self {
                Self::$name(value)
            }
        }
    };
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SigningKeyCreated {
    pub id: String,
    pub pub_key_id: String,
    pub status: String,
    pub created_at: DateTime<Utc>,
}
into_event!(SigningKeyCreated);
impl From<&AsymSigningKey> for SigningKeyCreated {
    fn from(value: &AsymSigningKey) -> Self {
        Self {
            id: value.id.clone(),
            pub_key_id: value.pub_key_id.clone(),
            status: value.status.to_string(),
            created_at: value.created_at,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SigningKeyUpdated {
    pub id: String,
    pub pub_key_id: String,
    pub status: String,
    pub updated_at: DateTime<Utc>,
}
into_event!(SigningKeyUpdated);
impl From<&AsymSigningKey> for SigningKeyUpdated {
    fn from(value: &AsymSigningKey) -> Self {
        Self {
            id: value.id.clone(),
            pub_key_id: value.pub_key_id.clone(),
            status: value.status.to_string(),
            updated_at: value.updated_at,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SigningKeyDeleted {
    pub id: String,
    pub pub_key_id: String,
    pub deleted_at: DateTime<Utc>,
}
into_event!(SigningKeyDeleted);

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
#[allow(clippy::enum_variant_names)]
pub enum Event {
    SigningKeyCreated(SigningKeyCreated),
    SigningKeyUpdated(SigningKeyUpdated),
    SigningKeyDeleted(SigningKeyDeleted),
}
impl Event {
    pub fn key(&self) -> String {
        match self {
            Event::SigningKeyCreated(_) => "SigningKeyCreated".into(),
            Event::SigningKeyUpdated(_) => "SigningKeyUpdated".into(),
            Event::SigningKeyDeleted(_) => "SigningKeyDeleted".into(),
        }
    }
    pub fn from_key(key: &str, payload: &[u8]) -> Result<Self> {
        match key {
            "SigningKeyCreated" => Ok(Self::SigningKeyCreated(serde_json::from_slice(payload)?)),
            "SigningKeyUpdated" => Ok(Self::SigningKeyUpdated(serde_json::from_slice(payload)?)),
            "SigningKeyDeleted" => Ok(Self::SigningKeyDeleted(serde_json::from_slice(payload)?)),
            _ => Err(Error::Unexpected(format!(
                "Event key '{}' not implemented",
                key
            ))),
        }
    }
    pub fn status(&self) -> Option<AsymSigningKeyStatus> {
        match self {
            Event::SigningKeyCreated(evt) => evt.status.parse().ok(),
            Event::SigningKeyUpdated(evt) => evt.status.parse().ok(),
            Event::SigningKeyDeleted(_) => None,
        }
    }
}

#[cfg_attr(test, mockall::automock)]
#[async_trait::async_trait]
pub trait EventDrivenBridge: Send + Sync {
    async fn dispatch(&self, event: Event) -> Result<()>;
}

/// Consumer side of the change-notification bus.
///
/// `Ok(None)` means the stream is closed and no further events will arrive.
#[async_trait::async_trait]
pub trait EventDrivenSubscriber: Send + Sync {
    async fn next(&self) -> Result<Option<Event>>;
}
