use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    Conflict(String),
    #[error("{0}")]
    InvalidToken(String),
    #[error("{0}")]
    Configuration(String),
    #[error("{0}")]
    Timeout(String),
    #[error("{0}")]
    Canceled(String),
    #[error("{0}")]
    Unexpected(String),
}
impl Error {
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict(_))
    }
}

// SQLITE_BUSY and SQLITE_BUSY_SNAPSHOT are raised when a peer holds the write lock.
const SQLITE_BUSY_CODES: [&str; 2] = ["5", "517"];

impl From<sqlx::Error> for Error {
    fn from(value: sqlx::Error) -> Self {
        if let sqlx::Error::Database(error) = &value {
            let busy = error
                .code()
                .is_some_and(|code| SQLITE_BUSY_CODES.contains(&code.as_ref()));

            if error.is_unique_violation() || busy {
                return Self::Conflict(format!("signing key write conflict: {}", error.message()));
            }
        }
        Self::Unexpected(value.to_string())
    }
}
impl From<sqlx::migrate::MigrateError> for Error {
    fn from(value: sqlx::migrate::MigrateError) -> Self {
        Self::Unexpected(value.to_string())
    }
}
impl From<serde_json::Error> for Error {
    fn from(value: serde_json::Error) -> Self {
        Self::Unexpected(value.to_string())
    }
}
impl From<base64::DecodeError> for Error {
    fn from(value: base64::DecodeError) -> Self {
        Self::Unexpected(value.to_string())
    }
}
impl From<jsonwebtoken::errors::Error> for Error {
    fn from(value: jsonwebtoken::errors::Error) -> Self {
        Self::Unexpected(value.to_string())
    }
}
impl From<chrono::OutOfRangeError> for Error {
    fn from(value: chrono::OutOfRangeError) -> Self {
        Self::Configuration(value.to_string())
    }
}
impl From<rdkafka::error::KafkaError> for Error {
    fn from(value: rdkafka::error::KafkaError) -> Self {
        Self::Unexpected(value.to_string())
    }
}
impl From<vaultrs::error::ClientError> for Error {
    fn from(value: vaultrs::error::ClientError) -> Self {
        Self::Unexpected(format!("Failed to query vault: {value}"))
    }
}
impl From<vaultrs::client::VaultClientSettingsBuilderError> for Error {
    fn from(value: vaultrs::client::VaultClientSettingsBuilderError) -> Self {
        Self::Unexpected(format!("Failed to create vault client: {value}"))
    }
}
