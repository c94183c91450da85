use thiserror::Error;

use crate::common::error::RmError::GenericError;
use crate::launcher::LauncherError;

#[derive(Debug, Error)]
pub enum RmError {
    #[error(transparent)]
    IoError(#[from] std::io::Error),
    #[error(transparent)]
    LauncherError(#[from] LauncherError),
    #[error("Resource pool '{0}' not found")]
    PoolNotFound(String),
    #[error("Resource pool '{pool}' is provided by partition '{partition}', which does not exist")]
    ProviderPartitionMissing { pool: String, partition: String },
    #[error("Agent '{0}' not found")]
    AgentNotFound(String),
    #[error("{0} is not supported by the dispatcher resource manager")]
    Unsupported(String),
    #[error("The resource manager is not running")]
    ManagerStopped,
    #[error("Store error: {0}")]
    StoreError(String),
    #[error("Configuration error: {0}")]
    ConfigError(String),
    #[error("Serialization error: {0}")]
    SerializationError(String),
    #[error("Deserialization error: {0}")]
    DeserializationError(String),
    #[error("Error: {0}")]
    GenericError(String),
}

impl From<serde_json::error::Error> for RmError {
    fn from(e: serde_json::error::Error) -> Self {
        Self::SerializationError(e.to_string())
    }
}

impl From<serde_yaml::Error> for RmError {
    fn from(e: serde_yaml::Error) -> Self {
        Self::DeserializationError(e.to_string())
    }
}

impl From<toml::de::Error> for RmError {
    fn from(error: toml::de::Error) -> Self {
        Self::DeserializationError(error.to_string())
    }
}

impl From<anyhow::Error> for RmError {
    fn from(error: anyhow::Error) -> Self {
        Self::GenericError(error.to_string())
    }
}

impl From<String> for RmError {
    fn from(e: String) -> Self {
        GenericError(e)
    }
}
