use thiserror::Error;

use crate::common::error::ServerError::GenericError;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error(transparent)]
    IoError(#[from] std::io::Error),
    #[error("Serialization error: {0}")]
    SerializationError(String),
    #[error("Configuration error: {0}")]
    ConfigError(String),
    #[error(transparent)]
    CoreError(#[from] spalloc_core::Error),
    #[error("Protocol error: {0}")]
    ProtocolError(String),
    #[error("Error: {0}")]
    GenericError(String),
}

impl From<serde_json::error::Error> for ServerError {
    fn from(e: serde_json::error::Error) -> Self {
        Self::SerializationError(e.to_string())
    }
}

impl From<bincode::Error> for ServerError {
    fn from(e: bincode::Error) -> Self {
        Self::SerializationError(e.to_string())
    }
}

impl From<toml::de::Error> for ServerError {
    fn from(error: toml::de::Error) -> Self {
        Self::ConfigError(error.to_string())
    }
}

impl From<tokio_util::codec::LinesCodecError> for ServerError {
    fn from(error: tokio_util::codec::LinesCodecError) -> Self {
        Self::ProtocolError(error.to_string())
    }
}

impl From<String> for ServerError {
    fn from(e: String) -> Self {
        GenericError(e)
    }
}

pub fn protocol_error<T>(message: String) -> crate::Result<T> {
    Err(ServerError::ProtocolError(message))
}
