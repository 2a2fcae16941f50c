use thiserror::Error;

#[allow(clippy::enum_variant_names)]
#[derive(Debug, Error)]
pub enum SpallocError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Serialization error: {0}")]
    SerializationError(String),
    #[error("Invalid machine: {0}")]
    InvalidMachine(String),
    #[error("Invalid arguments: {0}")]
    InvalidArguments(String),
    #[error("Error: {0}")]
    GenericError(String),
}

impl From<String> for SpallocError {
    fn from(e: String) -> Self {
        Self::GenericError(e)
    }
}

impl From<&str> for SpallocError {
    fn from(e: &str) -> Self {
        Self::GenericError(e.to_string())
    }
}
