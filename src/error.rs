// Error types for the appservice runtime
// Each subsystem has its own error enum; this aggregates them for the
// public API surface

use thiserror::Error;

pub type Result<T> = std::result::Result<T, AppserviceError>;

#[derive(Error, Debug)]
pub enum AppserviceError {
    #[error("Namespace error: {0}")]
    Namespace(#[from] crate::namespace::NamespaceError),

    #[error("Intent error: {0}")]
    Intent(#[from] crate::intent::IntentError),

    #[error("Client error: {0}")]
    Client(#[from] crate::client::ClientError),

    #[error("Join error: {0}")]
    Join(#[from] crate::join_strategy::JoinStrategyError),

    #[error("Storage error: {0}")]
    Storage(#[from] crate::storage::StorageError),

    #[error("Crypto error: {0}")]
    Crypto(#[from] crate::crypto::CryptoError),

    #[error("Registration file error: {0}")]
    RegistrationFile(#[from] crate::registration::RegistrationFileError),

    #[error("Network error: {0}")]
    NetworkError(String),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),
}

// HTTP status code mapping for surfacing errors to the homeserver
impl AppserviceError {
    pub fn status_code(&self) -> u16 {
        match self {
            AppserviceError::Namespace(e) => e.status_code(),
            AppserviceError::Intent(e) => e.status_code(),
            AppserviceError::Client(e) => e.status_code(),
            AppserviceError::Join(e) => e.status_code(),
            AppserviceError::Storage(e) => e.status_code(),
            AppserviceError::Crypto(e) => e.status_code(),
            AppserviceError::RegistrationFile(_) => 500,
            AppserviceError::NetworkError(_) => 503,
            AppserviceError::SerializationError(_) => 400,
        }
    }

    pub fn error_code(&self) -> &'static str {
        match self {
            AppserviceError::Namespace(e) => e.error_code(),
            AppserviceError::Intent(e) => e.error_code(),
            AppserviceError::Client(e) => e.error_code(),
            AppserviceError::Join(e) => e.error_code(),
            AppserviceError::Storage(e) => e.error_code(),
            AppserviceError::Crypto(e) => e.error_code(),
            AppserviceError::RegistrationFile(_) => "M_UNKNOWN",
            AppserviceError::NetworkError(_) => "M_UNKNOWN",
            AppserviceError::SerializationError(_) => "M_BAD_JSON",
        }
    }
}
