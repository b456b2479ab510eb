use beacon_sam::SamError;
use beacon_storage::StoreError;
use thiserror::Error;

use crate::dispatch::EmailError;

#[derive(Debug, Error)]
pub enum DigestError {
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("another digest run is still in progress")]
    RunInProgress,
    #[error(transparent)]
    Fetch(#[from] SamError),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("sending digest to {recipient}: {source}")]
    Email {
        recipient: String,
        #[source]
        source: EmailError,
    },
}

impl DigestError {
    /// Short code persisted as the run's `err_code`.
    pub fn code(&self) -> &'static str {
        match self {
            DigestError::Config(_) => "CONFIG_INVALID",
            DigestError::RunInProgress => "RUN_IN_PROGRESS",
            DigestError::Fetch(err) => err.code(),
            DigestError::Store(_) => "STORE_ERROR",
            DigestError::Email { .. } => "EMAIL_SEND_FAILED",
        }
    }
}
