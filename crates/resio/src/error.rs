use reqwest::StatusCode;
use std::error::Error as StdError;

// Custom error type for fetch operations
#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("invalid resource key: {0}")]
    InvalidKey(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("server returned status code {0}")]
    Status(StatusCode),

    #[error("fetch failed: {0}")]
    Failed(Box<dyn StdError + Send + Sync>), // Generic transport error
}

impl FetchError {
    /// Wrap an arbitrary transport failure.
    pub fn failed<E>(err: E) -> Self
    where
        E: StdError + Send + Sync + 'static,
    {
        FetchError::Failed(Box::new(err))
    }
}
