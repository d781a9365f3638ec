use thiserror::Error;

pub type Result<T> = std::result::Result<T, StoreError>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("search error: {0}")]
    Search(String),

    #[error("persistence error: {0}")]
    Persistence(String),

    #[error("sms error: {0}")]
    Sms(String),

    #[error("shorten error: {0}")]
    Shorten(String),

    #[error("unexpected response format: {0}")]
    ResponseFormat(String),
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        Self::ResponseFormat(e.to_string())
    }
}
