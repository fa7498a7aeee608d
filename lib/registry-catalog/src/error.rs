use thiserror::Error;

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Failures talking to a service catalog
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Catalog unavailable: {0}")]
    Unavailable(String),

    #[error("Catalog rejected request ({status}): {body}")]
    Rejected { status: u16, body: String },

    #[error("Unexpected catalog response: {0}")]
    Decode(String),
}

impl StoreError {
    pub fn is_transport(&self) -> bool {
        matches!(self, StoreError::Unavailable(_))
    }
}

impl From<reqwest::Error> for StoreError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            StoreError::Decode(err.to_string())
        } else {
            StoreError::Unavailable(err.to_string())
        }
    }
}
