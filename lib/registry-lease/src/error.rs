use thiserror::Error;

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Failures talking to a lease store
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    #[error("Store rejected request ({status}): {body}")]
    Rejected { status: u16, body: String },

    #[error("Unexpected store response: {0}")]
    Decode(String),

    #[error("Lease not found: {0}")]
    LeaseNotFound(i64),
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
