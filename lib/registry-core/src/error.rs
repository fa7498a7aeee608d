use std::time::Duration;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, RegistryError>;

#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("Invalid service address: {0}")]
    InvalidAddress(String),

    #[error("Invalid service descriptor: {0}")]
    InvalidDescriptor(String),

    #[error("Invalid registry configuration: {0}")]
    InvalidConfiguration(String),

    #[error("Cannot reach coordination store: {0}")]
    Connection(String),

    #[error("Lease grant failed: {0}")]
    LeaseGrant(String),

    #[error("Registration rejected: {0}")]
    Registration(String),

    #[error("Write failed: {0}")]
    Write(String),

    #[error("Deregistration failed: {0}")]
    Deregistration(String),

    #[error("Malformed service record at {key}: {source}")]
    Deserialization {
        key: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Service instance already registered: {0}")]
    AlreadyRegistered(String),

    #[error("No service instance registered")]
    NotRegistered,

    #[error("Keep-alive task did not stop within {0:?}")]
    ShutdownTimeout(Duration),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl RegistryError {
    /// Errors raised before any network call was made.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            RegistryError::InvalidAddress(_)
                | RegistryError::InvalidDescriptor(_)
                | RegistryError::InvalidConfiguration(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = RegistryError::NotRegistered;
        assert_eq!(err.to_string(), "No service instance registered");

        let err = RegistryError::InvalidAddress(":8080".to_string());
        assert_eq!(err.to_string(), "Invalid service address: :8080");

        let err = RegistryError::ShutdownTimeout(Duration::from_secs(10));
        assert_eq!(err.to_string(), "Keep-alive task did not stop within 10s");
    }

    #[test]
    fn test_deserialization_keeps_source() {
        let source = serde_json::from_str::<serde_json::Value>("{not json").unwrap_err();
        let err = RegistryError::Deserialization {
            key: "/greeter/latest/10.0.0.1:9000".to_string(),
            source,
        };
        assert!(err.to_string().starts_with("Malformed service record at /greeter/latest/10.0.0.1:9000"));
        assert!(std::error::Error::source(&err).is_some());
    }

    #[test]
    fn test_is_validation() {
        assert!(RegistryError::InvalidAddress(String::new()).is_validation());
        assert!(!RegistryError::Connection("refused".to_string()).is_validation());
    }
}
