//! Error types for the connect crate.

use thiserror::Error;

use mintling_core::sync::RemoteError;

/// Result type alias for cloud API operations.
pub type Result<T> = std::result::Result<T, ConnectError>;

/// Errors that can occur while talking to the cloud sync API.
#[derive(Debug, Error)]
pub enum ConnectError {
    /// HTTP client error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// API error response from the cloud service
    #[error("API error ({status}): {message}")]
    Api { status: u16, message: String },

    /// Invalid request (missing required data, etc.)
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Authentication error (missing or invalid token)
    #[error("Authentication error: {0}")]
    Auth(String),
}

impl ConnectError {
    pub fn api(status: u16, message: impl Into<String>) -> Self {
        Self::Api {
            status,
            message: message.into(),
        }
    }

    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::InvalidRequest(message.into())
    }

    pub fn auth(message: impl Into<String>) -> Self {
        Self::Auth(message.into())
    }
}

/// Mapping into the engine's error taxonomy; transport problems stay
/// retryable, malformed requests and bodies do not.
impl From<ConnectError> for RemoteError {
    fn from(err: ConnectError) -> Self {
        match err {
            ConnectError::Http(inner) => RemoteError::transport(inner.to_string()),
            ConnectError::Json(inner) => {
                RemoteError::api(400, format!("invalid response body: {}", inner))
            }
            ConnectError::Api { status, message } => RemoteError::api(status, message),
            ConnectError::InvalidRequest(message) => RemoteError::api(400, message),
            ConnectError::Auth(message) => RemoteError::Auth(message),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mintling_core::sync::RetryClass;

    #[test]
    fn server_errors_stay_retryable_through_the_mapping() {
        let err: RemoteError = ConnectError::api(503, "maintenance").into();
        assert_eq!(err.retry_class(), RetryClass::Retryable);
    }

    #[test]
    fn invalid_requests_map_to_permanent() {
        let err: RemoteError = ConnectError::invalid_request("bad payload").into();
        assert_eq!(err.retry_class(), RetryClass::Permanent);
    }

    #[test]
    fn auth_failures_request_reauth() {
        let err: RemoteError = ConnectError::auth("token expired").into();
        assert_eq!(err.retry_class(), RetryClass::ReauthRequired);
    }
}
