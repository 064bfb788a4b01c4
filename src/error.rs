use crate::crypto::CryptoError;
use thiserror::Error;

/// Broker-wide error types
#[derive(Error, Debug)]
pub enum BrokerError {
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),

    #[error("timeout waiting for approval")]
    Timeout,

    #[error("secret expired")]
    SecretExpired,

    #[error("bad upstream credential")]
    BadUpstreamCredential,

    #[error("connection closed before approval")]
    Cancelled,

    #[error("Invalid upstream: {0}")]
    InvalidUpstream(String),

    #[error("Invalid pipe config: {0}")]
    InvalidPipeConfig(String),

    #[error("too many connections")]
    TooManyConnections,

    #[error("connection expired")]
    ConnectionExpired,

    #[error("host key mismatch for {0}")]
    HostKeyMismatch(String),
}

impl BrokerError {
    pub fn invalid_upstream<S: Into<String>>(msg: S) -> Self {
        Self::InvalidUpstream(msg.into())
    }
}

/// Result type alias using BrokerError
pub type BrokerResult<T> = Result<T, BrokerError>;

/// Convert BrokerError to HTTP status codes for web responses
impl BrokerError {
    pub fn status_code(&self) -> axum::http::StatusCode {
        use axum::http::StatusCode;
        match self {
            Self::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Crypto(CryptoError::Entropy(_)) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Crypto(_) => StatusCode::UNPROCESSABLE_ENTITY,
            Self::Timeout => StatusCode::GATEWAY_TIMEOUT,
            Self::SecretExpired => StatusCode::GONE,
            Self::BadUpstreamCredential => StatusCode::FORBIDDEN,
            Self::Cancelled => StatusCode::GONE,
            Self::InvalidUpstream(_) => StatusCode::BAD_REQUEST,
            Self::InvalidPipeConfig(_) => StatusCode::BAD_REQUEST,
            Self::TooManyConnections => StatusCode::TOO_MANY_REQUESTS,
            Self::ConnectionExpired => StatusCode::GONE,
            Self::HostKeyMismatch(_) => StatusCode::BAD_GATEWAY,
        }
    }
}

impl axum::response::IntoResponse for BrokerError {
    fn into_response(self) -> axum::response::Response {
        let status = self.status_code();
        let body = serde_json::json!({
            "error": self.to_string(),
            "code": status.as_u16()
        });
        (status, axum::Json(body)).into_response()
    }
}
