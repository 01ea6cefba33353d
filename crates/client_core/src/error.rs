use shared::error::{ApiError, ErrorCode};
use thiserror::Error;

/// Failures surfaced to embedders of the client.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("authentication expired: {0}")]
    AuthExpired(String),
    #[error("forbidden: {0}")]
    Forbidden(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("invalid request: {0}")]
    Validation(String),
    #[error("transport unavailable: {0}")]
    Transport(String),
    #[error("server-side persistence failure: {0}")]
    Persistence(String),
}

impl From<ApiError> for ClientError {
    fn from(err: ApiError) -> Self {
        match err.code {
            ErrorCode::AuthExpired => Self::AuthExpired(err.message),
            ErrorCode::Forbidden => Self::Forbidden(err.message),
            ErrorCode::NotFound => Self::NotFound(err.message),
            ErrorCode::Validation => Self::Validation(err.message),
            ErrorCode::TransportUnavailable => Self::Transport(err.message),
            ErrorCode::Persistence => Self::Persistence(err.message),
        }
    }
}

impl From<reqwest::Error> for ClientError {
    fn from(err: reqwest::Error) -> Self {
        Self::Transport(err.to_string())
    }
}

impl ClientError {
    /// Distinguishes structured server rejections from plain HTTP failures.
    /// The body is decoded as an [`ApiError`] when possible and the status
    /// line is kept as a fallback.
    pub async fn from_response(response: reqwest::Response) -> Self {
        let status = response.status();
        match response.json::<ApiError>().await {
            Ok(api) => api.into(),
            Err(_) => Self::Transport(format!("server replied with status {status}")),
        }
    }
}
