//! Keycloak error types.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use ras_identity_core::IdentityError;
use ras_identity_session::SessionError;
use thiserror::Error;
use tracing::error;

pub type KeycloakResult<T> = Result<T, KeycloakError>;

#[derive(Debug, Error)]
pub enum KeycloakError {
    #[error("Missing {0} in env")]
    MissingConfig(&'static str),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Token not provided")]
    MissingToken,

    #[error("HTTP request failed: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("{operation} failed with status {status}: {body}")]
    UnexpectedStatus {
        operation: &'static str,
        status: u16,
        body: String,
    },

    #[error("Invalid response from Keycloak: {0}")]
    InvalidResponse(String),

    #[error("Invalid state parameter")]
    InvalidState,

    #[error("Callback error: {0}")]
    CallbackError(String),

    #[error("Not authenticated")]
    Unauthenticated,

    #[error("URL parsing error: {0}")]
    UrlError(#[from] url::ParseError),

    #[error("Identity error: {0}")]
    IdentityError(#[from] IdentityError),

    #[error("Session error: {0}")]
    SessionError(#[from] SessionError),
}

impl IntoResponse for KeycloakError {
    fn into_response(self) -> Response {
        match self {
            Self::Unauthenticated => (StatusCode::UNAUTHORIZED, self.to_string()).into_response(),
            Self::InvalidState
            | Self::CallbackError(_)
            | Self::IdentityError(IdentityError::InvalidPayload(_)) => {
                (StatusCode::BAD_REQUEST, self.to_string()).into_response()
            }
            _ => {
                error!(error = %self, "Keycloak auth internal error");
                (StatusCode::INTERNAL_SERVER_ERROR, "Internal error").into_response()
            }
        }
    }
}
