//! Core identity provider traits and types.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("Invalid authentication payload: {0}")]
    InvalidPayload(String),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),
}

pub type IdentityResult<T> = Result<T, IdentityError>;

/// The user record produced at login time and kept in the session.
///
/// Whatever shape a provider builds here is exactly what later requests
/// observe; sessions store and restore it without transformation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthenticatedUser {
    pub access_token: String,
    pub refresh_token: String,
    pub user_id: String,
    pub username: String,
}

impl AuthenticatedUser {
    /// Same user, new token pair.
    pub fn with_tokens(self, access_token: String, refresh_token: String) -> Self {
        Self {
            access_token,
            refresh_token,
            ..self
        }
    }
}

#[async_trait]
pub trait IdentityProvider: Send + Sync {
    fn provider_id(&self) -> &str;

    /// Turns provider callback data into an [`AuthenticatedUser`].
    async fn verify(&self, auth_payload: serde_json::Value) -> IdentityResult<AuthenticatedUser>;
}

/// Stores the user record verbatim.
pub fn serialize_user(user: &AuthenticatedUser) -> IdentityResult<serde_json::Value> {
    Ok(serde_json::to_value(user)?)
}

/// Restores a user record stored by [`serialize_user`].
pub fn deserialize_user(value: serde_json::Value) -> IdentityResult<AuthenticatedUser> {
    Ok(serde_json::from_value(value)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user() -> AuthenticatedUser {
        AuthenticatedUser {
            access_token: "at".to_string(),
            refresh_token: "rt".to_string(),
            user_id: "0b5c7e2a".to_string(),
            username: "alice".to_string(),
        }
    }

    #[test]
    fn test_user_serialization_is_verbatim() {
        let value = serialize_user(&user()).unwrap();
        assert_eq!(value["access_token"], "at");
        assert_eq!(value["username"], "alice");

        let restored = deserialize_user(value).unwrap();
        assert_eq!(restored, user());
    }

    #[test]
    fn test_deserialize_rejects_incomplete_record() {
        let result = deserialize_user(serde_json::json!({ "user_id": "1" }));
        assert!(matches!(result, Err(IdentityError::SerializationError(_))));
    }

    #[test]
    fn test_with_tokens_keeps_identity() {
        let refreshed = user().with_tokens("at2".to_string(), "rt2".to_string());
        assert_eq!(refreshed.access_token, "at2");
        assert_eq!(refreshed.refresh_token, "rt2");
        assert_eq!(refreshed.user_id, "0b5c7e2a");
        assert_eq!(refreshed.username, "alice");
    }
}
