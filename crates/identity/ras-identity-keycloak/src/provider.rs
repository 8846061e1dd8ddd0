//! Keycloak login callback adapter.

use crate::config::KeycloakConfig;
use crate::error::KeycloakResult;
use crate::types::UserInfoResponse;
use async_trait::async_trait;
use ras_identity_core::{AuthenticatedUser, IdentityError, IdentityProvider, IdentityResult};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info};

pub const PROVIDER_ID: &str = "keycloak";

/// Profile fields the adapter reads from the callback.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallbackProfile {
    pub id: String,
    pub username: String,
}

impl From<&UserInfoResponse> for CallbackProfile {
    fn from(user_info: &UserInfoResponse) -> Self {
        Self {
            id: user_info.sub.clone(),
            username: user_info
                .preferred_username
                .clone()
                .unwrap_or_else(|| user_info.sub.clone()),
        }
    }
}

/// Data Keycloak hands back at the end of a login.
///
/// `access_token` stays untyped until [`KeycloakProvider::verify`] checks it.
#[derive(Debug, Serialize, Deserialize)]
pub struct CallbackPayload {
    pub issuer: Option<String>,
    pub profile: Option<CallbackProfile>,
    #[serde(default)]
    pub access_token: serde_json::Value,
    pub refresh_token: Option<String>,
}

impl CallbackPayload {
    /// Builds a payload from a token endpoint body and the userinfo profile.
    pub fn from_token_response(
        issuer: String,
        profile: Option<&UserInfoResponse>,
        token_response: &serde_json::Value,
    ) -> Self {
        Self {
            issuer: Some(issuer),
            profile: profile.map(CallbackProfile::from),
            access_token: token_response
                .get("access_token")
                .cloned()
                .unwrap_or(serde_json::Value::Null),
            refresh_token: token_response
                .get("refresh_token")
                .and_then(serde_json::Value::as_str)
                .map(str::to_string),
        }
    }
}

pub struct KeycloakProvider {
    config: Arc<KeycloakConfig>,
}

impl KeycloakProvider {
    /// Fails if any required configuration field is missing.
    pub fn new(config: Arc<KeycloakConfig>) -> KeycloakResult<Self> {
        config.require()?;
        info!(issuer = %config.issuer(), "Keycloak provider initialized");
        Ok(Self { config })
    }

    pub fn issuer(&self) -> String {
        self.config.issuer()
    }
}

#[async_trait]
impl IdentityProvider for KeycloakProvider {
    fn provider_id(&self) -> &str {
        PROVIDER_ID
    }

    async fn verify(&self, auth_payload: serde_json::Value) -> IdentityResult<AuthenticatedUser> {
        let payload: CallbackPayload = serde_json::from_value(auth_payload)
            .map_err(|e| IdentityError::InvalidPayload(e.to_string()))?;

        let serde_json::Value::String(access_token) = payload.access_token else {
            return Err(IdentityError::InvalidPayload(
                "Incorrect type of access token".to_string(),
            ));
        };

        let profile = payload
            .profile
            .ok_or_else(|| IdentityError::InvalidPayload("Missing user profile".to_string()))?;
        let refresh_token = payload
            .refresh_token
            .ok_or_else(|| IdentityError::InvalidPayload("Missing refresh token".to_string()))?;

        debug!(
            issuer = payload.issuer.as_deref().unwrap_or_default(),
            user_id = %profile.id,
            "Verified Keycloak callback"
        );

        Ok(AuthenticatedUser {
            access_token,
            refresh_token,
            user_id: profile.id,
            username: profile.username,
        })
    }
}
