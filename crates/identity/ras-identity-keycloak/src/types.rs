//! Keycloak protocol types.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Result of a refresh grant. Both fields are `None` when the refresh failed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenPair {
    pub access_token: Option<String>,
    pub refresh_token: Option<String>,
}

impl TokenPair {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Both tokens, if the provider returned both.
    pub fn into_complete(self) -> Option<(String, String)> {
        self.access_token.zip(self.refresh_token)
    }
}

/// Result of a client-credentials grant. Both fields are `None` on failure.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceToken {
    pub access_token: Option<String>,
    pub expires_in: Option<u64>,
}

impl ServiceToken {
    pub fn empty() -> Self {
        Self::default()
    }
}

/// Body of a token endpoint response.
#[derive(Debug, Clone, Deserialize)]
pub struct GrantResponse {
    pub access_token: Option<String>,
    pub refresh_token: Option<String>,
    pub expires_in: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct IntrospectionResponse {
    #[serde(default)]
    pub active: bool,
}

/// Keycloak userinfo response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserInfoResponse {
    pub sub: String,
    pub preferred_username: Option<String>,
    pub email: Option<String>,
    pub email_verified: Option<bool>,
    pub name: Option<String>,
    #[serde(flatten)]
    pub additional_claims: HashMap<String, serde_json::Value>,
}

/// Query parameters Keycloak sends to the callback endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct CallbackQuery {
    pub code: Option<String>,
    pub state: Option<String>,
    pub error: Option<String>,
    pub error_description: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_user_info_keycloak_shape() {
        let json = r#"{
            "sub": "3f1c2a52-9c4e-4f0b-a4d9-1b7c3c6f2e10",
            "preferred_username": "alice",
            "email": "alice@example.com",
            "email_verified": true,
            "realm_access": { "roles": ["admin"] }
        }"#;

        let user_info: UserInfoResponse = serde_json::from_str(json).unwrap();
        assert_eq!(user_info.preferred_username.as_deref(), Some("alice"));
        assert!(user_info.additional_claims.contains_key("realm_access"));
    }

    #[test]
    fn test_introspection_without_active_is_inactive() {
        let response: IntrospectionResponse = serde_json::from_str("{}").unwrap();
        assert!(!response.active);
    }

    #[test]
    fn test_token_pair_completeness() {
        let pair = TokenPair {
            access_token: Some("a".to_string()),
            refresh_token: None,
        };
        assert_eq!(pair.into_complete(), None);
        assert_eq!(TokenPair::empty().into_complete(), None);
    }
}
