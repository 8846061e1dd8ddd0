//! HTTP client for the realm-scoped Keycloak OpenID Connect endpoints.

use crate::config::{GRANT_SCOPE, KeycloakConfig, LOGIN_SCOPES};
use crate::error::{KeycloakError, KeycloakResult};
use crate::types::{
    GrantResponse, IntrospectionResponse, ServiceToken, TokenPair, UserInfoResponse,
};
use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use rand::{RngCore, thread_rng};
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};
use url::Url;

/// PKCE code challenge and verifier
#[derive(Debug, Clone)]
pub struct PkceChallenge {
    pub code_verifier: String,
    pub code_challenge: String,
    pub code_challenge_method: String,
}

impl Default for PkceChallenge {
    fn default() -> Self {
        Self::new()
    }
}

impl PkceChallenge {
    pub fn new() -> Self {
        let code_verifier = Self::generate_code_verifier();
        let code_challenge = Self::code_challenge_for(&code_verifier);

        Self {
            code_verifier,
            code_challenge,
            code_challenge_method: "S256".to_string(),
        }
    }

    fn generate_code_verifier() -> String {
        let mut bytes = [0u8; 64];
        thread_rng().fill_bytes(&mut bytes);
        URL_SAFE_NO_PAD.encode(bytes)
    }

    pub fn code_challenge_for(verifier: &str) -> String {
        let digest = Sha256::digest(verifier.as_bytes());
        URL_SAFE_NO_PAD.encode(digest)
    }
}

/// Client for the Keycloak token, introspection, userinfo and logout endpoints.
///
/// Introspection and refresh are best-effort: provider failures degrade to a
/// negative result. Missing configuration is always an error.
#[derive(Clone)]
pub struct KeycloakClient {
    config: Arc<KeycloakConfig>,
    http_client: Client,
}

impl KeycloakClient {
    pub fn new(config: Arc<KeycloakConfig>) -> KeycloakResult<Self> {
        let http_client = Client::builder()
            .timeout(Duration::from_secs(config.http_timeout_seconds))
            .build()?;

        Ok(Self {
            config,
            http_client,
        })
    }

    pub fn config(&self) -> &KeycloakConfig {
        &self.config
    }

    /// Reports whether `token` is currently active.
    ///
    /// Never fails: a missing token, missing configuration or any provider
    /// error yields `false`.
    pub async fn introspect(&self, token: Option<&str>) -> bool {
        info!("Token introspection");
        let started = Instant::now();

        match self.try_introspect(token).await {
            Ok(active) => {
                info!(
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    active, "Token introspected successfully"
                );
                active
            }
            Err(e) => {
                error!(error = %e, "Failed to introspect token");
                false
            }
        }
    }

    async fn try_introspect(&self, token: Option<&str>) -> KeycloakResult<bool> {
        self.config.require()?;
        let token = token
            .filter(|t| !t.is_empty())
            .ok_or(KeycloakError::MissingToken)?;

        let endpoint = self.config.introspection_endpoint();
        let params = [
            ("token", token),
            ("client_id", self.config.client_id.as_str()),
            ("client_secret", self.config.client_secret.as_str()),
        ];

        let response = self
            .send_with_retry("token introspection", || {
                self.http_client.post(&endpoint).form(&params)
            })
            .await?;

        let body: IntrospectionResponse = response
            .json()
            .await
            .map_err(|e| KeycloakError::InvalidResponse(e.to_string()))?;

        Ok(body.active)
    }

    /// Exchanges a refresh token for a new token pair.
    ///
    /// Provider failures yield [`TokenPair::empty`]; missing configuration or
    /// a missing refresh token are errors.
    pub async fn refresh_tokens(&self, refresh_token: Option<&str>) -> KeycloakResult<TokenPair> {
        info!("Refreshing tokens");
        self.config.require()?;
        let refresh_token = refresh_token
            .filter(|t| !t.is_empty())
            .ok_or(KeycloakError::MissingToken)?;

        let params = [
            ("client_id", self.config.client_id.as_str()),
            ("client_secret", self.config.client_secret.as_str()),
            ("grant_type", "refresh_token"),
            ("scope", GRANT_SCOPE),
            ("refresh_token", refresh_token),
        ];

        match self.grant("token refresh", &params).await {
            Ok(grant) => {
                info!("Tokens refreshed successfully");
                Ok(TokenPair {
                    access_token: grant.access_token,
                    refresh_token: grant.refresh_token,
                })
            }
            Err(e) => {
                error!(error = %e, "Failed to refresh tokens");
                Ok(TokenPair::empty())
            }
        }
    }

    /// Requests a service-account token with the client-credentials grant.
    pub async fn fetch_service_user_access_token(&self) -> KeycloakResult<ServiceToken> {
        self.config.require()?;
        info!("Fetching service user access token");

        let params = [
            ("client_id", self.config.client_id.as_str()),
            ("client_secret", self.config.client_secret.as_str()),
            ("grant_type", "client_credentials"),
            ("scope", GRANT_SCOPE),
        ];

        match self.grant("client credentials grant", &params).await {
            Ok(grant) => {
                info!("Service user access token fetched successfully");
                Ok(ServiceToken {
                    access_token: grant.access_token,
                    expires_in: grant.expires_in,
                })
            }
            Err(e) => {
                error!(error = %e, "Failed to fetch service user access token");
                Ok(ServiceToken::empty())
            }
        }
    }

    /// End-session URL the browser is redirected to on logout.
    pub fn logout_url(&self, post_logout_redirect_uri: &str) -> KeycloakResult<String> {
        self.config.require()?;

        let url = Url::parse_with_params(
            &self.config.logout_endpoint(),
            &[
                ("post_logout_redirect_uri", post_logout_redirect_uri),
                ("client_id", self.config.client_id.as_str()),
            ],
        )?;

        Ok(url.into())
    }

    /// Authorization URL for the interactive login redirect.
    pub fn authorization_url(&self, state: &str, pkce: &PkceChallenge) -> KeycloakResult<String> {
        self.config.require()?;

        let scope = LOGIN_SCOPES.join(" ");
        let callback_url = self.config.callback_url();
        let url = Url::parse_with_params(
            &self.config.authorization_endpoint(),
            &[
                ("response_type", "code"),
                ("client_id", self.config.client_id.as_str()),
                ("redirect_uri", callback_url.as_str()),
                ("scope", scope.as_str()),
                ("state", state),
                ("prompt", "login"),
                ("code_challenge", pkce.code_challenge.as_str()),
                ("code_challenge_method", pkce.code_challenge_method.as_str()),
            ],
        )?;

        debug!("Generated Keycloak authorization URL");
        Ok(url.into())
    }

    /// Exchanges an authorization code for tokens.
    ///
    /// The raw JSON body is returned; the callback adapter checks its shape.
    pub async fn exchange_code(
        &self,
        code: &str,
        code_verifier: &str,
    ) -> KeycloakResult<serde_json::Value> {
        self.config.require()?;

        let endpoint = self.config.token_endpoint();
        let callback_url = self.config.callback_url();
        let params = [
            ("client_id", self.config.client_id.as_str()),
            ("client_secret", self.config.client_secret.as_str()),
            ("grant_type", "authorization_code"),
            ("code", code),
            ("redirect_uri", callback_url.as_str()),
            ("code_verifier", code_verifier),
        ];

        let response = self
            .send_with_retry("code exchange", || {
                self.http_client.post(&endpoint).form(&params)
            })
            .await?;

        let body = response
            .json::<serde_json::Value>()
            .await
            .map_err(|e| KeycloakError::InvalidResponse(e.to_string()))?;

        info!("Successfully exchanged code for tokens");
        Ok(body)
    }

    pub async fn user_info(&self, access_token: &str) -> KeycloakResult<UserInfoResponse> {
        self.config.require()?;

        let endpoint = self.config.userinfo_endpoint();
        let response = self
            .send_with_retry("userinfo request", || {
                self.http_client.get(&endpoint).bearer_auth(access_token)
            })
            .await?;

        let user_info: UserInfoResponse = response
            .json()
            .await
            .map_err(|e| KeycloakError::InvalidResponse(e.to_string()))?;

        debug!(subject = %user_info.sub, "Retrieved Keycloak user info");
        Ok(user_info)
    }

    async fn grant(
        &self,
        operation: &'static str,
        params: &[(&str, &str)],
    ) -> KeycloakResult<GrantResponse> {
        let endpoint = self.config.token_endpoint();
        let response = self
            .send_with_retry(operation, || self.http_client.post(&endpoint).form(params))
            .await?;

        response
            .json()
            .await
            .map_err(|e| KeycloakError::InvalidResponse(e.to_string()))
    }

    /// Sends the request built by `build`, retrying transient failures.
    async fn send_with_retry<F>(&self, operation: &'static str, build: F) -> KeycloakResult<Response>
    where
        F: Fn() -> RequestBuilder,
    {
        let retry = self.config.retry;
        let mut attempt = 0;

        loop {
            let outcome = build().send().await;
            let transient = match &outcome {
                Ok(response) => is_transient_status(response.status()),
                Err(err) => err.is_connect() || err.is_timeout(),
            };

            if transient && attempt < retry.max_retries {
                attempt += 1;
                match &outcome {
                    Ok(response) => {
                        warn!(operation, attempt, status = %response.status(), "Retrying Keycloak request")
                    }
                    Err(err) => warn!(operation, attempt, error = %err, "Retrying Keycloak request"),
                }
                tokio::time::sleep(retry.delay(attempt)).await;
                continue;
            }

            return Self::ensure_success(outcome?, operation).await;
        }
    }

    async fn ensure_success(response: Response, operation: &'static str) -> KeycloakResult<Response> {
        if response.status().is_success() {
            return Ok(response);
        }
        let status = response.status().as_u16();
        let body = response.text().await.unwrap_or_default();
        Err(KeycloakError::UnexpectedStatus {
            operation,
            status,
            body,
        })
    }
}

fn is_transient_status(status: StatusCode) -> bool {
    status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn client() -> KeycloakClient {
        let config = KeycloakConfig::new(
            "datalens",
            "secret",
            "https://sso.example.com",
            "main",
            "cookie-secret",
            "https://app.example.com",
        );
        KeycloakClient::new(Arc::new(config)).unwrap()
    }

    #[test]
    fn test_pkce_generation() {
        let pkce1 = PkceChallenge::new();
        let pkce2 = PkceChallenge::new();

        assert_ne!(pkce1.code_verifier, pkce2.code_verifier);
        assert_eq!(pkce1.code_challenge_method, "S256");
        assert_eq!(
            pkce1.code_challenge,
            PkceChallenge::code_challenge_for(&pkce1.code_verifier)
        );
    }

    #[test]
    fn test_authorization_url() {
        let pkce = PkceChallenge::new();
        let auth_url = client().authorization_url("state-123", &pkce).unwrap();

        let url = Url::parse(&auth_url).unwrap();
        assert_eq!(url.path(), "/realms/main/protocol/openid-connect/auth");

        let params: HashMap<_, _> = url.query_pairs().into_owned().collect();
        assert_eq!(params["response_type"], "code");
        assert_eq!(params["client_id"], "datalens");
        assert_eq!(
            params["redirect_uri"],
            "https://app.example.com/api/auth/callback"
        );
        assert_eq!(params["scope"], "openid profile email offline_access");
        assert_eq!(params["state"], "state-123");
        assert_eq!(params["prompt"], "login");
        assert_eq!(params["code_challenge"], pkce.code_challenge);
    }

    #[test]
    fn test_logout_url() {
        let logout_url = client()
            .logout_url("https://app.example.com/auth")
            .unwrap();

        let url = Url::parse(&logout_url).unwrap();
        assert_eq!(url.path(), "/realms/main/protocol/openid-connect/logout");

        let params: HashMap<_, _> = url.query_pairs().into_owned().collect();
        assert_eq!(
            params["post_logout_redirect_uri"],
            "https://app.example.com/auth"
        );
        assert_eq!(params["client_id"], "datalens");
    }

    #[test]
    fn test_logout_url_requires_client_id() {
        let config = KeycloakConfig::new(
            "",
            "secret",
            "https://sso.example.com",
            "main",
            "cookie-secret",
            "https://app.example.com",
        );
        let client = KeycloakClient::new(Arc::new(config)).unwrap();

        let err = client.logout_url("https://app.example.com/auth").unwrap_err();
        assert!(matches!(err, KeycloakError::MissingConfig("KEYCLOAK_CLIENT_ID")));
    }

    #[test]
    fn test_transient_statuses() {
        assert!(is_transient_status(StatusCode::SERVICE_UNAVAILABLE));
        assert!(is_transient_status(StatusCode::TOO_MANY_REQUESTS));
        assert!(!is_transient_status(StatusCode::UNAUTHORIZED));
        assert!(!is_transient_status(StatusCode::BAD_REQUEST));
    }
}
