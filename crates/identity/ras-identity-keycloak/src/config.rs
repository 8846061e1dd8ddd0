//! Keycloak configuration.

use crate::error::{KeycloakError, KeycloakResult};
use std::time::Duration;

pub const CLIENT_ID_VAR: &str = "KEYCLOAK_CLIENT_ID";
pub const SECRET_KEY_VAR: &str = "KEYCLOAK_SECRET_KEY";
pub const URI_VAR: &str = "KEYCLOAK_URI";
pub const REALM_NAME_VAR: &str = "KEYCLOAK_REALM_NAME";
pub const COOKIE_SECRET_VAR: &str = "KEYCLOAK_COOKIE_SECRET";
pub const APP_HOST_URI_VAR: &str = "APP_HOST_URI";
pub const HTTP_TIMEOUT_VAR: &str = "KEYCLOAK_HTTP_TIMEOUT_SECONDS";

/// Scopes requested on the interactive login redirect.
pub const LOGIN_SCOPES: &[&str] = &["openid", "profile", "email", "offline_access"];

/// Scope sent with refresh and client-credentials grants.
pub const GRANT_SCOPE: &str = "openid profile email";

pub const CALLBACK_PATH: &str = "/api/auth/callback";

/// Retry behaviour for calls to Keycloak.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 100,
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (1-based), doubling each time.
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 2u64.saturating_pow(attempt.saturating_sub(1));
        Duration::from_millis(self.base_delay_ms.saturating_mul(factor))
    }
}

#[derive(Debug, Clone)]
pub struct KeycloakConfig {
    pub client_id: String,
    pub client_secret: String,
    pub uri: String,
    pub realm_name: String,
    pub cookie_secret: String,
    pub app_host_uri: String,
    pub http_timeout_seconds: u64,
    pub retry: RetryPolicy,
    /// Fraction of the advertised lifetime a service token stays cached.
    pub service_token_ttl_ratio: f64,
}

impl KeycloakConfig {
    pub fn new(
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
        uri: impl Into<String>,
        realm_name: impl Into<String>,
        cookie_secret: impl Into<String>,
        app_host_uri: impl Into<String>,
    ) -> Self {
        Self {
            client_id: client_id.into(),
            client_secret: client_secret.into(),
            uri: uri.into(),
            realm_name: realm_name.into(),
            cookie_secret: cookie_secret.into(),
            app_host_uri: app_host_uri.into(),
            http_timeout_seconds: 30,
            retry: RetryPolicy::default(),
            service_token_ttl_ratio: 0.9,
        }
    }

    /// Loads the configuration from the process environment.
    ///
    /// Empty variables count as missing.
    pub fn from_env() -> KeycloakResult<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> KeycloakResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let required = |key: &'static str| {
            lookup(key)
                .filter(|value| !value.is_empty())
                .ok_or(KeycloakError::MissingConfig(key))
        };

        let mut config = Self::new(
            required(CLIENT_ID_VAR)?,
            required(SECRET_KEY_VAR)?,
            required(URI_VAR)?,
            required(REALM_NAME_VAR)?,
            required(COOKIE_SECRET_VAR)?,
            required(APP_HOST_URI_VAR)?,
        );

        if let Some(timeout) = lookup(HTTP_TIMEOUT_VAR).filter(|value| !value.is_empty()) {
            config.http_timeout_seconds = timeout.parse().map_err(|_| {
                KeycloakError::InvalidConfig(format!(
                    "{HTTP_TIMEOUT_VAR} must be a number of seconds, got '{timeout}'"
                ))
            })?;
        }

        Ok(config)
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_http_timeout(mut self, seconds: u64) -> Self {
        self.http_timeout_seconds = seconds;
        self
    }

    /// Rejects ratios outside `(0, 1]`.
    pub fn with_service_token_ttl_ratio(mut self, ratio: f64) -> KeycloakResult<Self> {
        validate_ttl_ratio(ratio)?;
        self.service_token_ttl_ratio = ratio;
        Ok(self)
    }

    /// Fails on the first empty required field, naming its env var, or on
    /// an out-of-range service token TTL ratio.
    pub fn require(&self) -> KeycloakResult<()> {
        let fields = [
            (CLIENT_ID_VAR, &self.client_id),
            (SECRET_KEY_VAR, &self.client_secret),
            (URI_VAR, &self.uri),
            (REALM_NAME_VAR, &self.realm_name),
            (COOKIE_SECRET_VAR, &self.cookie_secret),
            (APP_HOST_URI_VAR, &self.app_host_uri),
        ];

        if let Some((name, _)) = fields.iter().find(|(_, value)| value.is_empty()) {
            return Err(KeycloakError::MissingConfig(*name));
        }
        validate_ttl_ratio(self.service_token_ttl_ratio)
    }

    pub fn issuer(&self) -> String {
        format!(
            "{}/realms/{}",
            self.uri.trim_end_matches('/'),
            self.realm_name
        )
    }

    fn openid_connect_endpoint(&self, path: &str) -> String {
        format!("{}/protocol/openid-connect/{}", self.issuer(), path)
    }

    pub fn authorization_endpoint(&self) -> String {
        self.openid_connect_endpoint("auth")
    }

    pub fn token_endpoint(&self) -> String {
        self.openid_connect_endpoint("token")
    }

    pub fn introspection_endpoint(&self) -> String {
        self.openid_connect_endpoint("token/introspect")
    }

    pub fn userinfo_endpoint(&self) -> String {
        self.openid_connect_endpoint("userinfo")
    }

    pub fn logout_endpoint(&self) -> String {
        self.openid_connect_endpoint("logout")
    }

    pub fn callback_url(&self) -> String {
        format!("{}{}", self.app_host_uri.trim_end_matches('/'), CALLBACK_PATH)
    }

    /// Where the provider sends the browser after end-session.
    pub fn post_logout_redirect_uri(&self) -> String {
        format!("{}/auth", self.app_host_uri.trim_end_matches('/'))
    }

    pub fn secure_cookies(&self) -> bool {
        self.app_host_uri.starts_with("https://")
    }
}

fn validate_ttl_ratio(ratio: f64) -> KeycloakResult<()> {
    // NaN fails both comparisons
    if ratio > 0.0 && ratio <= 1.0 {
        Ok(())
    } else {
        Err(KeycloakError::InvalidConfig(format!(
            "service token TTL ratio must be in (0, 1], got {ratio}"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env() -> HashMap<&'static str, String> {
        HashMap::from([
            (CLIENT_ID_VAR, "datalens".to_string()),
            (SECRET_KEY_VAR, "s3cret".to_string()),
            (URI_VAR, "https://sso.example.com/".to_string()),
            (REALM_NAME_VAR, "main".to_string()),
            (COOKIE_SECRET_VAR, "cookie-secret".to_string()),
            (APP_HOST_URI_VAR, "https://app.example.com".to_string()),
        ])
    }

    #[test]
    fn test_from_lookup_reads_all_fields() {
        let vars = env();
        let config = KeycloakConfig::from_lookup(|key| vars.get(key).cloned()).unwrap();

        assert_eq!(config.client_id, "datalens");
        assert_eq!(config.realm_name, "main");
        assert_eq!(config.http_timeout_seconds, 30);
        assert_eq!(config.retry.max_retries, 3);
        assert!(config.require().is_ok());
    }

    #[test]
    fn test_each_missing_field_is_named() {
        for name in [
            CLIENT_ID_VAR,
            SECRET_KEY_VAR,
            URI_VAR,
            REALM_NAME_VAR,
            COOKIE_SECRET_VAR,
            APP_HOST_URI_VAR,
        ] {
            let mut vars = env();
            vars.remove(name);
            let err = KeycloakConfig::from_lookup(|key| vars.get(key).cloned()).unwrap_err();
            assert!(matches!(err, KeycloakError::MissingConfig(missing) if missing == name));
            assert!(err.to_string().contains(name));

            // Empty values are treated the same as absent ones
            let mut vars = env();
            vars.insert(name, String::new());
            let err = KeycloakConfig::from_lookup(|key| vars.get(key).cloned()).unwrap_err();
            assert!(matches!(err, KeycloakError::MissingConfig(missing) if missing == name));
        }
    }

    #[test]
    fn test_require_names_first_empty_field() {
        let vars = env();
        let mut config = KeycloakConfig::from_lookup(|key| vars.get(key).cloned()).unwrap();
        config.cookie_secret.clear();

        let err = config.require().unwrap_err();
        assert!(matches!(err, KeycloakError::MissingConfig(COOKIE_SECRET_VAR)));
    }

    #[test]
    fn test_invalid_timeout_is_rejected() {
        let mut vars = env();
        vars.insert(HTTP_TIMEOUT_VAR, "soon".to_string());
        let err = KeycloakConfig::from_lookup(|key| vars.get(key).cloned()).unwrap_err();
        assert!(matches!(err, KeycloakError::InvalidConfig(_)));

        vars.insert(HTTP_TIMEOUT_VAR, "5".to_string());
        let config = KeycloakConfig::from_lookup(|key| vars.get(key).cloned()).unwrap();
        assert_eq!(config.http_timeout_seconds, 5);
    }

    #[test]
    fn test_realm_scoped_endpoints() {
        let vars = env();
        let config = KeycloakConfig::from_lookup(|key| vars.get(key).cloned()).unwrap();

        assert_eq!(config.issuer(), "https://sso.example.com/realms/main");
        assert_eq!(
            config.token_endpoint(),
            "https://sso.example.com/realms/main/protocol/openid-connect/token"
        );
        assert_eq!(
            config.introspection_endpoint(),
            "https://sso.example.com/realms/main/protocol/openid-connect/token/introspect"
        );
        assert_eq!(
            config.logout_endpoint(),
            "https://sso.example.com/realms/main/protocol/openid-connect/logout"
        );
        assert_eq!(
            config.callback_url(),
            "https://app.example.com/api/auth/callback"
        );
        assert_eq!(
            config.post_logout_redirect_uri(),
            "https://app.example.com/auth"
        );
        assert!(config.secure_cookies());
    }

    #[test]
    fn test_ttl_ratio_must_be_a_fraction() {
        let vars = env();
        let config = || KeycloakConfig::from_lookup(|key| vars.get(key).cloned()).unwrap();

        for ratio in [0.0, -0.5, 1.5, f64::NAN, f64::INFINITY] {
            let err = config().with_service_token_ttl_ratio(ratio).unwrap_err();
            assert!(matches!(err, KeycloakError::InvalidConfig(_)));
        }

        let config = config().with_service_token_ttl_ratio(1.0).unwrap();
        assert_eq!(config.service_token_ttl_ratio, 1.0);

        // Direct field writes are caught before any provider call
        let mut config = config;
        config.service_token_ttl_ratio = 2.0;
        assert!(matches!(
            config.require(),
            Err(KeycloakError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_retry_delay_doubles() {
        let policy = RetryPolicy {
            max_retries: 3,
            base_delay_ms: 100,
        };
        assert_eq!(policy.delay(1), Duration::from_millis(100));
        assert_eq!(policy.delay(2), Duration::from_millis(200));
        assert_eq!(policy.delay(3), Duration::from_millis(400));
    }
}
