//! Keycloak OpenID Connect integration.
//!
//! Provides the realm-scoped Keycloak client (introspection, refresh,
//! service-account tokens, logout URL), a time-bounded service token cache,
//! the login callback adapter and the axum routes that tie them to a cookie
//! session from `ras-identity-session`.

mod cache;
mod client;
mod config;
mod error;
mod provider;
mod refresh;
mod routes;
mod types;


pub use cache::{
    CachedServiceToken, InMemoryTokenStore, ServiceTokenCache, TokenStore, safe_ttl_seconds,
};
pub use client::{KeycloakClient, PkceChallenge};
pub use config::{KeycloakConfig, RetryPolicy};
pub use error::{KeycloakError, KeycloakResult};
pub use provider::{CallbackPayload, CallbackProfile, KeycloakProvider, PROVIDER_ID};
pub use refresh::{REFRESH_GRACE_SECONDS, RefreshCoordinator, RefreshedSession};
pub use routes::{AuthState, ServiceTokenBody, SessionUser, auth_routes, authenticate, require_auth};
pub use types::{ServiceToken, TokenPair, UserInfoResponse};

// Re-export common types for convenience
pub use ras_identity_core::{AuthenticatedUser, IdentityProvider};
