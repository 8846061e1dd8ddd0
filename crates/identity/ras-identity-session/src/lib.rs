//! Cookie sessions that carry the authenticated user record.
//!
//! The cookie value is an HS256-signed JWT holding the full
//! [`AuthenticatedUser`]. Each session also has an entry in a
//! [`SessionStore`] so that logout can revoke it before the cookie expires.

use async_trait::async_trait;
use axum_extra::extract::cookie::{Cookie, SameSite};
use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation, decode, encode};
use ras_identity_core::{AuthenticatedUser, IdentityError, deserialize_user, serialize_user};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, error};
use uuid::Uuid;

pub const SESSION_COOKIE_NAME: &str = "keycloak_session";

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("JWT error: {0}")]
    JwtError(#[from] jsonwebtoken::errors::Error),

    #[error("Session store error: {0}")]
    Store(String),

    #[error("Session not found")]
    SessionNotFound,

    #[error("Session user record: {0}")]
    UserRecord(#[from] IdentityError),
}

pub type SessionResult<T> = Result<T, SessionError>;

/// Claims signed into the session cookie.
///
/// `user` is the record exactly as [`serialize_user`] produced it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionClaims {
    pub sub: String,
    pub exp: i64,
    pub iat: i64,
    pub jti: String,
    pub user: serde_json::Value,
}

/// A live session restored from its cookie.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub id: String,
    pub user: AuthenticatedUser,
    pub issued_at: i64,
    pub expires_at: i64,
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub cookie_secret: String,
    pub cookie_name: String,
    pub cookie_path: String,
    pub max_age: Duration,
    pub secure: bool,
    pub algorithm: Algorithm,
}

impl SessionConfig {
    pub fn new(cookie_secret: impl Into<String>) -> Self {
        Self {
            cookie_secret: cookie_secret.into(),
            cookie_name: SESSION_COOKIE_NAME.to_string(),
            cookie_path: "/".to_string(),
            max_age: Duration::days(365),
            secure: false,
            algorithm: Algorithm::HS256,
        }
    }

    pub fn with_secure(mut self, secure: bool) -> Self {
        self.secure = secure;
        self
    }
}

/// Persistence for live session ids.
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn insert(&self, session_id: &str, expires_at: DateTime<Utc>) -> SessionResult<()>;

    async fn contains(&self, session_id: &str) -> SessionResult<bool>;

    /// Returns whether a session was removed.
    async fn remove(&self, session_id: &str) -> SessionResult<bool>;

    async fn cleanup_expired(&self) -> SessionResult<usize>;
}

#[derive(Default)]
pub struct InMemorySessionStore {
    sessions: Arc<RwLock<HashMap<String, DateTime<Utc>>>>,
}

impl InMemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionStore for InMemorySessionStore {
    async fn insert(&self, session_id: &str, expires_at: DateTime<Utc>) -> SessionResult<()> {
        let mut sessions = self.sessions.write().await;
        sessions.insert(session_id.to_string(), expires_at);
        Ok(())
    }

    async fn contains(&self, session_id: &str) -> SessionResult<bool> {
        let sessions = self.sessions.read().await;
        Ok(sessions
            .get(session_id)
            .is_some_and(|expires_at| Utc::now() <= *expires_at))
    }

    async fn remove(&self, session_id: &str) -> SessionResult<bool> {
        let mut sessions = self.sessions.write().await;
        Ok(sessions.remove(session_id).is_some())
    }

    async fn cleanup_expired(&self) -> SessionResult<usize> {
        let mut sessions = self.sessions.write().await;
        let now = Utc::now();
        let before = sessions.len();
        sessions.retain(|_, expires_at| now <= *expires_at);
        Ok(before - sessions.len())
    }
}

pub struct SessionService {
    config: SessionConfig,
    store: Arc<dyn SessionStore>,
}

impl SessionService {
    pub fn new(config: SessionConfig, store: Arc<dyn SessionStore>) -> Self {
        Self { config, store }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Persists `user` as a new session and returns the signed cookie value.
    ///
    /// Store failures are propagated; callers must await this before
    /// responding.
    pub async fn bind_user(&self, user: AuthenticatedUser) -> SessionResult<String> {
        let now = Utc::now();
        let exp = now + self.config.max_age;
        let jti = Uuid::new_v4().to_string();
        let record = serialize_user(&user)?;

        self.store.insert(&jti, exp).await.inspect_err(|e| {
            error!(error = %e, "Failed to save tokens to session");
        })?;

        let claims = SessionClaims {
            sub: user.user_id.clone(),
            exp: exp.timestamp(),
            iat: now.timestamp(),
            jti,
            user: record,
        };

        let token = encode(
            &Header::new(self.config.algorithm),
            &claims,
            &EncodingKey::from_secret(self.config.cookie_secret.as_bytes()),
        )?;

        debug!(session_id = %claims.jti, user_id = %claims.sub, "Bound user to session");
        Ok(token)
    }

    pub async fn load(&self, token: &str) -> SessionResult<Session> {
        let token_data = decode::<SessionClaims>(
            token,
            &DecodingKey::from_secret(self.config.cookie_secret.as_bytes()),
            &Validation::new(self.config.algorithm),
        )?;

        let claims = token_data.claims;
        if !self.store.contains(&claims.jti).await? {
            return Err(SessionError::SessionNotFound);
        }

        Ok(Session {
            user: deserialize_user(claims.user)?,
            id: claims.jti,
            issued_at: claims.iat,
            expires_at: claims.exp,
        })
    }

    /// Ends a session. Store failures are propagated.
    pub async fn end_session(&self, session_id: &str) -> SessionResult<bool> {
        let removed = self.store.remove(session_id).await?;
        debug!(session_id, removed, "Ended session");
        Ok(removed)
    }

    pub async fn cleanup_expired(&self) -> SessionResult<usize> {
        self.store.cleanup_expired().await
    }

    /// Reads the session id from a cookie value without checking the store.
    pub fn session_id(&self, token: &str) -> SessionResult<String> {
        let token_data = decode::<SessionClaims>(
            token,
            &DecodingKey::from_secret(self.config.cookie_secret.as_bytes()),
            &Validation::new(self.config.algorithm),
        )?;
        Ok(token_data.claims.jti)
    }

    pub fn session_cookie(&self, value: String) -> Cookie<'static> {
        Cookie::build((self.config.cookie_name.clone(), value))
            .http_only(true)
            .secure(self.config.secure)
            .same_site(SameSite::Lax)
            .path(self.config.cookie_path.clone())
            .max_age(time::Duration::seconds(self.config.max_age.num_seconds()))
            .build()
    }

    pub fn removal_cookie(&self) -> Cookie<'static> {
        Cookie::build((self.config.cookie_name.clone(), ""))
            .path(self.config.cookie_path.clone())
            .max_age(time::Duration::ZERO)
            .build()
    }
}
