//! Axum routes for the Keycloak login flow.
//!
//! ```rust,ignore
//! let state = AuthState::in_memory(KeycloakConfig::from_env()?)?;
//! let app = Router::new()
//!     .route("/", get(home))
//!     .route_layer(middleware::from_fn_with_state(state.clone(), require_auth))
//!     .merge(auth_routes(state));
//! ```

use crate::cache::{InMemoryTokenStore, ServiceTokenCache, TokenStore};
use crate::client::{KeycloakClient, PkceChallenge};
use crate::config::{CALLBACK_PATH, KeycloakConfig};
use crate::error::{KeycloakError, KeycloakResult};
use crate::provider::{CallbackPayload, KeycloakProvider};
use crate::refresh::{RefreshCoordinator, RefreshedSession};
use crate::types::CallbackQuery;
use axum::extract::{FromRequestParts, Query, Request, State};
use axum::http::request::Parts;
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Redirect, Response};
use axum::routing::get;
use axum::{Json, Router};
use axum_extra::extract::CookieJar;
use axum_extra::extract::cookie::{Cookie, SameSite};
use ras_identity_core::{AuthenticatedUser, IdentityError, IdentityProvider};
use ras_identity_session::{
    InMemorySessionStore, SessionConfig, SessionError, SessionService, SessionStore,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

pub const AUTH_PATH: &str = "/api/auth";

const STATE_COOKIE_NAME: &str = "keycloak_state";
const PKCE_COOKIE_NAME: &str = "keycloak_pkce";

/// Shared state for the auth routes and [`require_auth`].
#[derive(Clone)]
pub struct AuthState {
    pub client: KeycloakClient,
    pub provider: Arc<KeycloakProvider>,
    pub sessions: Arc<SessionService>,
    pub service_tokens: ServiceTokenCache,
    pub refreshes: Arc<RefreshCoordinator>,
}

impl AuthState {
    /// Fails fast if any required configuration field is missing.
    pub fn new(
        config: KeycloakConfig,
        session_store: Arc<dyn SessionStore>,
        token_store: Arc<dyn TokenStore>,
    ) -> KeycloakResult<Self> {
        let config = Arc::new(config);
        let provider = Arc::new(KeycloakProvider::new(config.clone())?);
        let client = KeycloakClient::new(config.clone())?;

        let session_config = SessionConfig::new(config.cookie_secret.clone())
            .with_secure(config.secure_cookies());
        let sessions = Arc::new(SessionService::new(session_config, session_store));
        let service_tokens = ServiceTokenCache::new(client.clone(), token_store);

        Ok(Self {
            client,
            provider,
            sessions,
            service_tokens,
            refreshes: Arc::new(RefreshCoordinator::new()),
        })
    }

    pub fn in_memory(config: KeycloakConfig) -> KeycloakResult<Self> {
        Self::new(
            config,
            Arc::new(InMemorySessionStore::new()),
            Arc::new(InMemoryTokenStore::new()),
        )
    }
}

/// The user resolved by [`require_auth`] for the current request.
#[derive(Debug, Clone)]
pub struct SessionUser(pub AuthenticatedUser);

impl<S> FromRequestParts<S> for SessionUser
where
    S: Send + Sync,
{
    type Rejection = KeycloakError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<SessionUser>()
            .cloned()
            .ok_or(KeycloakError::Unauthenticated)
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ServiceTokenBody {
    pub access_token: Option<String>,
}

pub fn auth_routes(state: AuthState) -> Router {
    let protected = Router::new()
        .route(&format!("{AUTH_PATH}/service-token"), get(service_token))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_auth));

    Router::new()
        .route(&format!("{AUTH_PATH}/login"), get(login))
        .route(CALLBACK_PATH, get(callback))
        .route(&format!("{AUTH_PATH}/logout"), get(logout).post(logout))
        .merge(protected)
        .with_state(state)
}

/// Resolves the session user, refreshing expired tokens when possible.
///
/// The returned jar carries a new session cookie if the tokens were
/// refreshed, or a removal cookie if the session is no longer usable.
/// Refreshes of one session are serialized through
/// [`RefreshCoordinator`], so concurrent requests share a single refresh.
pub async fn authenticate(
    state: &AuthState,
    jar: CookieJar,
) -> KeycloakResult<(CookieJar, Option<AuthenticatedUser>)> {
    let sessions = &state.sessions;
    let Some(token) = jar
        .get(&sessions.config().cookie_name)
        .map(|cookie| cookie.value().to_string())
    else {
        return Ok((jar, None));
    };

    let session = match sessions.load(&token).await {
        Ok(session) => session,
        Err(SessionError::Store(e)) => return Err(SessionError::Store(e).into()),
        Err(e) => {
            if let Some(refreshed) = replaced_session(state, &token).await {
                debug!("Session cookie was replaced by a recent refresh");
                return Ok(with_refreshed(state, jar, refreshed));
            }
            debug!(error = %e, "Ignoring unusable session cookie");
            return Ok((jar.remove(sessions.removal_cookie()), None));
        }
    };

    let user = session.user;
    if state.client.introspect(Some(&user.access_token)).await {
        return Ok((jar, Some(user)));
    }

    let mut slot = state.refreshes.lock(&session.id).await;
    if let Some(refreshed) = (*slot).clone().filter(RefreshedSession::is_fresh) {
        debug!(user_id = %user.user_id, "Session already refreshed by a concurrent request");
        return Ok(with_refreshed(state, jar, refreshed));
    }

    let refreshed = state
        .client
        .refresh_tokens(Some(&user.refresh_token))
        .await?;
    sessions.end_session(&session.id).await?;

    let Some((access_token, refresh_token)) = refreshed.into_complete() else {
        state.refreshes.forget(&session.id);
        info!(user_id = %user.user_id, "Session tokens could not be refreshed");
        return Ok((jar.remove(sessions.removal_cookie()), None));
    };

    let user = user.with_tokens(access_token, refresh_token);
    let value = sessions.bind_user(user.clone()).await?;
    *slot = Some(RefreshedSession::new(value.clone(), user.clone()));
    debug!(user_id = %user.user_id, "Rebound session with refreshed tokens");

    Ok((jar.add(sessions.session_cookie(value)), Some(user)))
}

async fn replaced_session(state: &AuthState, token: &str) -> Option<RefreshedSession> {
    let session_id = state.sessions.session_id(token).ok()?;
    state.refreshes.recent(&session_id).await
}

fn with_refreshed(
    state: &AuthState,
    jar: CookieJar,
    refreshed: RefreshedSession,
) -> (CookieJar, Option<AuthenticatedUser>) {
    let jar = jar.add(state.sessions.session_cookie(refreshed.cookie_value));
    (jar, Some(refreshed.user))
}

/// Middleware that rejects requests without a live Keycloak session.
pub async fn require_auth(
    State(state): State<AuthState>,
    jar: CookieJar,
    mut request: Request,
    next: Next,
) -> Response {
    match authenticate(&state, jar).await {
        Ok((jar, Some(user))) => {
            request.extensions_mut().insert(SessionUser(user));
            (jar, next.run(request).await).into_response()
        }
        Ok((jar, None)) => (jar, KeycloakError::Unauthenticated).into_response(),
        Err(e) => e.into_response(),
    }
}

async fn login(
    State(state): State<AuthState>,
    jar: CookieJar,
) -> KeycloakResult<(CookieJar, Redirect)> {
    let flow_state = Uuid::new_v4().to_string();
    let pkce = PkceChallenge::new();
    let url = state.client.authorization_url(&flow_state, &pkce)?;

    let jar = jar
        .add(flow_cookie(STATE_COOKIE_NAME, flow_state, state.sessions.config().secure))
        .add(flow_cookie(
            PKCE_COOKIE_NAME,
            pkce.code_verifier,
            state.sessions.config().secure,
        ));

    info!("Redirecting to Keycloak login");
    Ok((jar, Redirect::to(&url)))
}

async fn callback(
    State(state): State<AuthState>,
    jar: CookieJar,
    Query(params): Query<CallbackQuery>,
) -> KeycloakResult<(CookieJar, Redirect)> {
    info!("Handling Keycloak callback");

    if let Some(error) = &params.error {
        let description = params
            .error_description
            .as_deref()
            .unwrap_or("No description");
        warn!(error = %error, description, "Keycloak returned an error to the callback");
        return Err(KeycloakError::CallbackError(format!("{error}: {description}")));
    }

    let code = params
        .code
        .ok_or_else(|| KeycloakError::CallbackError("Missing authorization code".to_string()))?;
    let received_state = params.state.ok_or(KeycloakError::InvalidState)?;
    let stored_state = cookie_value(&jar, STATE_COOKIE_NAME).ok_or(KeycloakError::InvalidState)?;
    if received_state != stored_state {
        warn!("Keycloak state mismatch");
        return Err(KeycloakError::InvalidState);
    }
    let code_verifier = cookie_value(&jar, PKCE_COOKIE_NAME).ok_or(KeycloakError::InvalidState)?;

    let tokens = state.client.exchange_code(&code, &code_verifier).await?;
    let user_info = match tokens.get("access_token").and_then(serde_json::Value::as_str) {
        Some(access_token) => Some(state.client.user_info(access_token).await?),
        None => None,
    };

    let payload =
        CallbackPayload::from_token_response(state.provider.issuer(), user_info.as_ref(), &tokens);
    let payload = serde_json::to_value(payload).map_err(IdentityError::from)?;
    let user = state.provider.verify(payload).await?;
    let user_id = user.user_id.clone();

    let value = state.sessions.bind_user(user).await?;

    let jar = jar
        .add(state.sessions.session_cookie(value))
        .remove(clear_flow_cookie(STATE_COOKIE_NAME))
        .remove(clear_flow_cookie(PKCE_COOKIE_NAME));

    info!(user_id = %user_id, "Keycloak login successful");
    let home = format!(
        "{}/",
        state.client.config().app_host_uri.trim_end_matches('/')
    );
    Ok((jar, Redirect::to(&home)))
}

/// Ends the local session and sends the browser to Keycloak's end-session
/// endpoint. A failure to end the session is returned as an error.
async fn logout(
    State(state): State<AuthState>,
    jar: CookieJar,
) -> KeycloakResult<(CookieJar, Redirect)> {
    let sessions = &state.sessions;

    if let Some(cookie) = jar.get(&sessions.config().cookie_name) {
        match sessions.session_id(cookie.value()) {
            Ok(session_id) => {
                sessions
                    .end_session(&session_id)
                    .await
                    .inspect_err(|e| error!(error = %e, "Failed to end session on logout"))?;
            }
            Err(e) => debug!(error = %e, "Logout with unreadable session cookie"),
        }
    }

    let url = state
        .client
        .logout_url(&state.client.config().post_logout_redirect_uri())?;

    info!("Redirecting to Keycloak logout");
    Ok((jar.remove(sessions.removal_cookie()), Redirect::to(&url)))
}

async fn service_token(
    State(state): State<AuthState>,
    SessionUser(user): SessionUser,
) -> KeycloakResult<Json<ServiceTokenBody>> {
    let access_token = state
        .service_tokens
        .get_or_fetch_service_token(&user.user_id)
        .await?;
    Ok(Json(ServiceTokenBody { access_token }))
}

fn flow_cookie(name: &'static str, value: String, secure: bool) -> Cookie<'static> {
    Cookie::build((name, value))
        .http_only(true)
        .secure(secure)
        .same_site(SameSite::Lax)
        .path(AUTH_PATH)
        .max_age(time::Duration::minutes(5))
        .build()
}

fn clear_flow_cookie(name: &'static str) -> Cookie<'static> {
    Cookie::build((name, "")).path(AUTH_PATH).build()
}

fn cookie_value(jar: &CookieJar, name: &str) -> Option<String> {
    jar.get(name).map(|cookie| cookie.value().to_string())
}
