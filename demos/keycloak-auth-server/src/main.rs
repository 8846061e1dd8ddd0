use anyhow::{Context, Result};
use axum::{Router, middleware, response::Html, routing::get};
use ras_identity_keycloak::{AuthState, KeycloakConfig, SessionUser, auth_routes, require_auth};
use std::time::Duration;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const CLEANUP_INTERVAL: Duration = Duration::from_secs(600);

/// Server settings outside the Keycloak configuration
#[derive(Debug, Clone)]
struct ServerConfig {
    host: String,
    port: u16,
}

impl ServerConfig {
    fn from_env() -> Result<Self> {
        Ok(Self {
            host: std::env::var("SERVER_HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
            port: std::env::var("SERVER_PORT")
                .unwrap_or_else(|_| "3000".to_string())
                .parse()
                .context("SERVER_PORT must be a valid port number")?,
        })
    }
}

async fn home(SessionUser(user): SessionUser) -> Html<String> {
    Html(format!(
        r#"<h1>Hello, {}</h1>
<p>User id: <code>{}</code></p>
<p><a href="/api/auth/service-token">Service token</a></p>
<form method="post" action="/api/auth/logout"><button type="submit">Log out</button></form>"#,
        user.username, user.user_id
    ))
}

async fn signed_out() -> Html<&'static str> {
    Html(r#"<h1>Signed out</h1><p><a href="/api/auth/login">Log in with Keycloak</a></p>"#)
}

/// Periodically drops expired sessions and cached service tokens.
fn spawn_cleanup(state: AuthState) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(CLEANUP_INTERVAL);
        loop {
            interval.tick().await;
            match state.sessions.cleanup_expired().await {
                Ok(removed) if removed > 0 => info!(removed, "Removed expired sessions"),
                Ok(_) => {}
                Err(e) => warn!(error = %e, "Session cleanup failed"),
            }
            match state.service_tokens.store().cleanup_expired().await {
                Ok(removed) if removed > 0 => info!(removed, "Removed expired service tokens"),
                Ok(_) => {}
                Err(e) => warn!(error = %e, "Service token cleanup failed"),
            }
        }
    });
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables from .env file if present
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,ras_identity_keycloak=debug")),
        )
        .init();

    let keycloak_config = KeycloakConfig::from_env().context("Invalid Keycloak configuration")?;
    let server_config = ServerConfig::from_env()?;
    info!(issuer = %keycloak_config.issuer(), "Starting Keycloak auth server");

    let state = AuthState::in_memory(keycloak_config)?;
    spawn_cleanup(state.clone());

    let protected = Router::new()
        .route("/", get(home))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_auth));

    let app = Router::new()
        .route("/auth", get(signed_out))
        .merge(protected)
        .merge(auth_routes(state))
        .layer(TraceLayer::new_for_http());

    let bind_addr = format!("{}:{}", server_config.host, server_config.port);
    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("Failed to bind to {}", bind_addr))?;

    info!("Server running on http://{}", bind_addr);

    axum::serve(listener, app).await.context("Server error")?;

    Ok(())
}
