use std::{net::SocketAddr, sync::Arc};

use axum::{
    extract::State,
    http::{header, HeaderMap, StatusCode},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use server_api::{mint_session, provision_application, verify_identity_token, ApiContext, TokenConfig};
use shared::{
    error::{ApiError, ErrorCode},
    protocol::{AuthSession, ProvisionPayload, ProvisionResponse, RequestRecord},
};
use storage::Storage;
use tracing::{error, info};

mod config;

use config::{load_settings, prepare_database_url};

#[derive(Clone)]
struct AppState {
    api: ApiContext,
}

#[derive(Debug, Deserialize)]
struct LoginRequest {
    username: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt().with_env_filter("info").init();

    let settings = load_settings();
    let database_url = prepare_database_url(&settings.database_url)?;
    let storage = Storage::new(&database_url).await.map_err(|error| {
        error!(
            %database_url,
            %error,
            "failed to open SQLite database; verify parent directory exists and permissions are correct"
        );
        error
    })?;
    let api = ApiContext {
        storage,
        tokens: TokenConfig {
            signing_secret: settings.token_secret,
            issuer: settings.token_issuer,
            ttl_seconds: settings.token_ttl_seconds,
            public_url: settings.server_public_url,
        },
    };

    let state = AppState { api };
    let app = build_router(Arc::new(state));

    let addr: SocketAddr = settings.server_bind.parse()?;
    info!(%addr, "provisioning server listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/login", post(login))
        .route("/createBRApp", post(create_br_app))
        .route("/requests", get(http_list_requests))
        .with_state(state)
}

async fn healthz() -> &'static str {
    "ok"
}

async fn login(
    State(state): State<Arc<AppState>>,
    Json(req): Json<LoginRequest>,
) -> Result<Json<AuthSession>, (StatusCode, Json<ApiError>)> {
    let username = req.username.trim();
    if username.is_empty() {
        return Err((
            StatusCode::BAD_REQUEST,
            Json(ApiError::new(ErrorCode::Validation, "username is required")),
        ));
    }

    let session = mint_session(&state.api.tokens, username)
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, Json(e)))?;
    Ok(Json(session))
}

async fn create_br_app(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(payload): Json<ProvisionPayload>,
) -> Result<Json<ProvisionResponse>, (StatusCode, Json<ApiError>)> {
    // The admin console sends the bare identity token, not `Bearer <token>`.
    let token = headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .ok_or_else(|| {
            (
                StatusCode::UNAUTHORIZED,
                Json(ApiError::new(
                    ErrorCode::Unauthorized,
                    "missing identity token",
                )),
            )
        })?;
    verify_identity_token(&state.api.tokens, token)
        .map_err(|e| (StatusCode::UNAUTHORIZED, Json(e)))?;

    let response = provision_application(&state.api, &payload)
        .await
        .map_err(|e| (status_for(&e.code), Json(e)))?;
    Ok(Json(response))
}

async fn http_list_requests(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<RequestRecord>>, (StatusCode, Json<ApiError>)> {
    let requests = state.api.storage.list_requests().await.map_err(|e| {
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(ApiError::new(ErrorCode::Internal, e.to_string())),
        )
    })?;
    Ok(Json(requests))
}

fn status_for(code: &ErrorCode) -> StatusCode {
    match code {
        ErrorCode::Unauthorized => StatusCode::UNAUTHORIZED,
        ErrorCode::Forbidden => StatusCode::FORBIDDEN,
        ErrorCode::NotFound => StatusCode::NOT_FOUND,
        ErrorCode::Validation => StatusCode::BAD_REQUEST,
        ErrorCode::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

#[cfg(test)]
#[path = "tests/main_tests.rs"]
mod tests;
