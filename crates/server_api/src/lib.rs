use chrono::{Duration, Utc};
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use tracing::info;

use shared::{
    error::{ApiError, ErrorCode},
    protocol::{AuthSession, ProvisionPayload, ProvisionResponse},
};
use storage::Storage;

#[derive(Clone)]
pub struct ApiContext {
    pub storage: Storage,
    pub tokens: TokenConfig,
}

#[derive(Debug, Clone)]
pub struct TokenConfig {
    pub signing_secret: String,
    pub issuer: String,
    pub ttl_seconds: i64,
    /// Base URL of the hosted chat page. When set, provisioning responses
    /// carry a `publicURL` pointing at the new application.
    pub public_url: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    pub iss: String,
    pub sub: String,
    pub iat: i64,
    pub exp: i64,
    pub token_use: String,
}

fn mint_token(
    cfg: &TokenConfig,
    subject: &str,
    token_use: &str,
) -> Result<String, jsonwebtoken::errors::Error> {
    let now = Utc::now();
    let exp = now + Duration::seconds(cfg.ttl_seconds);
    let claims = Claims {
        iss: cfg.issuer.clone(),
        sub: subject.to_string(),
        iat: now.timestamp(),
        exp: exp.timestamp(),
        token_use: token_use.to_string(),
    };
    encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(cfg.signing_secret.as_bytes()),
    )
}

/// Issues the access/identity token pair for an operator session.
pub fn mint_session(cfg: &TokenConfig, username: &str) -> Result<AuthSession, ApiError> {
    let subject = format!("user:{username}");
    let access_token = mint_token(cfg, &subject, "access")
        .map_err(|e| ApiError::new(ErrorCode::Internal, format!("token mint failed: {e}")))?;
    let id_token = mint_token(cfg, &subject, "id")
        .map_err(|e| ApiError::new(ErrorCode::Internal, format!("token mint failed: {e}")))?;
    Ok(AuthSession {
        access_token: Some(access_token),
        id_token: Some(id_token),
    })
}

/// Verifies the raw identity token carried in the `Authorization` header.
/// Note the original wire format sends the bare token, not `Bearer <token>`.
pub fn verify_identity_token(cfg: &TokenConfig, token: &str) -> Result<Claims, ApiError> {
    let mut validation = Validation::default();
    validation.set_issuer(&[cfg.issuer.as_str()]);
    let data = decode::<Claims>(
        token,
        &DecodingKey::from_secret(cfg.signing_secret.as_bytes()),
        &validation,
    )
    .map_err(|e| ApiError::new(ErrorCode::Unauthorized, format!("invalid identity token: {e}")))?;
    if data.claims.token_use != "id" {
        return Err(ApiError::new(
            ErrorCode::Unauthorized,
            "token is not an identity token",
        ));
    }
    Ok(data.claims)
}

/// Provisions a chatbot application for a submitted request payload: records
/// the application, mints its access token, and derives the public chat URL
/// when one is configured.
pub async fn provision_application(
    ctx: &ApiContext,
    payload: &ProvisionPayload,
) -> Result<ProvisionResponse, ApiError> {
    if payload.id.0.trim().is_empty() {
        return Err(ApiError::new(ErrorCode::Validation, "request id is required"));
    }
    if payload.customer_name.trim().is_empty() {
        return Err(ApiError::new(
            ErrorCode::Validation,
            "customer name is required",
        ));
    }
    if !payload.email.contains('@') {
        return Err(ApiError::new(
            ErrorCode::Validation,
            "contact email is invalid",
        ));
    }

    let application = ctx
        .storage
        .create_application(&payload.id)
        .await
        .map_err(internal)?;

    let token = mint_token(&ctx.tokens, &application.application_id.0, "chatbot")
        .map_err(|e| ApiError::new(ErrorCode::Internal, format!("token mint failed: {e}")))?;

    let public_url = ctx.tokens.public_url.as_ref().map(|base| {
        serde_json::Value::String(format!(
            "{}/chat/{}",
            base.trim_end_matches('/'),
            application.application_id
        ))
    });

    info!(
        request_id = %payload.id,
        application_id = %application.application_id,
        public_url = public_url.is_some(),
        "provisioned chatbot application"
    );

    Ok(ProvisionResponse {
        application_id_q: application.application_id,
        token,
        public_url,
    })
}

fn internal(err: anyhow::Error) -> ApiError {
    ApiError::new(ErrorCode::Internal, err.to_string())
}
