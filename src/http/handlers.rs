//! Endpoint handlers.
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `GET`  | `/.well-known/openid-configuration` | Issuer metadata |
//! | `GET`  | `/jwks` | Published verification keys |
//! | `GET`  | `/authorize` | Authorization endpoint (code flow) |
//! | `GET`  | `/interaction/{id}` | Login/consent resolution |
//! | `POST` | `/token` | Code exchange and refresh rotation |
//! | `GET`  | `/userinfo` | Claims for a bearer access token |
//! | `GET`  | `/health` | Liveness probe |
//!
//! The interaction endpoint is where the broker boundary shows: the handler
//! reads the pending request, asks the configured [`InteractionBroker`] for a
//! decision, applies it, and redirects the user agent onward. With the
//! shipped auto-approve broker the whole login happens inside this one
//! round-trip.
//!
//! [`InteractionBroker`]: crate::engine::InteractionBroker

use std::sync::Arc;

use axum::{
    Form, Json,
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode, header},
    response::{IntoResponse, Redirect, Response},
};
use base64::{Engine as _, engine::general_purpose::STANDARD};
use serde_json::{Value, json};
use tracing::debug;

use crate::Error;
use crate::engine::{AuthorizationParams, AuthorizeOutcome, ClientCredentials, TokenRequest};

use super::router::AppState;

/// RFC 6749 §5.1 required headers for token responses.
type TokenResponseHeaders = [(header::HeaderName, &'static str); 2];
const TOKEN_HEADERS: TokenResponseHeaders = [
    (header::CACHE_CONTROL, "no-store"),
    (header::PRAGMA, "no-cache"),
];

/// `GET /.well-known/openid-configuration`
pub async fn discovery(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.engine.discovery())
}

/// `GET /jwks`
pub async fn jwks(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.engine.jwks())
}

/// `GET /health`
pub async fn health() -> impl IntoResponse {
    Json(json!({"status": "ok"}))
}

/// `GET /authorize` — validate the request and park it as an interaction.
pub async fn authorize(
    State(state): State<Arc<AppState>>,
    Query(params): Query<AuthorizationParams>,
) -> Response {
    match state.engine.begin_authorization(params).await {
        Ok(AuthorizeOutcome::Interaction(interaction)) => {
            debug!(interaction = %interaction.interaction_id, "Authorization parked");
            Redirect::to(&format!("/interaction/{}", interaction.interaction_id))
                .into_response()
        }
        // The redirect URI validated, so the error travels to the client.
        Ok(AuthorizeOutcome::ErrorRedirect(url)) => Redirect::to(url.as_str()).into_response(),
        Err(err) => error_response(&err),
    }
}

/// `GET /interaction/{id}` — resolve a pending login/consent decision.
pub async fn interaction(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Response {
    let pending = match state.engine.interaction_details(&id) {
        Ok(pending) => pending,
        Err(err) => return error_response(&err),
    };

    let decision = state.engine.broker.decide(&pending).await;
    match state.engine.resolve_interaction(&id, decision).await {
        Ok(url) => Redirect::to(url.as_str()).into_response(),
        Err(err) => error_response(&err),
    }
}

/// `POST /token` — exchange a code or rotate a refresh token.
pub async fn token(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Form(request): Form<TokenRequest>,
) -> Response {
    let Some(credentials) = client_credentials(&headers, &request) else {
        let err = Error::InvalidClientAuth("client credentials are required".to_string());
        return token_error_response(&err);
    };

    match state.engine.exchange(&credentials, &request).await {
        Ok(response) => (TOKEN_HEADERS, Json(response)).into_response(),
        Err(err) => token_error_response(&err),
    }
}

/// `GET /userinfo` — claims for a bearer access token.
pub async fn userinfo(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Response {
    let Some(bearer) = bearer_token(&headers) else {
        return unauthorized_bearer();
    };
    match state.engine.userinfo(bearer).await {
        Ok(claims) => Json(Value::Object(claims)).into_response(),
        Err(_) => unauthorized_bearer(),
    }
}

// ── Helpers ─────────────────────────────────────────────────────────────────

/// Client credentials from the `Basic` header, falling back to the form body.
fn client_credentials(headers: &HeaderMap, request: &TokenRequest) -> Option<ClientCredentials> {
    if let Some(credentials) = basic_credentials(headers) {
        return Some(credentials);
    }
    match (&request.client_id, &request.client_secret) {
        (Some(client_id), Some(client_secret)) => Some(ClientCredentials {
            client_id: client_id.clone(),
            client_secret: client_secret.clone(),
        }),
        _ => None,
    }
}

/// Parse `Authorization: Basic <base64(id:secret)>`.
fn basic_credentials(headers: &HeaderMap) -> Option<ClientCredentials> {
    let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    let encoded = value.strip_prefix("Basic ")?;
    let decoded = String::from_utf8(STANDARD.decode(encoded).ok()?).ok()?;
    let (client_id, client_secret) = decoded.split_once(':')?;
    Some(ClientCredentials {
        client_id: client_id.to_string(),
        client_secret: client_secret.to_string(),
    })
}

/// Extract the bearer token from the `Authorization` header.
fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
}

/// Direct `{error, error_description}` response for an engine error.
pub(crate) fn error_response(err: &Error) -> Response {
    (
        err.status(),
        Json(json!({
            "error": err.oauth_code(),
            "error_description": err.public_description(),
        })),
    )
        .into_response()
}

/// Token endpoint error: no-store headers plus `WWW-Authenticate` on 401.
fn token_error_response(err: &Error) -> Response {
    let status = err.status();
    let body = Json(json!({
        "error": err.oauth_code(),
        "error_description": err.public_description(),
    }));
    if status == StatusCode::UNAUTHORIZED {
        (
            status,
            [(header::WWW_AUTHENTICATE, "Basic realm=\"oidc-sandbox\"")],
            TOKEN_HEADERS,
            body,
        )
            .into_response()
    } else {
        (status, TOKEN_HEADERS, body).into_response()
    }
}

/// 401 with the RFC 6750 challenge header for the userinfo endpoint.
fn unauthorized_bearer() -> Response {
    (
        StatusCode::UNAUTHORIZED,
        [(header::WWW_AUTHENTICATE, "Bearer error=\"invalid_token\"")],
        Json(json!({"error": "invalid_token"})),
    )
        .into_response()
}
