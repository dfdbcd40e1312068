//! Error types for the OIDC sandbox provider.
//!
//! The enum covers the full taxonomy the protocol needs to surface:
//! fatal startup errors (bad key file, malformed client list), authorize-time
//! validation failures (mapped to RFC 6749 error codes, redirected to the
//! client when the redirect URI itself validated), token-endpoint failures
//! (`invalid_client`, `invalid_grant`), and replay detection.

use std::io;

use axum::http::StatusCode;
use thiserror::Error;

/// Result type alias for the OIDC sandbox provider.
pub type Result<T> = std::result::Result<T, Error>;

/// OIDC sandbox errors.
#[derive(Error, Debug)]
pub enum Error {
    // ── Fatal, startup-only ────────────────────────────────────────────────
    /// Configuration error (malformed client list, bad duration, …)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Signing key file missing, unreadable, or not a PKCS#8 RSA key
    #[error("Key load error: {0}")]
    KeyLoad(String),

    /// Key material cannot be used with the configured signing algorithm
    #[error("Unsupported signing algorithm: {0}")]
    UnsupportedAlgorithm(String),

    // ── Authorization endpoint validation ──────────────────────────────────
    /// `client_id` is not in the registry
    #[error("Unknown client: {0}")]
    UnknownClient(String),

    /// Redirect URI is not an exact match against the client's registered set
    #[error("Redirect URI not registered for client '{client_id}': {redirect_uri}")]
    UnregisteredRedirectUri {
        /// The client that presented the URI
        client_id: String,
        /// The rejected URI
        redirect_uri: String,
    },

    /// Malformed or incomplete request parameters
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Requested scopes exceed what the client is registered for
    #[error("Invalid scope: {0}")]
    InvalidScope(String),

    /// Client is not allowed to use the requested grant
    #[error("Client not authorized: {0}")]
    UnauthorizedClient(String),

    /// `response_type` other than `code`
    #[error("Unsupported response type: {0}")]
    UnsupportedResponseType(String),

    // ── Token endpoint ─────────────────────────────────────────────────────
    /// `grant_type` other than `authorization_code` / `refresh_token`
    #[error("Unsupported grant type: {0}")]
    UnsupportedGrantType(String),

    /// Client authentication failed (unknown client or wrong secret)
    #[error("Client authentication failed: {0}")]
    InvalidClientAuth(String),

    /// Authorization code unknown or past its TTL
    #[error("Authorization code not found or expired")]
    CodeNotFound,

    /// Authorization code presented a second time
    #[error("Authorization code already redeemed")]
    CodeReplayed,

    /// Refresh token unknown or past its TTL
    #[error("Refresh token not found or expired")]
    RefreshNotFound,

    /// Refresh token presented again after rotation
    #[error("Refresh token already rotated")]
    RefreshReplayed,

    /// PKCE verifier does not match the stored challenge
    #[error("PKCE verification failed")]
    PkceMismatch,

    /// Code or token presented with the wrong binding (client, redirect URI)
    #[error("Invalid grant: {0}")]
    InvalidGrant(String),

    /// Interaction id unknown, already consumed, or expired
    #[error("Interaction not found or expired: {0}")]
    UnknownInteraction(String),

    /// Access token failed verification or was revoked (userinfo)
    #[error("Access token is not active")]
    InactiveToken,

    // ── Infrastructure ─────────────────────────────────────────────────────
    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// JWT encoding error (signing failures are server faults)
    #[error("JWT error: {0}")]
    Jwt(#[from] jsonwebtoken::errors::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// The RFC 6749 / OIDC error code for this error.
    #[must_use]
    pub fn oauth_code(&self) -> &'static str {
        match self {
            Self::UnknownClient(_) | Self::InvalidClientAuth(_) => "invalid_client",
            Self::UnregisteredRedirectUri { .. }
            | Self::InvalidRequest(_)
            | Self::UnknownInteraction(_) => "invalid_request",
            Self::InvalidScope(_) => "invalid_scope",
            Self::UnauthorizedClient(_) => "unauthorized_client",
            Self::UnsupportedResponseType(_) => "unsupported_response_type",
            Self::UnsupportedGrantType(_) => "unsupported_grant_type",
            Self::CodeNotFound
            | Self::CodeReplayed
            | Self::RefreshNotFound
            | Self::RefreshReplayed
            | Self::PkceMismatch
            | Self::InvalidGrant(_) => "invalid_grant",
            Self::InactiveToken => "invalid_token",
            _ => "server_error",
        }
    }

    /// The HTTP status the error surfaces with when not redirected.
    #[must_use]
    pub fn status(&self) -> StatusCode {
        match self {
            Self::InvalidClientAuth(_) | Self::InactiveToken => StatusCode::UNAUTHORIZED,
            Self::Config(_)
            | Self::KeyLoad(_)
            | Self::UnsupportedAlgorithm(_)
            | Self::Io(_)
            | Self::Json(_)
            | Self::Jwt(_)
            | Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            _ => StatusCode::BAD_REQUEST,
        }
    }

    /// Whether the error may be carried to the client's redirect URI.
    ///
    /// Only authorize-time validation failures on an already-validated
    /// redirect URI qualify (RFC 6749 §4.1.2.1). Everything else — and in
    /// particular any failure of the redirect URI check itself — must be a
    /// direct response, never a redirect.
    #[must_use]
    pub fn redirectable(&self) -> bool {
        matches!(
            self,
            Self::InvalidRequest(_)
                | Self::InvalidScope(_)
                | Self::UnauthorizedClient(_)
                | Self::UnsupportedResponseType(_)
        )
    }

    /// Client-safe description for `error_description` bodies.
    ///
    /// Infrastructure errors are flattened so internals never leak into
    /// protocol responses.
    #[must_use]
    pub fn public_description(&self) -> String {
        match self {
            Self::Io(_) | Self::Json(_) | Self::Jwt(_) | Self::Internal(_) => {
                "internal server error".to_string()
            }
            other => other.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn replay_errors_map_to_invalid_grant() {
        assert_eq!(Error::CodeReplayed.oauth_code(), "invalid_grant");
        assert_eq!(Error::RefreshReplayed.oauth_code(), "invalid_grant");
        assert_eq!(Error::CodeNotFound.oauth_code(), "invalid_grant");
        assert_eq!(Error::PkceMismatch.oauth_code(), "invalid_grant");
    }

    #[test]
    fn client_auth_failure_is_401_invalid_client() {
        let err = Error::InvalidClientAuth("bad secret".to_string());
        assert_eq!(err.oauth_code(), "invalid_client");
        assert_eq!(err.status(), StatusCode::UNAUTHORIZED);
    }

    #[test]
    fn redirect_uri_failure_is_never_redirectable() {
        let err = Error::UnregisteredRedirectUri {
            client_id: "client_id".to_string(),
            redirect_uri: "http://localhost:3000/cb/".to_string(),
        };
        assert!(!err.redirectable());
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn scope_and_response_type_failures_are_redirectable() {
        assert!(Error::InvalidScope("profile".to_string()).redirectable());
        assert!(Error::UnsupportedResponseType("token".to_string()).redirectable());
        assert!(!Error::CodeReplayed.redirectable());
    }

    #[test]
    fn infrastructure_errors_never_leak_details() {
        let err = Error::Internal("dashmap shard poisoned at 0x1234".to_string());
        assert_eq!(err.public_description(), "internal server error");
        assert_eq!(err.oauth_code(), "server_error");
    }
}
