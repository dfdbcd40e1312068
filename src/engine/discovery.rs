//! Issuer discovery metadata (RFC 8414 / OIDC Discovery 1.0).
//!
//! The document is derived from static configuration only; it never touches
//! the flow state machine.

use serde::{Deserialize, Serialize};

use crate::keys::SIGNING_ALG;

use super::OidcEngine;

/// The `/.well-known/openid-configuration` response body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveryDocument {
    /// Issuer identifier; token `iss` claims match it exactly.
    pub issuer: String,
    /// The authorization endpoint URL.
    pub authorization_endpoint: String,
    /// The token endpoint URL.
    pub token_endpoint: String,
    /// The published JWKS URL.
    pub jwks_uri: String,
    /// The userinfo endpoint URL.
    pub userinfo_endpoint: String,
    /// Only the authorization-code flow is served.
    pub response_types_supported: Vec<String>,
    /// Grant types accepted at the token endpoint.
    pub grant_types_supported: Vec<String>,
    /// All subjects are public (one synthetic account).
    pub subject_types_supported: Vec<String>,
    /// ID token signing algorithms.
    pub id_token_signing_alg_values_supported: Vec<String>,
    /// Scopes the provider knows about.
    pub scopes_supported: Vec<String>,
    /// Claims the provider may release.
    pub claims_supported: Vec<String>,
    /// Client authentication methods at the token endpoint.
    pub token_endpoint_auth_methods_supported: Vec<String>,
    /// PKCE challenge methods.
    pub code_challenge_methods_supported: Vec<String>,
}

impl OidcEngine {
    /// Build the discovery document from the engine's static configuration.
    #[must_use]
    pub fn discovery(&self) -> DiscoveryDocument {
        let issuer = &self.issuer;
        DiscoveryDocument {
            issuer: issuer.clone(),
            authorization_endpoint: format!("{issuer}/authorize"),
            token_endpoint: format!("{issuer}/token"),
            jwks_uri: format!("{issuer}/jwks"),
            userinfo_endpoint: format!("{issuer}/userinfo"),
            response_types_supported: vec!["code".to_string()],
            grant_types_supported: vec![
                "authorization_code".to_string(),
                "refresh_token".to_string(),
            ],
            subject_types_supported: vec!["public".to_string()],
            id_token_signing_alg_values_supported: vec![SIGNING_ALG.to_string()],
            scopes_supported: self.scopes_supported.clone(),
            claims_supported: self.claims_supported.clone(),
            token_endpoint_auth_methods_supported: vec![
                "client_secret_basic".to_string(),
                "client_secret_post".to_string(),
            ],
            code_challenge_methods_supported: vec!["S256".to_string()],
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::engine::testing;

    #[tokio::test]
    async fn endpoints_hang_off_the_issuer() {
        let (engine, _identity) = testing::engine().await;
        let doc = engine.discovery();

        assert_eq!(doc.issuer, "http://localhost:4000");
        assert_eq!(doc.authorization_endpoint, "http://localhost:4000/authorize");
        assert_eq!(doc.token_endpoint, "http://localhost:4000/token");
        assert_eq!(doc.jwks_uri, "http://localhost:4000/jwks");
        assert_eq!(doc.userinfo_endpoint, "http://localhost:4000/userinfo");
    }

    #[tokio::test]
    async fn only_the_code_flow_is_advertised() {
        let (engine, _identity) = testing::engine().await;
        let doc = engine.discovery();

        assert_eq!(doc.response_types_supported, vec!["code"]);
        assert_eq!(
            doc.grant_types_supported,
            vec!["authorization_code", "refresh_token"]
        );
        assert_eq!(doc.id_token_signing_alg_values_supported, vec!["RS256"]);
        assert_eq!(doc.code_challenge_methods_supported, vec!["S256"]);
    }

    #[tokio::test]
    async fn scopes_and_claims_reflect_configuration() {
        let (engine, _identity) = testing::engine_with(|config| {
            config.claims.insert(
                "profile".to_string(),
                vec!["name".to_string(), "nickname".to_string()],
            );
        })
        .await;
        let doc = engine.discovery();

        assert!(doc.scopes_supported.contains(&"openid".to_string()));
        assert!(doc.scopes_supported.contains(&"profile".to_string()));
        assert!(doc.claims_supported.contains(&"nickname".to_string()));
        assert!(doc.claims_supported.contains(&"sub".to_string()));
    }
}
