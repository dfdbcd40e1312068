//! Token endpoint — code exchange, refresh rotation, and userinfo.
//!
//! Every path starts with client authentication. The code path redeems the
//! single-use code, re-checks the bindings the code was minted with (client,
//! redirect URI, PKCE challenge), and only then mints tokens. Binding checks
//! run after redemption on purpose: a code that reaches the endpoint with
//! the wrong binding is burned, it cannot be retried with the right one.
//!
//! Access tokens are RS256 JWTs whose `jti` is also recorded in the grant
//! store, so replay-driven revocation makes them drop out of `userinfo`
//! before their `exp`.

use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use jsonwebtoken::{Algorithm, Validation};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

use crate::clients::RegisteredClient;
use crate::identity::Account;
use crate::store::{self, AccessRecord, NewRefresh, unix_now};
use crate::{Error, Result};

use super::OidcEngine;
use super::audit::{self, AuditEvent};

/// Client credentials presented at the token endpoint, from the `Basic`
/// header or the form body.
#[derive(Debug, Clone)]
pub struct ClientCredentials {
    /// Client identifier.
    pub client_id: String,
    /// Shared secret.
    pub client_secret: String,
}

/// Raw form parameters of a token request.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TokenRequest {
    /// `authorization_code` or `refresh_token`.
    pub grant_type: Option<String>,
    /// The authorization code being exchanged.
    pub code: Option<String>,
    /// Must repeat the redirect URI from the authorization request.
    pub redirect_uri: Option<String>,
    /// PKCE verifier matching the stored challenge.
    pub code_verifier: Option<String>,
    /// The refresh token being rotated.
    pub refresh_token: Option<String>,
    /// Optional scope narrowing on refresh.
    pub scope: Option<String>,
    /// Client id when authenticating through the form body.
    pub client_id: Option<String>,
    /// Client secret when authenticating through the form body.
    pub client_secret: Option<String>,
}

/// Successful token endpoint response (RFC 6749 §5.1).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenResponse {
    /// RS256 JWT access token.
    pub access_token: String,
    /// Always `Bearer`.
    pub token_type: String,
    /// Access token lifetime in seconds.
    pub expires_in: u64,
    /// Space-delimited scopes the tokens carry.
    pub scope: String,
    /// Signed ID token for OIDC requests.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id_token: Option<String>,
    /// Rotating refresh token, when the client may use that grant.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
}

/// Registered claims of an issued access token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccessClaims {
    /// Issuer URL.
    pub iss: String,
    /// Subject (account id).
    pub sub: String,
    /// Audience (client id).
    pub aud: String,
    /// Issued-at (Unix epoch seconds).
    pub iat: u64,
    /// Expires-at (Unix epoch seconds).
    pub exp: u64,
    /// Token identifier, recorded in the grant store.
    pub jti: String,
    /// Space-delimited scopes.
    pub scope: String,
    /// Client the token was issued to.
    pub client_id: String,
}

impl OidcEngine {
    /// Exchange a grant for tokens.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidClientAuth`] on authentication failure, then
    /// per-grant errors: replays, expired artifacts, binding mismatches,
    /// PKCE failures, and unsupported grant types.
    pub async fn exchange(
        &self,
        credentials: &ClientCredentials,
        request: &TokenRequest,
    ) -> Result<TokenResponse> {
        let client = self
            .clients
            .authenticate(&credentials.client_id, &credentials.client_secret)?;

        let result = match request.grant_type.as_deref() {
            Some("authorization_code") => self.exchange_code(client, request).await,
            Some("refresh_token") => self.refresh_grant(client, request).await,
            Some(other) => Err(Error::UnsupportedGrantType(other.to_string())),
            None => Err(Error::InvalidRequest("grant_type is required".to_string())),
        };

        if let Err(ref err) = result {
            audit::emit(&AuditEvent::token_denied(&client.client_id, err));
        }
        result
    }

    /// The `authorization_code` grant.
    async fn exchange_code(
        &self,
        client: &RegisteredClient,
        request: &TokenRequest,
    ) -> Result<TokenResponse> {
        if !client.allows_grant_type("authorization_code") {
            return Err(Error::UnauthorizedClient(
                "client may not use the authorization_code grant".to_string(),
            ));
        }
        let presented = request
            .code
            .as_deref()
            .ok_or_else(|| Error::InvalidRequest("code is required".to_string()))?;

        let code = match self.store.redeem_code(presented).await {
            Ok(code) => code,
            Err(Error::CodeReplayed) => {
                audit::emit(&AuditEvent::code_replayed(&client.client_id));
                return Err(Error::CodeReplayed);
            }
            Err(err) => return Err(err),
        };

        // Binding checks. The code is already burned if any of these fail.
        if code.client_id != client.client_id {
            return Err(Error::InvalidGrant(
                "code was issued to a different client".to_string(),
            ));
        }
        let redirect_uri = request
            .redirect_uri
            .as_deref()
            .ok_or_else(|| Error::InvalidRequest("redirect_uri is required".to_string()))?;
        if code.redirect_uri != redirect_uri {
            return Err(Error::InvalidGrant(
                "redirect_uri does not match the authorization request".to_string(),
            ));
        }
        verify_pkce(code.pkce_challenge.as_deref(), request.code_verifier.as_deref())?;
        audit::emit(&AuditEvent::code_redeemed(&code));

        let account = self
            .accounts
            .resolve_account(&code.account_id)
            .await
            .ok_or_else(|| {
                Error::Internal("authorized account is no longer resolvable".to_string())
            })?;

        // Refresh first so the access record can link to the family.
        let refresh = if client.allows_grant_type("refresh_token") {
            Some(
                self.store
                    .issue_refresh(NewRefresh {
                        grant_id: code.grant_id.clone(),
                        account_id: code.account_id.clone(),
                        client_id: client.client_id.clone(),
                        scopes: code.scopes.clone(),
                        source_code: Some(code.code.clone()),
                        ttl: self.ttl.refresh_token,
                    })
                    .await,
            )
        } else {
            None
        };

        let (access_token, record) = self
            .mint_access_token(
                &code.grant_id,
                &code.account_id,
                &client.client_id,
                &code.scopes,
                Some(code.code.clone()),
                refresh.as_ref().map(|r| r.family_id.clone()),
            )
            .await?;
        let id_token = self.mint_id_token(
            &account,
            &client.client_id,
            &code.scopes,
            code.nonce.as_deref(),
        )?;
        audit::emit(&AuditEvent::token_issued(&record));

        Ok(TokenResponse {
            access_token,
            token_type: "Bearer".to_string(),
            expires_in: self.ttl.access_token.as_secs(),
            scope: code.scopes.join(" "),
            id_token: Some(id_token),
            refresh_token: refresh.map(|r| r.token),
        })
    }

    /// The `refresh_token` grant: rotate, optionally narrow scopes, re-mint.
    async fn refresh_grant(
        &self,
        client: &RegisteredClient,
        request: &TokenRequest,
    ) -> Result<TokenResponse> {
        if !client.allows_grant_type("refresh_token") {
            return Err(Error::UnauthorizedClient(
                "client may not use the refresh_token grant".to_string(),
            ));
        }
        let presented = request
            .refresh_token
            .as_deref()
            .ok_or_else(|| Error::InvalidRequest("refresh_token is required".to_string()))?;

        let rotated = match self.store.rotate_refresh(presented, &client.client_id).await {
            Ok(successor) => successor,
            Err(Error::RefreshReplayed) => {
                audit::emit(&AuditEvent::token_replayed(&client.client_id));
                return Err(Error::RefreshReplayed);
            }
            Err(err) => return Err(err),
        };

        // RFC 6749 §6: the request may narrow the scopes, never widen them.
        let scopes: Vec<String> = match request.scope.as_deref() {
            None => rotated.scopes.clone(),
            Some(requested) => {
                let narrowed: Vec<String> =
                    requested.split_whitespace().map(str::to_string).collect();
                for scope in &narrowed {
                    if !rotated.scopes.contains(scope) {
                        return Err(Error::InvalidScope(format!(
                            "scope '{scope}' exceeds the original grant"
                        )));
                    }
                }
                narrowed
            }
        };

        let account = self
            .accounts
            .resolve_account(&rotated.account_id)
            .await
            .ok_or_else(|| {
                Error::Internal("refreshed account is no longer resolvable".to_string())
            })?;

        let (access_token, record) = self
            .mint_access_token(
                &rotated.grant_id,
                &rotated.account_id,
                &client.client_id,
                &scopes,
                rotated.source_code.clone(),
                Some(rotated.family_id.clone()),
            )
            .await?;
        // A refreshed ID token carries no nonce; that belongs to the
        // original front-channel round-trip.
        let id_token = if scopes.iter().any(|s| s == "openid") {
            Some(self.mint_id_token(&account, &client.client_id, &scopes, None)?)
        } else {
            None
        };
        audit::emit(&AuditEvent::token_refreshed(&client.client_id, &rotated.family_id));
        audit::emit(&AuditEvent::token_issued(&record));

        Ok(TokenResponse {
            access_token,
            token_type: "Bearer".to_string(),
            expires_in: self.ttl.access_token.as_secs(),
            scope: scopes.join(" "),
            id_token,
            refresh_token: Some(rotated.token),
        })
    }

    /// Resolve claims for a bearer access token (the userinfo endpoint).
    ///
    /// # Errors
    ///
    /// [`Error::InactiveToken`] for anything that should read as 401:
    /// signature or expiry failure, unknown `jti`, revoked token, or an
    /// unresolvable subject.
    pub async fn userinfo(&self, bearer: &str) -> Result<Map<String, Value>> {
        let mut validation = Validation::new(Algorithm::RS256);
        validation.set_issuer(&[&self.issuer]);
        // The audience is the client; any holder of the token may call
        // userinfo with it.
        validation.validate_aud = false;

        let token = jsonwebtoken::decode::<AccessClaims>(
            bearer,
            self.keys.decoding_key(),
            &validation,
        )
        .map_err(|_| Error::InactiveToken)?;

        if !self.store.access_is_active(&token.claims.jti).await {
            return Err(Error::InactiveToken);
        }
        let account = self
            .accounts
            .resolve_account(&token.claims.sub)
            .await
            .ok_or(Error::InactiveToken)?;

        let scopes: Vec<String> = token
            .claims
            .scope
            .split_whitespace()
            .map(str::to_string)
            .collect();
        Ok(self.build_claims(&account, &scopes))
    }

    /// Mint and record an RS256 access token. Returns the compact JWT and
    /// the store record describing it.
    async fn mint_access_token(
        &self,
        grant_id: &str,
        account_id: &str,
        client_id: &str,
        scopes: &[String],
        source_code: Option<String>,
        refresh_family: Option<String>,
    ) -> Result<(String, AccessRecord)> {
        let now = unix_now();
        let claims = AccessClaims {
            iss: self.issuer.clone(),
            sub: account_id.to_string(),
            aud: client_id.to_string(),
            iat: now,
            exp: now + self.ttl.access_token.as_secs(),
            jti: store::generate_jti(),
            scope: scopes.join(" "),
            client_id: client_id.to_string(),
        };
        let token = self.keys.sign(&claims)?;

        let record = AccessRecord {
            jti: claims.jti,
            grant_id: grant_id.to_string(),
            account_id: account_id.to_string(),
            client_id: client_id.to_string(),
            scopes: scopes.to_vec(),
            source_code,
            refresh_family,
            iat: claims.iat,
            exp: claims.exp,
        };
        self.store.record_access(record.clone()).await;
        Ok((token, record))
    }

    /// Mint the signed ID token for an authentication event.
    fn mint_id_token(
        &self,
        account: &Account,
        client_id: &str,
        scopes: &[String],
        nonce: Option<&str>,
    ) -> Result<String> {
        let now = unix_now();
        let mut claims = self.build_claims(account, scopes);
        claims.insert("iss".to_string(), Value::String(self.issuer.clone()));
        claims.insert("aud".to_string(), Value::String(client_id.to_string()));
        claims.insert("iat".to_string(), Value::from(now));
        claims.insert(
            "exp".to_string(),
            Value::from(now + self.ttl.id_token.as_secs()),
        );
        if let Some(nonce) = nonce {
            claims.insert("nonce".to_string(), Value::String(nonce.to_string()));
        }
        self.keys.sign(&Value::Object(claims))
    }
}

/// Verify a PKCE verifier against the challenge stored with the code.
///
/// S256: `base64url(SHA-256(verifier))` must equal the challenge. Compared
/// in constant time.
fn verify_pkce(challenge: Option<&str>, verifier: Option<&str>) -> Result<()> {
    use subtle::ConstantTimeEq;

    match (challenge, verifier) {
        (None, None) => Ok(()),
        (None, Some(_)) => Err(Error::InvalidGrant(
            "code was issued without a PKCE challenge".to_string(),
        )),
        (Some(_), None) => Err(Error::PkceMismatch),
        (Some(challenge), Some(verifier)) => {
            let computed = URL_SAFE_NO_PAD.encode(Sha256::digest(verifier.as_bytes()));
            let matches: bool = computed.as_bytes().ct_eq(challenge.as_bytes()).into();
            if matches {
                Ok(())
            } else {
                Err(Error::PkceMismatch)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::testing;
    use jsonwebtoken::decode;

    #[tokio::test]
    async fn code_exchange_issues_verifiable_tokens() {
        // GIVEN: an authorized code
        let (engine, identity) = testing::engine().await;
        let code = testing::authorized_code(&engine, &identity).await;

        // WHEN: the client exchanges it
        let response = engine
            .exchange(&testing::credentials(), &testing::code_request(&code))
            .await
            .unwrap();

        // THEN: the response is a Bearer grant with both tokens
        assert_eq!(response.token_type, "Bearer");
        assert_eq!(response.scope, "openid");
        assert!(response.refresh_token.as_deref().unwrap().starts_with("oidcsb_rt_"));

        // AND: the access token verifies against the engine's own key
        let mut validation = Validation::new(Algorithm::RS256);
        validation.set_audience(&["client_id"]);
        let access = decode::<AccessClaims>(
            &response.access_token,
            engine.keys.decoding_key(),
            &validation,
        )
        .unwrap();
        assert_eq!(access.claims.sub, identity.account().account_id);
        assert_eq!(access.claims.iss, engine.issuer);

        // AND: the ID token carries the allow-listed claims and the nonce
        let mut id_validation = Validation::new(Algorithm::RS256);
        id_validation.set_audience(&["client_id"]);
        let id = decode::<Map<String, Value>>(
            response.id_token.as_deref().unwrap(),
            engine.keys.decoding_key(),
            &id_validation,
        )
        .unwrap();
        assert_eq!(id.claims["sub"], identity.account().account_id.as_str());
        assert_eq!(id.claims["email"], identity.account().email.as_str());
        assert_eq!(id.claims["nonce"], testing::NONCE);
    }

    #[tokio::test]
    async fn second_exchange_of_the_same_code_is_a_replay() {
        let (engine, identity) = testing::engine().await;
        let code = testing::authorized_code(&engine, &identity).await;
        let request = testing::code_request(&code);

        engine.exchange(&testing::credentials(), &request).await.unwrap();
        let err = engine
            .exchange(&testing::credentials(), &request)
            .await
            .unwrap_err();

        assert!(matches!(err, Error::CodeReplayed));
    }

    #[tokio::test]
    async fn replay_revokes_the_previously_issued_access_token() {
        // GIVEN: tokens issued from a code
        let (engine, identity) = testing::engine().await;
        let code = testing::authorized_code(&engine, &identity).await;
        let request = testing::code_request(&code);
        let response = engine
            .exchange(&testing::credentials(), &request)
            .await
            .unwrap();
        assert!(engine.userinfo(&response.access_token).await.is_ok());

        // WHEN: the code is replayed
        let _ = engine.exchange(&testing::credentials(), &request).await;

        // THEN: the earlier access token stops working at userinfo
        assert!(matches!(
            engine.userinfo(&response.access_token).await,
            Err(Error::InactiveToken)
        ));
    }

    #[tokio::test]
    async fn wrong_client_secret_is_rejected_before_any_redemption() {
        let (engine, identity) = testing::engine().await;
        let code = testing::authorized_code(&engine, &identity).await;

        let bad = ClientCredentials {
            client_id: "client_id".to_string(),
            client_secret: "wrong".to_string(),
        };
        let err = engine
            .exchange(&bad, &testing::code_request(&code))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidClientAuth(_)));

        // The code is still redeemable by the real client.
        assert!(
            engine
                .exchange(&testing::credentials(), &testing::code_request(&code))
                .await
                .is_ok()
        );
    }

    #[tokio::test]
    async fn redirect_uri_mismatch_burns_the_code() {
        let (engine, identity) = testing::engine().await;
        let code = testing::authorized_code(&engine, &identity).await;

        let mut request = testing::code_request(&code);
        request.redirect_uri = Some("http://localhost:3000/other".to_string());
        let err = engine
            .exchange(&testing::credentials(), &request)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidGrant(_)));

        // A retry with the right URI finds the code already used.
        let err = engine
            .exchange(&testing::credentials(), &testing::code_request(&code))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::CodeReplayed));
    }

    #[tokio::test]
    async fn pkce_verifier_is_required_and_checked() {
        // GIVEN: a code minted under an S256 challenge
        let (engine, identity) = testing::engine().await;
        let code = testing::authorized_code_with_pkce(&engine, &identity).await;

        // Missing verifier fails.
        let request = testing::code_request(&code);
        let err = engine
            .exchange(&testing::credentials(), &request)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::PkceMismatch));

        // GIVEN: a fresh code (the last one burned)
        let code = testing::authorized_code_with_pkce(&engine, &identity).await;
        let mut request = testing::code_request(&code);
        request.code_verifier = Some("not-the-right-verifier-but-long-enough-43ch".to_string());
        let err = engine
            .exchange(&testing::credentials(), &request)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::PkceMismatch));

        // The correct verifier succeeds.
        let code = testing::authorized_code_with_pkce(&engine, &identity).await;
        let mut request = testing::code_request(&code);
        request.code_verifier = Some(testing::S256_VERIFIER.to_string());
        assert!(engine.exchange(&testing::credentials(), &request).await.is_ok());
    }

    #[tokio::test]
    async fn refresh_rotates_and_replaying_the_old_token_kills_the_family() {
        // GIVEN: a refresh token from a code exchange
        let (engine, identity) = testing::engine().await;
        let code = testing::authorized_code(&engine, &identity).await;
        let first = engine
            .exchange(&testing::credentials(), &testing::code_request(&code))
            .await
            .unwrap();
        let old_refresh = first.refresh_token.unwrap();

        // WHEN: it is rotated
        let second = engine
            .exchange(&testing::credentials(), &testing::refresh_request(&old_refresh))
            .await
            .unwrap();
        let new_refresh = second.refresh_token.clone().unwrap();
        assert_ne!(new_refresh, old_refresh);
        assert!(second.id_token.is_some());

        // AND: the rotated-out value is replayed
        let err = engine
            .exchange(&testing::credentials(), &testing::refresh_request(&old_refresh))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::RefreshReplayed));

        // THEN: the successor is dead too
        let err = engine
            .exchange(&testing::credentials(), &testing::refresh_request(&new_refresh))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::RefreshNotFound));

        // AND: the access token minted alongside the successor is revoked
        assert!(matches!(
            engine.userinfo(&second.access_token).await,
            Err(Error::InactiveToken)
        ));
    }

    #[tokio::test]
    async fn refresh_scope_narrowing_is_allowed_widening_is_not() {
        let (engine, identity) = testing::engine().await;
        let code = testing::authorized_code(&engine, &identity).await;
        let first = engine
            .exchange(&testing::credentials(), &testing::code_request(&code))
            .await
            .unwrap();

        let mut request = testing::refresh_request(&first.refresh_token.unwrap());
        request.scope = Some("openid profile".to_string());
        let err = engine
            .exchange(&testing::credentials(), &request)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidScope(_)));
    }

    #[tokio::test]
    async fn unsupported_grant_type_is_rejected() {
        let (engine, _identity) = testing::engine().await;
        let request = TokenRequest {
            grant_type: Some("client_credentials".to_string()),
            ..TokenRequest::default()
        };
        let err = engine
            .exchange(&testing::credentials(), &request)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::UnsupportedGrantType(_)));
    }

    #[tokio::test]
    async fn userinfo_returns_allow_listed_claims() {
        let (engine, identity) = testing::engine().await;
        let code = testing::authorized_code(&engine, &identity).await;
        let response = engine
            .exchange(&testing::credentials(), &testing::code_request(&code))
            .await
            .unwrap();

        let claims = engine.userinfo(&response.access_token).await.unwrap();
        assert_eq!(claims["sub"], identity.account().account_id.as_str());
        assert_eq!(claims["email"], identity.account().email.as_str());
        assert_eq!(claims["name"], identity.account().name.as_str());
    }

    #[tokio::test]
    async fn userinfo_rejects_garbage_and_foreign_tokens() {
        let (engine, _identity) = testing::engine().await;
        assert!(matches!(
            engine.userinfo("not-a-jwt").await,
            Err(Error::InactiveToken)
        ));

        // A well-formed token from another provider instance also fails:
        // both engines share the test key, so the signature verifies, and
        // the rejection comes from the jti being unknown to this store.
        let (other_engine, other_identity) = testing::engine().await;
        let code = testing::authorized_code(&other_engine, &other_identity).await;
        let response = other_engine
            .exchange(&testing::credentials(), &testing::code_request(&code))
            .await
            .unwrap();
        assert!(matches!(
            engine.userinfo(&response.access_token).await,
            Err(Error::InactiveToken)
        ));
    }

    #[test]
    fn pkce_s256_computation_matches_rfc_7636() {
        // Appendix B of RFC 7636: the worked example pair.
        let verifier = "dBjftJeZ4CVP-mB92K27uhbUJU1p1r_wW1gFWFOEjXk";
        let challenge = "E9Melhoa2OwvFrEMTJguCHaoeK1t8URWbuGJSstw-cM";
        assert!(verify_pkce(Some(challenge), Some(verifier)).is_ok());
        assert!(matches!(
            verify_pkce(Some(challenge), Some("wrong-verifier-wrong-verifier-wrong-verif")),
            Err(Error::PkceMismatch)
        ));
        assert!(matches!(
            verify_pkce(None, Some(verifier)),
            Err(Error::InvalidGrant(_))
        ));
        assert!(verify_pkce(None, None).is_ok());
    }
}
