//! Authorization endpoint validation — the `Requested` step of the flow.
//!
//! Validation is two-phased around one security rule: nothing is ever
//! carried to a redirect URI that has not itself been validated. Client
//! lookup and the exact-match redirect check fail with direct responses;
//! every later failure (response type, scopes, PKCE shape) is carried back
//! to the now-trusted redirect URI as an RFC 6749 error redirect.

use serde::Deserialize;
use url::Url;

use crate::{Error, Result};

use super::OidcEngine;
use super::audit::{self, AuditEvent};
use super::interaction::Interaction;

/// Raw query parameters of an authorization request.
///
/// Everything is optional at the wire level; validation decides what is
/// required and how each absence is reported.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AuthorizationParams {
    /// Requesting client.
    pub client_id: Option<String>,
    /// Redirect URI, matched byte-for-byte against the registration.
    pub redirect_uri: Option<String>,
    /// Must be `code`.
    pub response_type: Option<String>,
    /// Space-delimited scopes; must include `openid`.
    pub scope: Option<String>,
    /// Opaque client state, echoed on the callback.
    pub state: Option<String>,
    /// Nonce for the ID token.
    pub nonce: Option<String>,
    /// PKCE challenge (base64url of SHA-256 of the verifier).
    pub code_challenge: Option<String>,
    /// PKCE method; only `S256` is accepted.
    pub code_challenge_method: Option<String>,
}

/// Where a validated (or rejected-after-validation) request goes next.
#[derive(Debug)]
pub enum AuthorizeOutcome {
    /// The request is parked; send the user agent to the interaction endpoint.
    Interaction(Interaction),
    /// The request failed after the redirect URI validated; send the error
    /// to the client's callback.
    ErrorRedirect(Url),
}

impl OidcEngine {
    /// Validate an authorization request and park it as an interaction.
    ///
    /// # Errors
    ///
    /// Failures before the redirect URI is trusted — unknown client,
    /// missing or unregistered `redirect_uri` — surface as direct errors.
    /// Failures after it are returned as [`AuthorizeOutcome::ErrorRedirect`].
    pub async fn begin_authorization(
        &self,
        params: AuthorizationParams,
    ) -> Result<AuthorizeOutcome> {
        // Phase one: establish a client and a redirect URI we may trust.
        let (client_id, redirect_uri) = match self.validate_client(&params) {
            Ok((client_id, redirect_uri)) => (client_id.to_string(), redirect_uri.to_string()),
            Err(err) => {
                audit::emit(&AuditEvent::authorize_rejected(
                    params.client_id.as_deref(),
                    &err,
                ));
                return Err(err);
            }
        };

        // Phase two: everything else may redirect its failure.
        let (scopes, pkce_challenge) = match self.validate_request(&params, &client_id) {
            Ok(validated) => validated,
            Err(err) if err.redirectable() => {
                audit::emit(&AuditEvent::authorize_rejected(Some(&client_id), &err));
                let url = error_redirect(&redirect_uri, &err, params.state.as_deref())?;
                return Ok(AuthorizeOutcome::ErrorRedirect(url));
            }
            Err(err) => {
                audit::emit(&AuditEvent::authorize_rejected(Some(&client_id), &err));
                return Err(err);
            }
        };

        let interaction = self.create_interaction(
            client_id,
            redirect_uri,
            scopes,
            params.state,
            params.nonce,
            pkce_challenge,
        );
        Ok(AuthorizeOutcome::Interaction(interaction))
    }

    /// Resolve the client and check the redirect URI byte-for-byte.
    fn validate_client<'p>(&self, params: &'p AuthorizationParams) -> Result<(&'p str, &'p str)> {
        let client_id = params
            .client_id
            .as_deref()
            .filter(|s| !s.is_empty())
            .ok_or_else(|| Error::InvalidRequest("client_id is required".to_string()))?;
        let client = self.clients.resolve(client_id)?;

        let redirect_uri = params
            .redirect_uri
            .as_deref()
            .filter(|s| !s.is_empty())
            .ok_or_else(|| Error::InvalidRequest("redirect_uri is required".to_string()))?;
        if !client.has_redirect_uri(redirect_uri) {
            return Err(Error::UnregisteredRedirectUri {
                client_id: client_id.to_string(),
                redirect_uri: redirect_uri.to_string(),
            });
        }
        Ok((client_id, redirect_uri))
    }

    /// Validate response type, scopes, and PKCE shape.
    fn validate_request(
        &self,
        params: &AuthorizationParams,
        client_id: &str,
    ) -> Result<(Vec<String>, Option<String>)> {
        match params.response_type.as_deref() {
            Some("code") => {}
            Some(other) => return Err(Error::UnsupportedResponseType(other.to_string())),
            None => {
                return Err(Error::InvalidRequest("response_type is required".to_string()));
            }
        }

        let scope = params
            .scope
            .as_deref()
            .filter(|s| !s.trim().is_empty())
            .ok_or_else(|| Error::InvalidRequest("scope is required".to_string()))?;
        let scopes: Vec<&str> = scope.split_whitespace().collect();
        if !scopes.contains(&"openid") {
            return Err(Error::InvalidScope(
                "the openid scope is required".to_string(),
            ));
        }
        let client = self.clients.resolve(client_id)?;
        if !client.allows_scopes(&scopes) {
            return Err(Error::InvalidScope(format!(
                "client is not registered for the requested scopes: {scope}"
            )));
        }

        let pkce_challenge = validate_pkce_params(
            params.code_challenge.as_deref(),
            params.code_challenge_method.as_deref(),
        )?;

        Ok((
            scopes.into_iter().map(str::to_string).collect(),
            pkce_challenge,
        ))
    }
}

/// Check the PKCE parameters and return the challenge to store.
///
/// Only `S256` is accepted; `plain` defeats the point of the exchange and an
/// omitted method defaults to `plain` per RFC 7636, so both are rejected.
fn validate_pkce_params(
    challenge: Option<&str>,
    method: Option<&str>,
) -> Result<Option<String>> {
    match (challenge, method) {
        (None, None) => Ok(None),
        (None, Some(_)) => Err(Error::InvalidRequest(
            "code_challenge_method without code_challenge".to_string(),
        )),
        (Some(_), None | Some("plain")) => Err(Error::InvalidRequest(
            "only the S256 code_challenge_method is supported".to_string(),
        )),
        (Some(challenge), Some("S256")) => {
            // RFC 7636 §4.2: 43-128 characters of the unreserved set.
            let well_formed = (43..=128).contains(&challenge.len())
                && challenge
                    .bytes()
                    .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'-' | b'.' | b'_' | b'~'));
            if well_formed {
                Ok(Some(challenge.to_string()))
            } else {
                Err(Error::InvalidRequest(
                    "malformed code_challenge".to_string(),
                ))
            }
        }
        (Some(_), Some(other)) => Err(Error::InvalidRequest(format!(
            "unsupported code_challenge_method: {other}"
        ))),
    }
}

/// Build an RFC 6749 error redirect on an already-validated redirect URI.
fn error_redirect(redirect_uri: &str, err: &Error, state: Option<&str>) -> Result<Url> {
    let mut url = parse_redirect(redirect_uri)?;
    {
        let mut pairs = url.query_pairs_mut();
        pairs.append_pair("error", err.oauth_code());
        pairs.append_pair("error_description", &err.public_description());
        if let Some(state) = state {
            pairs.append_pair("state", state);
        }
    }
    Ok(url)
}

/// Build the success callback: `redirect_uri` plus `code` and `state`.
pub(crate) fn callback_url(redirect_uri: &str, code: &str, state: Option<&str>) -> Result<Url> {
    let mut url = parse_redirect(redirect_uri)?;
    {
        let mut pairs = url.query_pairs_mut();
        pairs.append_pair("code", code);
        if let Some(state) = state {
            pairs.append_pair("state", state);
        }
    }
    Ok(url)
}

/// Registered URIs are parse-checked at startup, so a failure here means the
/// record was corrupted in flight.
fn parse_redirect(redirect_uri: &str) -> Result<Url> {
    Url::parse(redirect_uri)
        .map_err(|e| Error::Internal(format!("stored redirect URI failed to parse: {e}")))
}
