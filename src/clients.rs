//! Static client registry — lookup, authentication, redirect validation.
//!
//! Clients come from configuration at startup and never change while the
//! process runs. Authentication compares secrets in constant time; redirect
//! URIs match by exact string comparison with no normalization, so
//! `http://localhost:3000/cb` and `http://localhost:3000/cb/` are different
//! registrations.

use std::collections::HashMap;

use crate::config::ClientConfig;
use crate::{Error, Result};

/// A relying party as registered in configuration, with its secret resolved.
#[derive(Debug, Clone)]
pub struct RegisteredClient {
    /// Public client identifier.
    pub client_id: String,
    /// Resolved shared secret (after `env:` indirection).
    secret: String,
    /// Redirect URIs accepted verbatim at the authorization endpoint.
    pub redirect_uris: Vec<String>,
    /// Scopes the client may request.
    pub scopes: Vec<String>,
    /// Grant types the client may use at the token endpoint.
    pub grant_types: Vec<String>,
}

impl RegisteredClient {
    /// Whether every scope in the request is registered for this client.
    #[must_use]
    pub fn allows_scopes(&self, requested: &[&str]) -> bool {
        requested
            .iter()
            .all(|s| self.scopes.iter().any(|r| r == s))
    }

    /// Whether the client may use a grant type at the token endpoint.
    #[must_use]
    pub fn allows_grant_type(&self, grant_type: &str) -> bool {
        self.grant_types.iter().any(|g| g == grant_type)
    }

    /// Whether a redirect URI is registered, compared character for character.
    #[must_use]
    pub fn has_redirect_uri(&self, redirect_uri: &str) -> bool {
        self.redirect_uris.iter().any(|r| r == redirect_uri)
    }
}

/// All registered clients, keyed by `client_id`.
pub struct ClientRegistry {
    clients: HashMap<String, RegisteredClient>,
}

impl ClientRegistry {
    /// Build the registry from configuration, resolving `env:` secrets.
    ///
    /// Structural checks (duplicates, empty ids) already ran during config
    /// validation.
    #[must_use]
    pub fn from_config(configs: &[ClientConfig]) -> Self {
        let mut clients = HashMap::with_capacity(configs.len());
        for cfg in configs {
            clients.insert(
                cfg.client_id.clone(),
                RegisteredClient {
                    client_id: cfg.client_id.clone(),
                    secret: cfg.resolve_secret(),
                    redirect_uris: cfg.redirect_uris.clone(),
                    scopes: cfg.scopes.clone(),
                    grant_types: cfg.grant_types.clone(),
                },
            );
        }
        Self { clients }
    }

    /// Look up a client without authenticating it.
    pub fn resolve(&self, client_id: &str) -> Result<&RegisteredClient> {
        self.clients
            .get(client_id)
            .ok_or_else(|| Error::UnknownClient(client_id.to_string()))
    }

    /// Authenticate a client by id and secret.
    ///
    /// Runs the secret comparison in constant time, and compares against a
    /// dummy value for unknown ids so the timing does not reveal whether the
    /// id exists.
    pub fn authenticate(&self, client_id: &str, secret: &str) -> Result<&RegisteredClient> {
        use subtle::ConstantTimeEq;

        let Some(client) = self.clients.get(client_id) else {
            // Burn the same comparison cost before rejecting, and use the
            // same message either way so responses do not reveal whether the
            // id exists.
            let _: bool = secret.as_bytes().ct_eq(b"unknown-client-padding").into();
            return Err(Error::InvalidClientAuth(
                "client id or secret is incorrect".to_string(),
            ));
        };
        let matches: bool = secret.as_bytes().ct_eq(client.secret.as_bytes()).into();
        if matches {
            Ok(client)
        } else {
            Err(Error::InvalidClientAuth(
                "client id or secret is incorrect".to_string(),
            ))
        }
    }

    /// Number of registered clients.
    #[must_use]
    pub fn len(&self) -> usize {
        self.clients.len()
    }

    /// Whether the registry is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }
}
