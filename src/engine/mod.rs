//! The OIDC protocol engine — the central state machine.
//!
//! Each authorization flow moves through
//! `Requested → AwaitingInteraction → Authorized → Exchanged`, with expired
//! or replayed artifacts dropping out along the way:
//!
//! ```text
//! GET /authorize
//!   -> begin_authorization   validate client, redirect URI, scopes, PKCE
//!   -> Interaction parked    the broker decides login/consent off-protocol
//!   -> resolve_interaction   grant upserted, single-use code minted
//! POST /token
//!   -> exchange              authenticate client, redeem code, verify PKCE,
//!                            sign access/ID tokens, issue rotating refresh
//! ```
//!
//! The engine owns no global state: every dependency (key manager, client
//! registry, account resolver, grant store, interaction broker) is injected
//! at construction, so tests run any number of isolated instances. Pending
//! interactions are the one piece of state the engine holds itself; the
//! grant store owns everything else.

pub mod audit;
pub mod authorize;
pub mod discovery;
pub mod interaction;
pub mod token;

use std::collections::HashMap;

use std::sync::Arc;

use dashmap::DashMap;
use serde_json::{Map, Value};
use url::Url;

pub use authorize::{AuthorizationParams, AuthorizeOutcome};
pub use discovery::DiscoveryDocument;
pub use interaction::{AutoApprove, Interaction, InteractionBroker, InteractionDecision};
pub use token::{ClientCredentials, TokenRequest, TokenResponse};

use crate::clients::ClientRegistry;
use crate::config::{Config, TtlConfig};
use crate::identity::{Account, AccountResolver};
use crate::keys::{JwksDocument, KeyManager};
use crate::store::GrantStore;
use crate::{Error, Result};

/// The OIDC engine with its injected dependencies.
pub struct OidcEngine {
    /// Process-lifetime signing key.
    pub keys: Arc<KeyManager>,
    /// Registered relying-party clients.
    pub clients: ClientRegistry,
    /// Account lookup seam.
    pub accounts: Arc<dyn AccountResolver>,
    /// Grants, codes, and token records.
    pub store: Arc<dyn GrantStore>,
    /// Login/consent decision strategy.
    pub broker: Arc<dyn InteractionBroker>,
    /// Issuer identifier stamped into tokens and discovery metadata.
    pub issuer: String,
    pub(crate) ttl: TtlConfig,
    pub(crate) interactions: DashMap<String, Interaction>,
    /// Scope → claims allow-list. Claims outside it are never released.
    claims: HashMap<String, Vec<String>>,
    pub(crate) scopes_supported: Vec<String>,
    pub(crate) claims_supported: Vec<String>,
}

impl OidcEngine {
    /// Build the engine. Must complete before the server accepts requests.
    ///
    /// # Errors
    ///
    /// [`Error::Config`] when a registered redirect URI does not parse —
    /// callback construction relies on every stored URI being well-formed.
    pub fn initialize(
        config: &Config,
        keys: KeyManager,
        accounts: Arc<dyn AccountResolver>,
        store: Arc<dyn GrantStore>,
        broker: Arc<dyn InteractionBroker>,
    ) -> Result<Self> {
        for client in &config.clients {
            for uri in &client.redirect_uris {
                Url::parse(uri).map_err(|e| {
                    Error::Config(format!(
                        "client '{}' redirect URI '{uri}' does not parse: {e}",
                        client.client_id
                    ))
                })?;
            }
        }

        Ok(Self {
            keys: Arc::new(keys),
            clients: ClientRegistry::from_config(&config.clients),
            accounts,
            store,
            broker,
            issuer: config.issuer_url(),
            ttl: config.ttl.clone(),
            interactions: DashMap::new(),
            claims: config.claims.clone(),
            scopes_supported: config.scopes_supported(),
            claims_supported: config.claims_supported(),
        })
    }

    /// The published JWKS document.
    #[must_use]
    pub fn jwks(&self) -> JwksDocument {
        self.keys.jwks()
    }

    /// Resolve the allow-listed claims for an account under a scope set.
    ///
    /// `sub` is always present; every other claim must be named by the
    /// configured scope → claims map AND backed by the account. Unknown
    /// claims are omitted, never fabricated.
    pub(crate) fn build_claims(&self, account: &Account, scopes: &[String]) -> Map<String, Value> {
        let mut out = Map::new();
        if let Some(sub) = account.claim_value("sub") {
            out.insert("sub".to_string(), sub);
        }
        for scope in scopes {
            let Some(names) = self.claims.get(scope) else {
                continue;
            };
            for name in names {
                if let Some(value) = account.claim_value(name) {
                    out.insert(name.clone(), value);
                }
            }
        }
        out
    }

    /// Remove every expired record: pending interactions plus the grant
    /// store's codes, refresh tokens, access records, and grants.
    pub async fn sweep_expired(&self) -> usize {
        self.sweep_interactions() + self.store.sweep_expired().await
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::testing;

    #[tokio::test]
    async fn initialize_rejects_unparseable_redirect_uris() {
        let mut config = Config::default();
        config.clients[0].redirect_uris = vec!["not a url".to_string()];

        let identity = Arc::new(crate::identity::SyntheticIdentity::new("local"));
        let keys = KeyManager::from_pem(crate::keys::TEST_RSA_PRIVATE_KEY_PEM).unwrap();
        let broker = Arc::new(AutoApprove::new(identity.account().account_id.clone()));
        let result = OidcEngine::initialize(
            &config,
            keys,
            identity,
            Arc::new(crate::store::InMemoryGrantStore::new()),
            broker,
        );

        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[tokio::test]
    async fn build_claims_never_exceeds_the_allow_list() {
        // GIVEN: an engine whose allow-list maps openid to sub/email/name
        let (engine, identity) = testing::engine().await;
        let account = identity.account();

        // WHEN: claims are built for scopes the map does not know
        let claims = engine.build_claims(
            account,
            &["openid".to_string(), "profile".to_string(), "admin".to_string()],
        );

        // THEN: only the allow-listed claims appear, sub always first among them
        let mut names: Vec<&String> = claims.keys().collect();
        names.sort();
        assert_eq!(names, ["email", "name", "sub"]);
        assert_eq!(claims["sub"], account.account_id.as_str());
    }

    #[tokio::test]
    async fn build_claims_without_openid_still_carries_sub() {
        let (engine, identity) = testing::engine().await;
        let claims = engine.build_claims(identity.account(), &["profile".to_string()]);
        assert_eq!(claims.len(), 1);
        assert!(claims.contains_key("sub"));
    }

    #[tokio::test]
    async fn sweep_covers_interactions_and_store() {
        // GIVEN: an engine whose interactions and codes expire immediately
        let (engine, _identity) = testing::engine_with(|config| {
            config.ttl.interaction = std::time::Duration::ZERO;
        })
        .await;
        testing::begin(&engine).await;

        // WHEN: the shared sweep runs
        let swept = engine.sweep_expired().await;

        // THEN: the abandoned interaction is gone
        assert!(swept >= 1);
        assert!(engine.interactions.is_empty());
    }
}
