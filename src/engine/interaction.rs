//! Interactions — the login/consent sub-protocol between authorize and code.
//!
//! A validated authorization request that still needs a login/consent
//! decision becomes an [`Interaction`]: the engine parks the request under a
//! fresh identifier and hands that identifier to the surrounding HTTP layer.
//! Whoever owns the user experience — here, [`AutoApprove`] with no human in
//! the loop — reads the details, makes an [`InteractionDecision`], and posts
//! it back. The engine does not care how long that takes: interactions
//! expire on their own TTL and abandoned ones are swept.
//!
//! Resolution consumes the interaction. The removal from the table is the
//! atomic step, so two concurrent resolutions of the same identifier produce
//! exactly one authorization code.

use async_trait::async_trait;
use url::Url;
use uuid::Uuid;

use crate::store::{NewCode, unix_now};
use crate::{Error, Result};

use super::OidcEngine;
use super::audit::{self, AuditEvent};
use super::authorize::callback_url;

/// A pending authorization request awaiting a login/consent decision.
#[derive(Debug, Clone)]
pub struct Interaction {
    /// Identifier the HTTP layer round-trips.
    pub interaction_id: String,
    /// Client that initiated the authorization request.
    pub client_id: String,
    /// Validated redirect URI the flow will return to.
    pub redirect_uri: String,
    /// Scopes the client requested.
    pub scopes: Vec<String>,
    /// Opaque client state, echoed on the callback.
    pub state: Option<String>,
    /// Nonce for the eventual ID token.
    pub nonce: Option<String>,
    /// PKCE S256 challenge carried through to the code.
    pub pkce_challenge: Option<String>,
    /// Created-at (Unix epoch seconds).
    pub iat: u64,
    /// Expires-at (Unix epoch seconds).
    pub exp: u64,
}

impl Interaction {
    /// Returns `true` if the interaction has passed its expiry time.
    #[must_use]
    pub fn is_expired(&self) -> bool {
        unix_now() >= self.exp
    }
}

/// The outcome of a login/consent decision.
#[derive(Debug, Clone)]
pub struct InteractionDecision {
    /// Account that logged in.
    pub account_id: String,
    /// Scopes the account consented to.
    pub approved_scopes: Vec<String>,
    /// Merge the approved scopes into any prior grant instead of replacing it.
    pub merge_with_prior_grant: bool,
}

/// Decision seam between the engine and the login/consent owner.
#[async_trait]
pub trait InteractionBroker: Send + Sync {
    /// Decide a pending interaction.
    async fn decide(&self, interaction: &Interaction) -> InteractionDecision;
}

/// Broker that signs in the synthetic account and approves every requested
/// scope, with no human step.
pub struct AutoApprove {
    account_id: String,
}

impl AutoApprove {
    /// Create a broker that always resolves to `account_id`.
    #[must_use]
    pub fn new(account_id: String) -> Self {
        Self { account_id }
    }
}

#[async_trait]
impl InteractionBroker for AutoApprove {
    async fn decide(&self, interaction: &Interaction) -> InteractionDecision {
        InteractionDecision {
            account_id: self.account_id.clone(),
            approved_scopes: interaction.scopes.clone(),
            merge_with_prior_grant: true,
        }
    }
}

impl OidcEngine {
    /// Park a validated authorization request as a pending interaction.
    pub(crate) fn create_interaction(
        &self,
        client_id: String,
        redirect_uri: String,
        scopes: Vec<String>,
        state: Option<String>,
        nonce: Option<String>,
        pkce_challenge: Option<String>,
    ) -> Interaction {
        let now = unix_now();
        let interaction = Interaction {
            interaction_id: Uuid::new_v4().to_string(),
            client_id,
            redirect_uri,
            scopes,
            state,
            nonce,
            pkce_challenge,
            iat: now,
            exp: now + self.ttl.interaction.as_secs(),
        };
        self.interactions
            .insert(interaction.interaction_id.clone(), interaction.clone());
        audit::emit(&AuditEvent::interaction_created(&interaction));
        interaction
    }

    /// Look up a pending interaction for whoever resolves it.
    ///
    /// # Errors
    ///
    /// [`Error::UnknownInteraction`] for identifiers that were never issued,
    /// were already consumed, or expired.
    pub fn interaction_details(&self, interaction_id: &str) -> Result<Interaction> {
        let Some(entry) = self.interactions.get(interaction_id) else {
            return Err(Error::UnknownInteraction(interaction_id.to_string()));
        };
        let interaction = entry.clone();
        drop(entry);

        if interaction.is_expired() {
            // Lazy eviction: remove on access
            self.interactions.remove(interaction_id);
            return Err(Error::UnknownInteraction(interaction_id.to_string()));
        }
        Ok(interaction)
    }

    /// Apply a decision to a pending interaction, consuming it.
    ///
    /// Records the grant, mints the single-use authorization code, and
    /// returns the callback URL (`redirect_uri` plus `code` and the original
    /// `state`).
    ///
    /// # Errors
    ///
    /// [`Error::UnknownInteraction`] when the identifier is unknown, already
    /// consumed, or expired; [`Error::Internal`] when the decision names an
    /// account the resolver cannot produce.
    pub async fn resolve_interaction(
        &self,
        interaction_id: &str,
        decision: InteractionDecision,
    ) -> Result<Url> {
        // Removal is the single-winner step for concurrent resolutions.
        let Some((_, interaction)) = self.interactions.remove(interaction_id) else {
            return Err(Error::UnknownInteraction(interaction_id.to_string()));
        };
        if interaction.is_expired() {
            return Err(Error::UnknownInteraction(interaction_id.to_string()));
        }

        let account = self
            .accounts
            .resolve_account(&decision.account_id)
            .await
            .ok_or_else(|| {
                Error::Internal(format!(
                    "interaction decision named an unresolvable account: {}",
                    decision.account_id
                ))
            })?;

        // Consent can narrow the requested scopes, never widen them.
        let approved: Vec<String> = decision
            .approved_scopes
            .into_iter()
            .filter(|s| interaction.scopes.contains(s))
            .collect();

        let grant = self
            .store
            .upsert_grant(
                &account.account_id,
                &interaction.client_id,
                &approved,
                decision.merge_with_prior_grant,
                self.ttl.grant,
            )
            .await;
        audit::emit(&AuditEvent::grant_updated(&grant));

        let code = self
            .store
            .create_code(NewCode {
                grant_id: grant.grant_id,
                account_id: account.account_id.clone(),
                client_id: interaction.client_id.clone(),
                redirect_uri: interaction.redirect_uri.clone(),
                scopes: approved,
                nonce: interaction.nonce.clone(),
                pkce_challenge: interaction.pkce_challenge.clone(),
                ttl: self.ttl.authorization_code,
            })
            .await;
        audit::emit(&AuditEvent::code_issued(&code));
        audit::emit(&AuditEvent::interaction_resolved(
            interaction_id,
            &account.account_id,
            &interaction.client_id,
        ));

        callback_url(
            &interaction.redirect_uri,
            &code.code,
            interaction.state.as_deref(),
        )
    }

    /// Remove interactions past their TTL. Returns the number removed.
    pub fn sweep_interactions(&self) -> usize {
        let expired: Vec<String> = self
            .interactions
            .iter()
            .filter(|e| e.value().is_expired())
            .map(|e| e.key().clone())
            .collect();
        let count = expired.len();
        for id in expired {
            self.interactions.remove(&id);
        }
        count
    }
}
