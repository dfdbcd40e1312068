//! Audit logging for authorization and token lifecycle events.
//!
//! Every event is emitted via `tracing::info!` with structured fields, making
//! the audit trail queryable by any log aggregator (Loki, CloudWatch, Datadog).
//!
//! # Events
//!
//! | Event | When |
//! |-------|------|
//! | `authorize.rejected` | An authorization request failed validation |
//! | `interaction.created` | A validated request is awaiting resolution |
//! | `interaction.resolved` | A broker decision was applied and consumed |
//! | `grant.updated` | Consent was recorded or re-recorded |
//! | `code.issued` | An authorization code was minted |
//! | `code.redeemed` | A code was exchanged for tokens |
//! | `code.replayed` | A code was presented a second time; artifacts revoked |
//! | `token.issued` | Access/ID tokens were minted |
//! | `token.refreshed` | A refresh token was rotated |
//! | `token.replayed` | A rotated refresh token was presented again; family revoked |
//! | `token.denied` | The token endpoint rejected a request |

use serde::Serialize;

use crate::store::{AccessRecord, AuthorizationCode, Grant};

use super::interaction::Interaction;

/// Structured audit event emitted for every flow transition.
#[derive(Debug, Serialize)]
pub struct AuditEvent {
    /// Event type string (e.g., `"code.issued"`).
    pub event: &'static str,
    /// Client involved in the event.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    /// Subject involved in the event.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub account_id: Option<String>,
    /// Interaction the event belongs to.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub interaction_id: Option<String>,
    /// Grant the event belongs to.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub grant_id: Option<String>,
    /// JTI of the affected access token.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub jti: Option<String>,
    /// Refresh family of the affected tokens.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub family_id: Option<String>,
    /// Scopes involved in the event.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scopes: Option<Vec<String>>,
    /// Human-readable reason for rejection events.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl AuditEvent {
    fn base(event: &'static str) -> Self {
        Self {
            event,
            client_id: None,
            account_id: None,
            interaction_id: None,
            grant_id: None,
            jti: None,
            family_id: None,
            scopes: None,
            reason: None,
        }
    }

    /// Construct an `authorize.rejected` event.
    #[must_use]
    pub fn authorize_rejected(client_id: Option<&str>, reason: &crate::Error) -> Self {
        Self {
            client_id: client_id.map(str::to_string),
            reason: Some(reason.to_string()),
            ..Self::base("authorize.rejected")
        }
    }

    /// Construct an `interaction.created` event.
    #[must_use]
    pub fn interaction_created(interaction: &Interaction) -> Self {
        Self {
            client_id: Some(interaction.client_id.clone()),
            interaction_id: Some(interaction.interaction_id.clone()),
            scopes: Some(interaction.scopes.clone()),
            ..Self::base("interaction.created")
        }
    }

    /// Construct an `interaction.resolved` event.
    #[must_use]
    pub fn interaction_resolved(interaction_id: &str, account_id: &str, client_id: &str) -> Self {
        Self {
            client_id: Some(client_id.to_string()),
            account_id: Some(account_id.to_string()),
            interaction_id: Some(interaction_id.to_string()),
            ..Self::base("interaction.resolved")
        }
    }

    /// Construct a `grant.updated` event.
    #[must_use]
    pub fn grant_updated(grant: &Grant) -> Self {
        Self {
            client_id: Some(grant.client_id.clone()),
            account_id: Some(grant.account_id.clone()),
            grant_id: Some(grant.grant_id.clone()),
            scopes: Some(grant.scopes.clone()),
            ..Self::base("grant.updated")
        }
    }

    /// Construct a `code.issued` event. The code value itself never appears.
    #[must_use]
    pub fn code_issued(code: &AuthorizationCode) -> Self {
        Self {
            client_id: Some(code.client_id.clone()),
            account_id: Some(code.account_id.clone()),
            grant_id: Some(code.grant_id.clone()),
            scopes: Some(code.scopes.clone()),
            ..Self::base("code.issued")
        }
    }

    /// Construct a `code.redeemed` event.
    #[must_use]
    pub fn code_redeemed(code: &AuthorizationCode) -> Self {
        Self {
            client_id: Some(code.client_id.clone()),
            account_id: Some(code.account_id.clone()),
            grant_id: Some(code.grant_id.clone()),
            ..Self::base("code.redeemed")
        }
    }

    /// Construct a `code.replayed` event.
    #[must_use]
    pub fn code_replayed(client_id: &str) -> Self {
        Self {
            client_id: Some(client_id.to_string()),
            reason: Some("authorization code presented twice".to_string()),
            ..Self::base("code.replayed")
        }
    }

    /// Construct a `token.issued` event.
    #[must_use]
    pub fn token_issued(record: &AccessRecord) -> Self {
        Self {
            client_id: Some(record.client_id.clone()),
            account_id: Some(record.account_id.clone()),
            grant_id: Some(record.grant_id.clone()),
            jti: Some(record.jti.clone()),
            family_id: record.refresh_family.clone(),
            scopes: Some(record.scopes.clone()),
            ..Self::base("token.issued")
        }
    }

    /// Construct a `token.refreshed` event.
    #[must_use]
    pub fn token_refreshed(client_id: &str, family_id: &str) -> Self {
        Self {
            client_id: Some(client_id.to_string()),
            family_id: Some(family_id.to_string()),
            ..Self::base("token.refreshed")
        }
    }

    /// Construct a `token.replayed` event.
    #[must_use]
    pub fn token_replayed(client_id: &str) -> Self {
        Self {
            client_id: Some(client_id.to_string()),
            reason: Some("rotated refresh token presented again".to_string()),
            ..Self::base("token.replayed")
        }
    }

    /// Construct a `token.denied` event.
    #[must_use]
    pub fn token_denied(client_id: &str, reason: &crate::Error) -> Self {
        Self {
            client_id: Some(client_id.to_string()),
            reason: Some(reason.to_string()),
            ..Self::base("token.denied")
        }
    }
}

/// Emit an audit event via `tracing::info!` with structured fields.
///
/// The event is serialized as a JSON blob in the `audit` field, making it
/// easy to extract in log aggregators:
///
/// ```text
/// INFO oidc_sandbox::engine::audit audit={"event":"code.issued",...}
/// ```
pub fn emit(event: &AuditEvent) {
    match serde_json::to_string(event) {
        Ok(ref json) => tracing::info!(audit = %json, "oidc audit"),
        Err(ref e) => tracing::warn!(error = %e, "Failed to serialize audit event"),
    }
}
