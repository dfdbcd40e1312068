//! The synthetic account and its resolver.
//!
//! Exactly one account exists per process. It is generated at startup from a
//! random identifier and never changes, so every login flow authenticates the
//! same subject.

use async_trait::async_trait;
use serde_json::Value;
use uuid::Uuid;

/// The account record backing every issued token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Account {
    /// Opaque subject identifier (`sub` in issued tokens).
    pub account_id: String,
    /// Derived email address, `{account_id}@{email_domain}`.
    pub email: String,
    /// Derived display name.
    pub name: String,
}

impl Account {
    /// Generate the process account with a random identifier.
    ///
    /// Email and name derive from the full identifier, so any of the three
    /// claims is enough to tell two runs apart.
    #[must_use]
    pub fn generate(email_domain: &str) -> Self {
        let account_id = Uuid::new_v4().to_string();
        Self {
            email: format!("{account_id}@{email_domain}"),
            name: account_id.to_uppercase(),
            account_id,
        }
    }

    /// Produce the value for a single claim name.
    ///
    /// Returns `None` for claims this account cannot back; the caller omits
    /// those rather than fabricating values.
    #[must_use]
    pub fn claim_value(&self, name: &str) -> Option<Value> {
        match name {
            "sub" => Some(Value::String(self.account_id.clone())),
            "email" => Some(Value::String(self.email.clone())),
            "name" => Some(Value::String(self.name.clone())),
            _ => None,
        }
    }
}

/// Account lookup seam between the engine and whatever owns identities.
///
/// The engine never assumes the single-account setup; it resolves whatever
/// identifier an interaction decision carries through this trait.
#[async_trait]
pub trait AccountResolver: Send + Sync {
    /// Resolve an account by its identifier; `None` when unknown.
    async fn resolve_account(&self, account_id: &str) -> Option<Account>;
}

/// The built-in single-identity resolver.
pub struct SyntheticIdentity {
    account: Account,
}

impl SyntheticIdentity {
    /// Create the resolver with its process-lifetime account.
    #[must_use]
    pub fn new(email_domain: &str) -> Self {
        Self {
            account: Account::generate(email_domain),
        }
    }

    /// The one account this process authenticates.
    #[must_use]
    pub fn account(&self) -> &Account {
        &self.account
    }
}

#[async_trait]
impl AccountResolver for SyntheticIdentity {
    async fn resolve_account(&self, account_id: &str) -> Option<Account> {
        (self.account.account_id == account_id).then(|| self.account.clone())
    }
}
