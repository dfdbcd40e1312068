//! Grant store — consent grants, authorization codes, and token records.
//!
//! The [`GrantStore`] trait abstracts over storage backends. The only current
//! implementation is [`InMemoryGrantStore`], backed by `DashMap` indices with
//! a background sweeper that evicts expired records.
//!
//! # Design
//!
//! Codes and refresh tokens are indexed by their **opaque value** for O(1)
//! redemption; access tokens by **JTI** for O(1) activity checks and
//! revocation; grants by **grant id** plus an `(account, client)` index so
//! repeat authorizations update one record.
//!
//! Redemption is the only operation with a cross-request ordering guarantee:
//! a code or refresh token is redeemed through its map entry while the shard
//! lock is held, so exactly one concurrent redeemer wins. A used code stays
//! in the map until its expiry so that a replay inside the TTL is detected
//! and the tokens minted from the first redemption can be revoked.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use rand::RngExt;
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use crate::{Error, Result};

/// Opaque-value prefix for authorization codes.
const CODE_PREFIX: &str = "oidcsb_ac_";
/// Opaque-value prefix for refresh tokens.
const REFRESH_PREFIX: &str = "oidcsb_rt_";

/// Current Unix time in seconds.
#[must_use]
pub(crate) fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_secs()
}

/// Generate a cryptographically random opaque value.
///
/// Format: `<prefix><43-char URL-safe base64>` (256 bits of entropy). The
/// prefix makes leaked values greppable and detectable by secret scanners.
fn opaque_value(prefix: &str) -> String {
    let random_bytes: [u8; 32] = rand::rng().random();
    format!(
        "{prefix}{}",
        base64::Engine::encode(
            &base64::engine::general_purpose::URL_SAFE_NO_PAD,
            random_bytes,
        )
    )
}

/// Generate a UUID v4 JTI for an access token.
#[must_use]
pub fn generate_jti() -> String {
    Uuid::new_v4().to_string()
}

// ── Records ─────────────────────────────────────────────────────────────────

/// A recorded consent linking account, client, and approved scopes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Grant {
    /// Unique grant identifier.
    pub grant_id: String,
    /// Subject the consent belongs to.
    pub account_id: String,
    /// Client the consent was given to.
    pub client_id: String,
    /// Approved scopes, merged across authorizations.
    pub scopes: Vec<String>,
    /// Issued-at (Unix epoch seconds).
    pub iat: u64,
    /// Expires-at (Unix epoch seconds); pushed forward on every re-consent.
    pub exp: u64,
}

impl Grant {
    /// Returns `true` if the grant has passed its expiry time.
    #[must_use]
    pub fn is_expired(&self) -> bool {
        unix_now() >= self.exp
    }
}

/// A single-use authorization code with everything the exchange must verify.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthorizationCode {
    /// The opaque code value (`oidcsb_ac_<base64>`).
    pub code: String,
    /// Grant the code was issued under.
    pub grant_id: String,
    /// Subject the code authenticates.
    pub account_id: String,
    /// Client the code is bound to.
    pub client_id: String,
    /// Redirect URI the authorization request used; the exchange must repeat it.
    pub redirect_uri: String,
    /// Scopes approved for this code.
    pub scopes: Vec<String>,
    /// Nonce from the authorization request, echoed into the ID token.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nonce: Option<String>,
    /// PKCE S256 challenge, if the request carried one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pkce_challenge: Option<String>,
    /// Issued-at (Unix epoch seconds).
    pub iat: u64,
    /// Expires-at (Unix epoch seconds).
    pub exp: u64,
    /// Set on first redemption; a second redemption is a replay.
    used: bool,
}

impl AuthorizationCode {
    /// Returns `true` if the code has passed its expiry time.
    #[must_use]
    pub fn is_expired(&self) -> bool {
        unix_now() >= self.exp
    }
}

/// Parameters for minting an authorization code.
#[derive(Debug, Clone)]
pub struct NewCode {
    /// Grant the code is issued under.
    pub grant_id: String,
    /// Subject being authenticated.
    pub account_id: String,
    /// Client the code is bound to.
    pub client_id: String,
    /// Redirect URI from the validated authorization request.
    pub redirect_uri: String,
    /// Approved scopes.
    pub scopes: Vec<String>,
    /// Nonce to echo into the ID token.
    pub nonce: Option<String>,
    /// PKCE S256 challenge to verify at exchange.
    pub pkce_challenge: Option<String>,
    /// Code lifetime.
    pub ttl: Duration,
}

/// A rotating refresh token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefreshToken {
    /// The opaque token value (`oidcsb_rt_<base64>`).
    pub token: String,
    /// Rotation family; every descendant of one issuance shares it.
    pub family_id: String,
    /// Grant the token was issued under.
    pub grant_id: String,
    /// Subject the token refreshes for.
    pub account_id: String,
    /// Client the token is bound to.
    pub client_id: String,
    /// Scopes the family was issued with.
    pub scopes: Vec<String>,
    /// Authorization code the family originated from, for replay revocation.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_code: Option<String>,
    /// Issued-at (Unix epoch seconds).
    pub iat: u64,
    /// Expires-at (Unix epoch seconds).
    pub exp: u64,
    /// Set on rotation; presenting a rotated token again is a replay.
    used: bool,
}

impl RefreshToken {
    /// Returns `true` if the token has passed its expiry time.
    #[must_use]
    pub fn is_expired(&self) -> bool {
        unix_now() >= self.exp
    }
}

/// Parameters for minting the first refresh token of a family.
#[derive(Debug, Clone)]
pub struct NewRefresh {
    /// Grant the token is issued under.
    pub grant_id: String,
    /// Subject the token refreshes for.
    pub account_id: String,
    /// Client the token is bound to.
    pub client_id: String,
    /// Scopes for the family.
    pub scopes: Vec<String>,
    /// Authorization code this family originates from, if any.
    pub source_code: Option<String>,
    /// Token lifetime; rotations get a fresh window of the same length.
    pub ttl: Duration,
}

/// Bookkeeping entry for an issued access token, keyed by JTI.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccessRecord {
    /// JWT `jti` of the access token.
    pub jti: String,
    /// Grant the token was issued under.
    pub grant_id: String,
    /// Subject (`sub`) of the token.
    pub account_id: String,
    /// Audience client.
    pub client_id: String,
    /// Scopes carried by the token.
    pub scopes: Vec<String>,
    /// Authorization code the token was minted from, for replay revocation.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_code: Option<String>,
    /// Refresh family the token is tied to, revoked together.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub refresh_family: Option<String>,
    /// Issued-at (Unix epoch seconds).
    pub iat: u64,
    /// Expires-at (Unix epoch seconds).
    pub exp: u64,
}

impl AccessRecord {
    /// Returns `true` if the record has passed its expiry time.
    #[must_use]
    pub fn is_expired(&self) -> bool {
        unix_now() >= self.exp
    }
}

// ── Trait ───────────────────────────────────────────────────────────────────

/// Trait abstracting grant and token storage.
///
/// Implementations must be `Send + Sync` because the store is shared across
/// concurrent request handlers.
#[async_trait::async_trait]
pub trait GrantStore: Send + Sync + 'static {
    /// Record consent for `(account, client)`.
    ///
    /// With `merge` set, the new scopes are united with any prior grant's;
    /// otherwise they replace them. Every upsert pushes the grant's expiry
    /// to `now + ttl`. Returns the resulting grant.
    async fn upsert_grant(
        &self,
        account_id: &str,
        client_id: &str,
        scopes: &[String],
        merge: bool,
        ttl: Duration,
    ) -> Grant;

    /// Mint a TTL-bounded single-use authorization code.
    async fn create_code(&self, new: NewCode) -> AuthorizationCode;

    /// Redeem an authorization code, atomically marking it used.
    ///
    /// Exactly one concurrent redeemer wins. Fails with
    /// [`Error::CodeNotFound`] for unknown or expired codes and
    /// [`Error::CodeReplayed`] for a second redemption; a replay also revokes
    /// every token minted from the first redemption.
    async fn redeem_code(&self, code: &str) -> Result<AuthorizationCode>;

    /// Mint the first refresh token of a new rotation family.
    async fn issue_refresh(&self, new: NewRefresh) -> RefreshToken;

    /// Rotate a refresh token: invalidate `token`, mint its successor.
    ///
    /// Fails with [`Error::RefreshNotFound`] for unknown or expired tokens
    /// and for tokens bound to a different client, and with
    /// [`Error::RefreshReplayed`] when a rotated-out token is presented
    /// again; a replay revokes the whole family.
    async fn rotate_refresh(&self, token: &str, client_id: &str) -> Result<RefreshToken>;

    /// Record an issued access token for activity checks and revocation.
    async fn record_access(&self, record: AccessRecord);

    /// Revoke an access token by JTI. Returns `true` if it existed.
    async fn revoke_access(&self, jti: &str) -> bool;

    /// Whether an access token is known, unexpired, and unrevoked.
    async fn access_is_active(&self, jti: &str) -> bool;

    /// Remove all expired records. Called periodically by the sweeper.
    async fn sweep_expired(&self) -> usize;
}

// ── In-memory implementation ────────────────────────────────────────────────

/// In-memory grant store backed by `DashMap` indices.
///
/// - `codes`:    code value → [`AuthorizationCode`]
/// - `refresh`:  token value → [`RefreshToken`]
/// - `access`:   JTI → [`AccessRecord`]
/// - `grants`:   grant id → [`Grant`], plus `(account, client)` → grant id
pub struct InMemoryGrantStore {
    codes: DashMap<String, AuthorizationCode>,
    refresh: DashMap<String, RefreshToken>,
    access: DashMap<String, AccessRecord>,
    grants: DashMap<String, Grant>,
    grant_index: DashMap<(String, String), String>,
}

impl InMemoryGrantStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self {
            codes: DashMap::new(),
            refresh: DashMap::new(),
            access: DashMap::new(),
            grants: DashMap::new(),
            grant_index: DashMap::new(),
        }
    }

    /// Revoke every token minted from a replayed code.
    fn revoke_code_artifacts(&self, code: &str) -> usize {
        let mut revoked = 0;

        // Refresh families that originated from this code.
        let families: Vec<String> = self
            .refresh
            .iter()
            .filter(|e| e.value().source_code.as_deref() == Some(code))
            .map(|e| e.value().family_id.clone())
            .collect();
        for family in &families {
            revoked += self.revoke_family(family);
        }

        // Access tokens minted directly at the exchange.
        let jtis: Vec<String> = self
            .access
            .iter()
            .filter(|e| e.value().source_code.as_deref() == Some(code))
            .map(|e| e.key().clone())
            .collect();
        for jti in jtis {
            if self.access.remove(&jti).is_some() {
                debug!(%jti, "Revoked access token from replayed code");
                revoked += 1;
            }
        }
        revoked
    }

    /// Revoke a whole refresh family and the access tokens tied to it.
    fn revoke_family(&self, family_id: &str) -> usize {
        let mut revoked = 0;

        let tokens: Vec<String> = self
            .refresh
            .iter()
            .filter(|e| e.value().family_id == family_id)
            .map(|e| e.key().clone())
            .collect();
        for token in tokens {
            if self.refresh.remove(&token).is_some() {
                revoked += 1;
            }
        }

        let jtis: Vec<String> = self
            .access
            .iter()
            .filter(|e| e.value().refresh_family.as_deref() == Some(family_id))
            .map(|e| e.key().clone())
            .collect();
        for jti in jtis {
            if self.access.remove(&jti).is_some() {
                revoked += 1;
            }
        }

        if revoked > 0 {
            debug!(family = %family_id, count = revoked, "Revoked refresh family");
        }
        revoked
    }
}

impl Default for InMemoryGrantStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl GrantStore for InMemoryGrantStore {
    async fn upsert_grant(
        &self,
        account_id: &str,
        client_id: &str,
        scopes: &[String],
        merge: bool,
        ttl: Duration,
    ) -> Grant {
        let key = (account_id.to_string(), client_id.to_string());
        let grant_id = self
            .grant_index
            .entry(key)
            .or_insert_with(|| Uuid::new_v4().to_string())
            .clone();

        let now = unix_now();
        let mut entry = self.grants.entry(grant_id.clone()).or_insert_with(|| Grant {
            grant_id: grant_id.clone(),
            account_id: account_id.to_string(),
            client_id: client_id.to_string(),
            scopes: Vec::new(),
            iat: now,
            exp: now,
        });
        if merge {
            for scope in scopes {
                if !entry.scopes.contains(scope) {
                    entry.scopes.push(scope.clone());
                }
            }
        } else {
            entry.scopes = scopes.to_vec();
        }
        // Fresh consent keeps the grant alive for another full window.
        entry.exp = now + ttl.as_secs();
        entry.clone()
    }

    async fn create_code(&self, new: NewCode) -> AuthorizationCode {
        let now = unix_now();
        let record = AuthorizationCode {
            code: opaque_value(CODE_PREFIX),
            grant_id: new.grant_id,
            account_id: new.account_id,
            client_id: new.client_id,
            redirect_uri: new.redirect_uri,
            scopes: new.scopes,
            nonce: new.nonce,
            pkce_challenge: new.pkce_challenge,
            iat: now,
            exp: now + new.ttl.as_secs(),
            used: false,
        };
        self.codes.insert(record.code.clone(), record.clone());
        record
    }

    async fn redeem_code(&self, code: &str) -> Result<AuthorizationCode> {
        // The entry guard holds the shard lock, so marking `used` is
        // linearizable: one concurrent redeemer wins, the rest observe the
        // flag. The guard must drop before any further map access.
        let outcome = match self.codes.entry(code.to_string()) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().is_expired() {
                    occupied.remove();
                    return Err(Error::CodeNotFound);
                }
                if occupied.get().used {
                    Err(())
                } else {
                    let record = occupied.get_mut();
                    record.used = true;
                    Ok(record.clone())
                }
            }
            Entry::Vacant(_) => return Err(Error::CodeNotFound),
        };

        match outcome {
            Ok(record) => Ok(record),
            Err(()) => {
                // Replay: take back everything the first redemption produced.
                self.revoke_code_artifacts(code);
                Err(Error::CodeReplayed)
            }
        }
    }

    async fn issue_refresh(&self, new: NewRefresh) -> RefreshToken {
        let now = unix_now();
        let record = RefreshToken {
            token: opaque_value(REFRESH_PREFIX),
            family_id: Uuid::new_v4().to_string(),
            grant_id: new.grant_id,
            account_id: new.account_id,
            client_id: new.client_id,
            scopes: new.scopes,
            source_code: new.source_code,
            iat: now,
            exp: now + new.ttl.as_secs(),
            used: false,
        };
        self.refresh.insert(record.token.clone(), record.clone());
        record
    }

    async fn rotate_refresh(&self, token: &str, client_id: &str) -> Result<RefreshToken> {
        let outcome = match self.refresh.entry(token.to_string()) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().is_expired() {
                    occupied.remove();
                    return Err(Error::RefreshNotFound);
                }
                // A token presented by the wrong client is treated as
                // unknown rather than a replay, so a typo in one client's
                // config cannot revoke another client's session.
                if occupied.get().client_id != client_id {
                    return Err(Error::RefreshNotFound);
                }
                if occupied.get().used {
                    Err(occupied.get().family_id.clone())
                } else {
                    let record = occupied.get_mut();
                    record.used = true;
                    Ok(record.clone())
                }
            }
            Entry::Vacant(_) => return Err(Error::RefreshNotFound),
        };

        match outcome {
            Ok(old) => {
                let now = unix_now();
                // The successor gets a fresh window of the original length.
                let successor = RefreshToken {
                    token: opaque_value(REFRESH_PREFIX),
                    family_id: old.family_id.clone(),
                    grant_id: old.grant_id.clone(),
                    account_id: old.account_id.clone(),
                    client_id: old.client_id.clone(),
                    scopes: old.scopes.clone(),
                    source_code: old.source_code.clone(),
                    iat: now,
                    exp: now + (old.exp - old.iat),
                    used: false,
                };
                self.refresh.insert(successor.token.clone(), successor.clone());
                Ok(successor)
            }
            Err(family_id) => {
                // Replay of a rotated token: the family is considered stolen.
                self.revoke_family(&family_id);
                Err(Error::RefreshReplayed)
            }
        }
    }

    async fn record_access(&self, record: AccessRecord) {
        self.access.insert(record.jti.clone(), record);
    }

    async fn revoke_access(&self, jti: &str) -> bool {
        self.access.remove(jti).is_some()
    }

    async fn access_is_active(&self, jti: &str) -> bool {
        let Some(entry) = self.access.get(jti) else {
            return false;
        };
        let expired = entry.is_expired();
        drop(entry);

        if expired {
            // Lazy eviction: remove on access
            self.access.remove(jti);
            debug!(%jti, "Lazy-evicted expired access record");
            return false;
        }
        true
    }

    async fn sweep_expired(&self) -> usize {
        let mut swept = 0;

        let expired_codes: Vec<String> = self
            .codes
            .iter()
            .filter(|e| e.value().is_expired())
            .map(|e| e.key().clone())
            .collect();
        for code in expired_codes {
            if self.codes.remove(&code).is_some() {
                swept += 1;
            }
        }

        let expired_refresh: Vec<String> = self
            .refresh
            .iter()
            .filter(|e| e.value().is_expired())
            .map(|e| e.key().clone())
            .collect();
        for token in expired_refresh {
            if self.refresh.remove(&token).is_some() {
                swept += 1;
            }
        }

        let expired_access: Vec<String> = self
            .access
            .iter()
            .filter(|e| e.value().is_expired())
            .map(|e| e.key().clone())
            .collect();
        for jti in expired_access {
            if self.access.remove(&jti).is_some() {
                swept += 1;
            }
        }

        let expired_grants: Vec<Grant> = self
            .grants
            .iter()
            .filter(|e| e.value().is_expired())
            .map(|e| e.value().clone())
            .collect();
        for grant in expired_grants {
            if self.grants.remove(&grant.grant_id).is_some() {
                self.grant_index
                    .remove(&(grant.account_id.clone(), grant.client_id.clone()));
                swept += 1;
            }
        }

        swept
    }
}
