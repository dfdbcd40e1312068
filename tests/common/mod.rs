//! Shared harness for the HTTP integration tests.
//!
//! Everything is wired through the public API, the same way the binary
//! does it, so these tests exercise the real router and engine.

// Each test binary compiles this module separately and uses a different
// subset of it.
#![allow(dead_code)]

use std::sync::Arc;

use axum::Router;
use oidc_sandbox::config::Config;
use oidc_sandbox::engine::{AutoApprove, OidcEngine};
use oidc_sandbox::http::{AppState, create_router};
use oidc_sandbox::identity::SyntheticIdentity;
use oidc_sandbox::keys::KeyManager;
use oidc_sandbox::store::InMemoryGrantStore;

/// RSA private key shared across the integration tests. Generating a fresh
/// 2048-bit key per test is far too slow under the dev profile.
pub const TEST_KEY_PEM: &str = include_str!("../fixtures/test_key.pem");

/// RFC 7636 Appendix B verifier and its S256 challenge.
pub const PKCE_VERIFIER: &str = "dBjftJeZ4CVP-mB92K27uhbUJU1p1r_wW1gFWFOEjXk";
pub const PKCE_CHALLENGE: &str = "E9Melhoa2OwvFrEMTJguCHaoeK1t8URWbuGJSstw-cM";

/// The default client's registered redirect URI.
pub const REDIRECT_URI: &str = "http://localhost:3000/api/auth/oidc/gitlab/redirect";

/// Build the full router plus handles to the engine and identity behind it.
pub fn router() -> (Router, Arc<OidcEngine>, Arc<SyntheticIdentity>) {
    let config = Config::default();

    let identity = Arc::new(SyntheticIdentity::new(&config.identity.email_domain));
    let keys = KeyManager::from_pem(TEST_KEY_PEM).expect("test key must parse");
    let broker = Arc::new(AutoApprove::new(identity.account().account_id.clone()));
    let engine = Arc::new(
        OidcEngine::initialize(
            &config,
            keys,
            identity.clone(),
            Arc::new(InMemoryGrantStore::new()),
            broker,
        )
        .expect("default config must wire cleanly"),
    );

    let state = Arc::new(AppState {
        engine: Arc::clone(&engine),
    });
    (create_router(state, &config.server), engine, identity)
}
