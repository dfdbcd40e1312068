//! OIDC Sandbox Library
//!
//! A single-identity OpenID Connect provider for local development.
//!
//! # Features
//!
//! - **Synthetic Identity**: one generated account, every login succeeds as it
//! - **Authorization Code Flow**: interaction/consent step, one-time codes, PKCE (S256)
//! - **Token Issuance**: RS256-signed ID and access tokens, refresh rotation with replay detection
//! - **Discovery**: `/.well-known/openid-configuration` and JWKS publication
//! - **In-Memory Grants**: concurrent grant store with background expiry sweeping
//!
//! # Caveat
//!
//! This is a development tool. It skips real authentication on purpose and
//! must never face the public internet.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod cli;
pub mod clients;
pub mod config;
pub mod engine;
pub mod error;
pub mod http;
pub mod identity;
pub mod keys;
pub mod store;

pub use error::{Error, Result};

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Setup tracing/logging
pub fn setup_tracing(level: &str, format: Option<&str>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let subscriber = tracing_subscriber::registry().with(filter);

    match format {
        Some("json") => {
            subscriber.with(fmt::layer().json()).init();
        }
        _ => {
            subscriber.with(fmt::layer()).init();
        }
    }

    Ok(())
}
