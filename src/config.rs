//! Configuration management

use std::{collections::HashMap, env, path::Path, path::PathBuf, time::Duration};

use figment::{
    Figment,
    providers::{Env, Format, Yaml},
};
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Main configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Environment files to load before processing config.
    /// Paths support ~ expansion. Loaded in order, later files override earlier.
    /// Variables are set into the process environment for `env:VAR` secret
    /// references.
    pub env_files: Vec<String>,
    /// Server configuration
    pub server: ServerConfig,
    /// Issuer identifier advertised in discovery and stamped into tokens.
    /// Empty means `http://localhost:{server.port}`.
    pub issuer: String,
    /// Signing key configuration
    pub keys: KeysConfig,
    /// Synthetic identity configuration
    pub identity: IdentityConfig,
    /// Registered relying-party clients
    pub clients: Vec<ClientConfig>,
    /// Scope → claims map. Claims outside this map are never released.
    pub claims: HashMap<String, Vec<String>>,
    /// Lifetimes for issued artifacts
    pub ttl: TtlConfig,
    /// How often the background sweep evicts expired records
    #[serde(with = "humantime_serde")]
    pub sweep_interval: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            env_files: Vec::new(),
            server: ServerConfig::default(),
            issuer: String::new(),
            keys: KeysConfig::default(),
            identity: IdentityConfig::default(),
            clients: default_clients(),
            claims: default_claims(),
            ttl: TtlConfig::default(),
            sweep_interval: Duration::from_secs(60),
        }
    }
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Host to bind to
    pub host: String,
    /// Port to listen on
    pub port: u16,
    /// Request timeout
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,
    /// Maximum request body size (bytes). Token requests are small forms.
    pub max_body_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 4000,
            request_timeout: Duration::from_secs(30),
            max_body_size: 64 * 1024,
        }
    }
}

/// Signing key configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct KeysConfig {
    /// Path to the PKCS#8 PEM-encoded RSA private key. Required to serve.
    pub pem_path: Option<PathBuf>,
}

/// Synthetic identity configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IdentityConfig {
    /// Domain for the generated account's email (`{account_id}@{domain}`)
    pub email_domain: String,
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            email_domain: "local".to_string(),
        }
    }
}

/// A registered relying-party client
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Client identifier
    pub client_id: String,
    /// Client secret (literal value or `env:VAR_NAME`)
    pub client_secret: String,
    /// Redirect URIs, matched byte-for-byte
    pub redirect_uris: Vec<String>,
    /// Scopes this client may request
    #[serde(default = "default_client_scopes")]
    pub scopes: Vec<String>,
    /// Grant types this client may use at the token endpoint
    #[serde(default = "default_client_grant_types")]
    pub grant_types: Vec<String>,
}

impl ClientConfig {
    /// Resolve the client secret (expand `env:VAR_NAME` references).
    #[must_use]
    pub fn resolve_secret(&self) -> String {
        if let Some(var_name) = self.client_secret.strip_prefix("env:") {
            env::var(var_name).unwrap_or_else(|_| self.client_secret.clone())
        } else {
            self.client_secret.clone()
        }
    }
}

fn default_client_scopes() -> Vec<String> {
    vec!["openid".to_string()]
}

fn default_client_grant_types() -> Vec<String> {
    vec![
        "authorization_code".to_string(),
        "refresh_token".to_string(),
    ]
}

fn default_clients() -> Vec<ClientConfig> {
    vec![ClientConfig {
        client_id: "client_id".to_string(),
        client_secret: "client_secret".to_string(),
        redirect_uris: vec!["http://localhost:3000/api/auth/oidc/gitlab/redirect".to_string()],
        scopes: default_client_scopes(),
        grant_types: default_client_grant_types(),
    }]
}

fn default_claims() -> HashMap<String, Vec<String>> {
    let mut map = HashMap::new();
    map.insert(
        "openid".to_string(),
        vec!["sub".to_string(), "email".to_string(), "name".to_string()],
    );
    map
}

/// Lifetimes for issued artifacts
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TtlConfig {
    /// Authorization code lifetime (one round-trip; keep short)
    #[serde(with = "humantime_serde")]
    pub authorization_code: Duration,
    /// Access token lifetime
    #[serde(with = "humantime_serde")]
    pub access_token: Duration,
    /// ID token lifetime
    #[serde(with = "humantime_serde")]
    pub id_token: Duration,
    /// Refresh token lifetime
    #[serde(with = "humantime_serde")]
    pub refresh_token: Duration,
    /// How long an unresolved interaction may sit before it is swept
    #[serde(with = "humantime_serde")]
    pub interaction: Duration,
    /// Consent grant lifetime
    #[serde(with = "humantime_serde")]
    pub grant: Duration,
}

impl Default for TtlConfig {
    fn default() -> Self {
        Self {
            authorization_code: Duration::from_secs(60),
            access_token: Duration::from_secs(3600),
            id_token: Duration::from_secs(3600),
            refresh_token: Duration::from_secs(14 * 24 * 3600),
            interaction: Duration::from_secs(3600),
            grant: Duration::from_secs(14 * 24 * 3600),
        }
    }
}

impl Config {
    /// Load configuration from file and environment
    ///
    /// # Errors
    ///
    /// Returns an error if the config file does not exist, cannot be parsed,
    /// or fails validation.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::new();

        // Load from file if provided
        if let Some(p) = path {
            if !p.exists() {
                return Err(Error::Config(format!(
                    "Config file not found: {}",
                    p.display()
                )));
            }
            figment = figment.merge(Yaml::file(p));
        }

        // Merge environment variables (OIDC_SANDBOX_ prefix)
        figment = figment.merge(Env::prefixed("OIDC_SANDBOX_").split("__"));

        let config: Self = figment
            .extract()
            .map_err(|e| Error::Config(e.to_string()))?;

        // Load env files into the process environment (before `env:` secret
        // references are resolved by the client registry)
        config.load_env_files();

        config.validate()?;

        Ok(config)
    }

    /// Load environment files into the process environment.
    /// Supports ~ expansion. Files that don't exist are silently skipped.
    fn load_env_files(&self) {
        for path_str in &self.env_files {
            let expanded = if path_str.starts_with('~') {
                if let Some(home) = dirs::home_dir() {
                    path_str.replacen('~', &home.display().to_string(), 1)
                } else {
                    path_str.clone()
                }
            } else {
                path_str.clone()
            };

            let path = Path::new(&expanded);
            if path.exists() {
                match dotenvy::from_path(path) {
                    Ok(()) => {
                        tracing::info!("Loaded env file: {expanded}");
                    }
                    Err(e) => {
                        tracing::warn!("Failed to load env file {expanded}: {e}");
                    }
                }
            } else {
                tracing::debug!("Env file not found (skipped): {expanded}");
            }
        }
    }

    /// Startup validation. Failures here are fatal: the process must not
    /// serve with a broken client registry or zero lifetimes.
    fn validate(&self) -> Result<()> {
        if self.clients.is_empty() {
            return Err(Error::Config(
                "at least one client must be registered".to_string(),
            ));
        }

        let mut seen = std::collections::HashSet::new();
        for client in &self.clients {
            if client.client_id.is_empty() {
                return Err(Error::Config("client_id must not be empty".to_string()));
            }
            if !seen.insert(client.client_id.as_str()) {
                return Err(Error::Config(format!(
                    "duplicate client_id: {}",
                    client.client_id
                )));
            }
            if client.redirect_uris.is_empty() {
                return Err(Error::Config(format!(
                    "client '{}' has no redirect URIs",
                    client.client_id
                )));
            }
        }

        if self.ttl.authorization_code.is_zero() {
            return Err(Error::Config(
                "ttl.authorization_code must be non-zero".to_string(),
            ));
        }
        if self.sweep_interval.is_zero() {
            return Err(Error::Config("sweep_interval must be non-zero".to_string()));
        }

        Ok(())
    }

    /// Issuer identifier with any trailing slash stripped.
    ///
    /// Falls back to `http://localhost:{port}` when unset, matching the
    /// development default.
    #[must_use]
    pub fn issuer_url(&self) -> String {
        if self.issuer.is_empty() {
            format!("http://localhost:{}", self.server.port)
        } else {
            self.issuer.trim_end_matches('/').to_string()
        }
    }

    /// Union of all claims named in the scope → claims map.
    #[must_use]
    pub fn claims_supported(&self) -> Vec<String> {
        let mut claims: Vec<String> = self.claims.values().flatten().cloned().collect();
        claims.sort();
        claims.dedup();
        claims
    }

    /// Union of all scopes known to the provider (configured claim scopes
    /// plus every scope any client is registered for).
    #[must_use]
    pub fn scopes_supported(&self) -> Vec<String> {
        let mut scopes: Vec<String> = self.claims.keys().cloned().collect();
        for client in &self.clients {
            scopes.extend(client.scopes.iter().cloned());
        }
        scopes.sort();
        scopes.dedup();
        scopes
    }
}

/// Custom humantime serde module for Duration
pub mod humantime_serde {
    use std::time::Duration;

    use serde::{self, Deserialize, Deserializer, Serializer};

    /// Serialize Duration to human-readable string (e.g., "30s")
    ///
    /// # Errors
    ///
    /// Returns a serialization error if the serializer fails.
    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&format!("{}s", duration.as_secs()))
    }

    /// Deserialize human-readable duration string (e.g., "30s", "5m", "1h", "14d")
    ///
    /// # Errors
    ///
    /// Returns a deserialization error if the string cannot be parsed as a duration.
    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;

        if let Some(ms) = s.strip_suffix("ms") {
            ms.parse::<u64>()
                .map(Duration::from_millis)
                .map_err(serde::de::Error::custom)
        } else if let Some(secs) = s.strip_suffix('s') {
            secs.parse::<u64>()
                .map(Duration::from_secs)
                .map_err(serde::de::Error::custom)
        } else if let Some(mins) = s.strip_suffix('m') {
            mins.parse::<u64>()
                .map(|m| Duration::from_secs(m * 60))
                .map_err(serde::de::Error::custom)
        } else if let Some(hours) = s.strip_suffix('h') {
            hours
                .parse::<u64>()
                .map(|h| Duration::from_secs(h * 3600))
                .map_err(serde::de::Error::custom)
        } else if let Some(days) = s.strip_suffix('d') {
            days.parse::<u64>()
                .map(|d| Duration::from_secs(d * 24 * 3600))
                .map_err(serde::de::Error::custom)
        } else {
            // Assume seconds
            s.parse::<u64>()
                .map(Duration::from_secs)
                .map_err(serde::de::Error::custom)
        }
    }
}
