//! The serving process: engine wiring, listener, sweeper, shutdown.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::signal;
use tracing::{debug, info};

use super::router::{AppState, create_router};
use crate::config::Config;
use crate::engine::{AutoApprove, OidcEngine};
use crate::identity::{Account, SyntheticIdentity};
use crate::keys::KeyManager;
use crate::store::InMemoryGrantStore;
use crate::{Error, Result};

/// OIDC sandbox server.
pub struct Server {
    config: Config,
    engine: Arc<OidcEngine>,
    account: Account,
}

impl Server {
    /// Wire the engine from configuration.
    ///
    /// This is the explicit initialization phase: the signing key is loaded
    /// and the JWKS derived here, before any request is accepted.
    ///
    /// # Errors
    ///
    /// [`Error::Config`] when `keys.pem_path` is missing, plus every
    /// key-load and registry failure from the engine.
    pub fn new(config: Config) -> Result<Self> {
        let pem_path = config.keys.pem_path.clone().ok_or_else(|| {
            Error::Config(
                "keys.pem_path is required (generate one with `oidc-sandbox keygen`)"
                    .to_string(),
            )
        })?;
        let keys = KeyManager::load(&pem_path)?;

        let identity = Arc::new(SyntheticIdentity::new(&config.identity.email_domain));
        let account = identity.account().clone();
        let broker = Arc::new(AutoApprove::new(account.account_id.clone()));
        let engine = OidcEngine::initialize(
            &config,
            keys,
            identity,
            Arc::new(InMemoryGrantStore::new()),
            broker,
        )?;

        Ok(Self {
            config,
            engine: Arc::new(engine),
            account,
        })
    }

    /// The wired engine, for embedding the provider in-process.
    #[must_use]
    pub fn engine(&self) -> Arc<OidcEngine> {
        Arc::clone(&self.engine)
    }

    /// Run the server until SIGINT/SIGTERM.
    pub async fn run(self) -> Result<()> {
        let addr = SocketAddr::new(
            self.config
                .server
                .host
                .parse()
                .map_err(|e| Error::Config(format!("Invalid host: {e}")))?,
            self.config.server.port,
        );

        let (shutdown_tx, _) = tokio::sync::broadcast::channel(1);

        // Background sweep: abandoned interactions plus expired store records.
        let sweeper_engine = Arc::clone(&self.engine);
        let sweep_interval = self.config.sweep_interval;
        let mut shutdown_rx = shutdown_tx.subscribe();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(sweep_interval);
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        let swept = sweeper_engine.sweep_expired().await;
                        if swept > 0 {
                            debug!(count = swept, "Swept expired records");
                        }
                    }
                    _ = shutdown_rx.recv() => {
                        debug!("Sweeper shutting down");
                        break;
                    }
                }
            }
        });

        let state = Arc::new(AppState {
            engine: Arc::clone(&self.engine),
        });
        let app = create_router(state, &self.config.server);

        let listener = TcpListener::bind(addr).await?;

        let issuer = &self.engine.issuer;
        info!("============================================================");
        info!("OIDC SANDBOX v{}", env!("CARGO_PKG_VERSION"));
        info!("============================================================");
        info!(host = %self.config.server.host, port = %self.config.server.port, "Listening");
        info!(issuer = %issuer, kid = %self.engine.keys.kid(), "Signing with RS256");
        info!(
            sub = %self.account.account_id,
            email = %self.account.email,
            "Synthetic identity ready (every login authenticates this account)"
        );
        info!(clients = self.engine.clients.len(), "Clients registered");
        info!("Endpoints:");
        info!("  GET  {issuer}/.well-known/openid-configuration");
        info!("  GET  {issuer}/jwks");
        info!("  GET  {issuer}/authorize");
        info!("  POST {issuer}/token");
        info!("  GET  {issuer}/userinfo");
        info!("============================================================");

        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal(shutdown_tx))
            .await
            .map_err(|e| Error::Internal(e.to_string()))?;

        Ok(())
    }
}

/// Shutdown signal handler.
async fn shutdown_signal(shutdown_tx: tokio::sync::broadcast::Sender<()>) {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }

    info!("Shutdown signal received");
    let _ = shutdown_tx.send(());
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn new_fails_without_a_key_path() {
        let config = Config::default();
        let Err(err) = Server::new(config) else {
            panic!("construction without a key path must fail");
        };
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn new_fails_on_a_bad_key_file() {
        let dir = tempfile::tempdir().unwrap();
        let pem_path = dir.path().join("garbage.pem");
        std::fs::write(&pem_path, "not a pem").unwrap();

        let mut config = Config::default();
        config.keys.pem_path = Some(pem_path);
        let Err(err) = Server::new(config) else {
            panic!("a non-PEM key file must fail");
        };
        assert!(matches!(err, Error::KeyLoad(_)));
    }

    #[test]
    fn new_wires_the_engine_from_a_valid_key() {
        let dir = tempfile::tempdir().unwrap();
        let pem_path = dir.path().join("key.pem");
        let mut f = std::fs::File::create(&pem_path).unwrap();
        f.write_all(crate::keys::TEST_RSA_PRIVATE_KEY_PEM.as_bytes())
            .unwrap();
        drop(f);

        let mut config = Config::default();
        config.keys.pem_path = Some(pem_path);
        let server = Server::new(config).unwrap();

        let engine = server.engine();
        assert_eq!(engine.issuer, "http://localhost:4000");
        assert_eq!(engine.jwks().keys.len(), 1);
        // The broker is bound to the generated synthetic account.
        assert!(!server.account.account_id.is_empty());
    }
}
