//! HTTP server

use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::oneshot;
use tower_http::{catch_panic::CatchPanicLayer, timeout::TimeoutLayer, trace::TraceLayer};
use tracing::{error, info, warn};

use crate::config::{Config, ServerConfig};
use crate::exchange::{self, TokenExchange};
use crate::oidc::{GithubVerifier, Verifier};
use crate::{Error, Result};

/// Token broker server
pub struct Server {
    config: Config,
    exchange: Arc<TokenExchange>,
}

impl Server {
    /// Build every pipeline stage from configuration.
    pub fn new(config: Config) -> Result<Self> {
        let verifier: Arc<dyn Verifier> = Arc::new(GithubVerifier::new(&config.oidc)?);
        Self::with_verifier(config, verifier)
    }

    /// Build with a caller-supplied verifier.
    pub fn with_verifier(config: Config, verifier: Arc<dyn Verifier>) -> Result<Self> {
        let exchange = Arc::new(TokenExchange::from_config(&config, verifier)?);
        Ok(Self { config, exchange })
    }

    /// The router with all middleware applied.
    #[must_use]
    pub fn router(&self) -> Router {
        build_router(Arc::clone(&self.exchange), &self.config.server)
    }

    /// Serve until Ctrl-C or SIGTERM, then drain in-flight requests for at
    /// most `server.shutdown_timeout`.
    pub async fn run(self) -> Result<()> {
        let addr = SocketAddr::new(
            self.config
                .server
                .host
                .parse()
                .map_err(|e| Error::Config(format!("Invalid host: {e}")))?,
            self.config.server.port,
        );

        let listener = TcpListener::bind(addr).await?;
        let app = self.router();

        info!(version = env!("CARGO_PKG_VERSION"), %addr, "CI token broker listening");
        info!(
            issuer = %self.config.oidc.issuer,
            audience = %self.config.oidc.audience,
            jwks_uri = %self.config.oidc.resolved_jwks_uri(),
            "Accepting GitHub Actions OIDC tokens"
        );
        info!(
            rps = self.config.rate_limit.requests_per_second,
            burst = self.config.rate_limit.burst,
            default_branch_only = self.config.policy.default_branch_only,
            allowlist = self.config.policy.allowlist.len(),
            denylist = self.config.policy.denylist.len(),
            "Policy loaded"
        );

        let (stop_tx, stop_rx) = oneshot::channel::<()>();
        let mut serving = tokio::spawn(
            axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    let _ = stop_rx.await;
                })
                .into_future(),
        );

        tokio::select! {
            joined = &mut serving => return flatten(joined),
            () = shutdown_signal() => {}
        }

        let _ = stop_tx.send(());
        let grace = self.config.server.shutdown_timeout;
        match tokio::time::timeout(grace, serving).await {
            Ok(joined) => flatten(joined),
            Err(_) => {
                warn!(?grace, "In-flight requests did not finish in time");
                Ok(())
            }
        }
    }
}

/// Mount the exchange routes and wrap them in tracing, panic and timeout
/// middleware.
pub fn build_router(exchange: Arc<TokenExchange>, config: &ServerConfig) -> Router {
    #[allow(deprecated)]
    let timeout = TimeoutLayer::new(config.request_timeout);

    exchange::routes(exchange)
        .layer(timeout)
        .layer(CatchPanicLayer::new())
        .layer(TraceLayer::new_for_http())
}

fn flatten(joined: std::result::Result<std::io::Result<()>, tokio::task::JoinError>) -> Result<()> {
    match joined {
        Ok(served) => served.map_err(Error::from),
        Err(e) => Err(Error::Internal(format!("server task failed: {e}"))),
    }
}

/// Resolves on Ctrl-C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }

    info!("Shutdown signal received");
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    use crate::oidc::FakeVerifier;

    fn config() -> Config {
        let mut config = Config::default();
        config.token.signing_secret = Some("secret".to_string());
        config
    }

    #[test]
    fn missing_secret_fails_construction() {
        let result = Server::with_verifier(Config::default(), Arc::new(FakeVerifier::new()));

        assert!(result.is_err());
    }

    #[tokio::test]
    async fn router_serves_health_through_middleware() {
        let server = Server::with_verifier(config(), Arc::new(FakeVerifier::new())).unwrap();

        let response = server
            .router()
            .oneshot(Request::get("/healthz").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn unknown_route_is_not_found() {
        let server = Server::with_verifier(config(), Arc::new(FakeVerifier::new())).unwrap();

        let response = server
            .router()
            .oneshot(Request::get("/nope").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn invalid_host_is_config_error() {
        let mut config = config();
        config.server.host = "not a host".to_string();
        let server = Server::with_verifier(config, Arc::new(FakeVerifier::new())).unwrap();

        assert!(matches!(server.run().await, Err(Error::Config(_))));
    }
}
