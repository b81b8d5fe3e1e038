//! CI Token Broker Library
//!
//! Exchanges GitHub Actions OIDC identity tokens for short-lived, HS256-signed
//! internal access tokens.
//!
//! # Pipeline
//!
//! - **Verify**: RSA signature against the provider's cached JWKS, then `iss`,
//!   `aud`, `exp`/`nbf` and the CI context claims
//! - **Rate limit**: per-repository token bucket
//! - **Policy**: denylist, allowlist, default-branch restriction
//! - **Mint**: access token with a fresh `jti` and fixed TTL

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod cli;
pub mod config;
pub mod error;
pub mod exchange;
pub mod oidc;
pub mod policy;
pub mod rate_limit;
pub mod server;
pub mod token;

pub use error::{Error, Result};

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Setup tracing/logging
pub fn setup_tracing(level: &str, format: Option<&str>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let subscriber = tracing_subscriber::registry().with(filter);

    let initialized = match format {
        Some("json") => subscriber.with(fmt::layer().json()).try_init(),
        _ => subscriber.with(fmt::layer()).try_init(),
    };

    initialized.map_err(|e| Error::Internal(format!("tracing already initialized: {e}")))
}
