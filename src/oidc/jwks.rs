//! JWKS cache for the identity provider's signing keys.
//!
//! The cache holds one immutable [`KeySnapshot`] behind a read/write lock.
//! A refresh builds a complete new snapshot off to the side and swaps it in
//! with a single pointer store, so readers see either the old key set or the
//! new one, never a mix.
//!
//! Refreshes are serialized by an async mutex held across the network
//! fetch. A task that waited on the mutex re-checks the snapshot before
//! fetching, so N concurrent misses for the same `kid` produce one request
//! to the provider.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use jsonwebtoken::{
    DecodingKey,
    jwk::{AlgorithmParameters, Jwk},
};
use parking_lot::RwLock;
use reqwest::header::ACCEPT;
use serde::Deserialize;
use tracing::{debug, info, warn};

use super::OidcError;

/// Raw JWKS document. Entries stay as JSON so one bad key cannot fail the
/// whole document.
#[derive(Debug, Deserialize)]
struct JwksDocument {
    keys: Vec<serde_json::Value>,
}

/// One complete, immutable generation of the key set.
#[derive(Default)]
struct KeySnapshot {
    keys: HashMap<String, DecodingKey>,
    /// `None` until the first successful fetch.
    fetched_at: Option<Instant>,
}

impl KeySnapshot {
    fn is_fresh(&self, ttl: Duration) -> bool {
        !self.keys.is_empty() && self.fetched_at.is_some_and(|t| t.elapsed() < ttl)
    }
}

/// TTL-bound cache of RSA verification keys indexed by `kid`.
pub struct KeyCache {
    jwks_uri: String,
    ttl: Duration,
    http: reqwest::Client,
    snapshot: RwLock<Arc<KeySnapshot>>,
    refresh: tokio::sync::Mutex<()>,
}

impl KeyCache {
    /// Create an empty cache for `jwks_uri`.
    ///
    /// `fetch_timeout` bounds every request to the provider.
    pub fn new(
        jwks_uri: impl Into<String>,
        ttl: Duration,
        fetch_timeout: Duration,
    ) -> crate::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(fetch_timeout)
            .user_agent(concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self::with_client(jwks_uri, ttl, http))
    }

    /// Create an empty cache using a caller-supplied HTTP client.
    #[must_use]
    pub fn with_client(jwks_uri: impl Into<String>, ttl: Duration, http: reqwest::Client) -> Self {
        let jwks_uri = jwks_uri.into();
        if !jwks_uri.starts_with("https://") {
            warn!(jwks_uri = %jwks_uri, "JWKS endpoint is not HTTPS");
        }
        Self {
            jwks_uri,
            ttl,
            http,
            snapshot: RwLock::new(Arc::new(KeySnapshot::default())),
            refresh: tokio::sync::Mutex::new(()),
        }
    }

    /// Resolve the verification key for `kid`.
    ///
    /// Served from memory while the snapshot is fresh and contains `kid`.
    /// Otherwise performs at most one fetch; a failed fetch leaves the
    /// previous snapshot in place.
    ///
    /// # Errors
    ///
    /// - [`OidcError::JwksFetch`] if the provider is unreachable, returns a
    ///   non-success status, or serves a malformed document.
    /// - [`OidcError::UnknownKeyId`] if `kid` is absent from a fresh key set.
    pub async fn get(&self, kid: &str) -> Result<DecodingKey, OidcError> {
        let seen = self.current();
        if seen.is_fresh(self.ttl) {
            if let Some(key) = seen.keys.get(kid) {
                return Ok(key.clone());
            }
        }

        let _guard = self.refresh.lock().await;

        let current = self.current();
        if current.is_fresh(self.ttl) {
            if let Some(key) = current.keys.get(kid) {
                return Ok(key.clone());
            }
            // Someone else refreshed while we waited and the key is still
            // missing; another fetch would return the same document.
            if !Arc::ptr_eq(&seen, &current) {
                return Err(OidcError::UnknownKeyId(kid.to_string()));
            }
        }

        let fresh = Arc::new(self.fetch().await?);
        let key = fresh.keys.get(kid).cloned();
        *self.snapshot.write() = fresh;

        key.ok_or_else(|| OidcError::UnknownKeyId(kid.to_string()))
    }

    /// Number of keys in the current snapshot.
    #[must_use]
    pub fn key_count(&self) -> usize {
        self.current().keys.len()
    }

    /// When the current snapshot was fetched, if ever.
    #[must_use]
    pub fn last_fetched(&self) -> Option<Instant> {
        self.current().fetched_at
    }

    /// The endpoint keys are fetched from.
    #[must_use]
    pub fn jwks_uri(&self) -> &str {
        &self.jwks_uri
    }

    fn current(&self) -> Arc<KeySnapshot> {
        Arc::clone(&self.snapshot.read())
    }

    async fn fetch(&self) -> Result<KeySnapshot, OidcError> {
        debug!(jwks_uri = %self.jwks_uri, "Fetching JWKS");
        let document: JwksDocument = self
            .http
            .get(&self.jwks_uri)
            .header(ACCEPT, "application/json")
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        let total = document.keys.len();
        let keys: HashMap<String, DecodingKey> =
            document.keys.into_iter().filter_map(parse_entry).collect();

        info!(
            jwks_uri = %self.jwks_uri,
            keys = keys.len(),
            skipped = total - keys.len(),
            "JWKS refreshed"
        );

        Ok(KeySnapshot {
            keys,
            fetched_at: Some(Instant::now()),
        })
    }
}

/// Convert one JWKS entry into `(kid, key)`; `None` for entries without a
/// `kid`, of a non-RSA type, or with unparseable components.
fn parse_entry(entry: serde_json::Value) -> Option<(String, DecodingKey)> {
    let jwk: Jwk = match serde_json::from_value(entry) {
        Ok(jwk) => jwk,
        Err(e) => {
            debug!(error = %e, "Skipping unparseable JWKS entry");
            return None;
        }
    };
    let kid = jwk.common.key_id?;

    match &jwk.algorithm {
        AlgorithmParameters::RSA(rsa) => match DecodingKey::from_rsa_components(&rsa.n, &rsa.e) {
            Ok(key) => Some((kid, key)),
            Err(e) => {
                debug!(kid = %kid, error = %e, "Skipping invalid RSA key");
                None
            }
        },
        _ => {
            debug!(kid = %kid, "Skipping non-RSA key");
            None
        }
    }
}
