//! Network-backed verifier for GitHub Actions OIDC assertions.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use jsonwebtoken::{Algorithm, Validation, errors::ErrorKind};
use tracing::debug;

use super::claims::{self, Audience, RawClaims};
use super::{KeyCache, NormalizedClaims, OidcError, Verifier};
use crate::config::OidcConfig;

/// Algorithms accepted on inbound assertions. Anything else, notably the
/// HMAC family, is rejected before the key cache is consulted.
const ACCEPTED_ALGORITHMS: [Algorithm; 6] = [
    Algorithm::RS256,
    Algorithm::RS384,
    Algorithm::RS512,
    Algorithm::PS256,
    Algorithm::PS384,
    Algorithm::PS512,
];

/// Verifies assertions against the provider's published RSA keys.
pub struct GithubVerifier {
    issuer: String,
    audience: String,
    leeway_secs: i64,
    keys: Arc<KeyCache>,
}

impl GithubVerifier {
    /// Build a verifier with its own key cache.
    pub fn new(config: &OidcConfig) -> crate::Result<Self> {
        let keys = KeyCache::new(
            config.resolved_jwks_uri(),
            config.jwks_ttl,
            config.fetch_timeout,
        )?;
        Ok(Self::with_key_cache(config, Arc::new(keys)))
    }

    /// Build a verifier around an existing key cache.
    #[must_use]
    pub fn with_key_cache(config: &OidcConfig, keys: Arc<KeyCache>) -> Self {
        Self {
            issuer: config.issuer.clone(),
            audience: config.audience.clone(),
            leeway_secs: i64::try_from(config.clock_skew.as_secs()).unwrap_or(i64::MAX),
            keys,
        }
    }

    /// The key cache backing this verifier.
    #[must_use]
    pub fn key_cache(&self) -> &Arc<KeyCache> {
        &self.keys
    }

    fn check_issuer(&self, claims: &RawClaims) -> Result<(), OidcError> {
        let actual = claims.get("iss").and_then(|v| v.as_str()).unwrap_or_default();
        if actual == self.issuer {
            Ok(())
        } else {
            Err(OidcError::IssuerMismatch {
                expected: self.issuer.clone(),
                actual: actual.to_string(),
            })
        }
    }

    fn check_audience(&self, claims: &RawClaims) -> Result<(), OidcError> {
        let audience = Audience::from_claim(claims.get("aud"))?;
        if audience.contains(&self.audience) {
            Ok(())
        } else {
            Err(OidcError::AudienceMismatch {
                expected: self.audience.clone(),
            })
        }
    }

    /// `exp` is required; `nbf` only checked when present. The leeway widens
    /// both bounds.
    fn check_validity_window(&self, claims: &RawClaims, now: i64) -> Result<(), OidcError> {
        let exp = claims::numeric_date(claims, "exp").ok_or(OidcError::MissingClaim("exp"))?;
        if now >= exp.saturating_add(self.leeway_secs) {
            return Err(OidcError::Expired);
        }
        if let Some(nbf) = claims::numeric_date(claims, "nbf") {
            if now < nbf.saturating_sub(self.leeway_secs) {
                return Err(OidcError::NotYetValid);
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Verifier for GithubVerifier {
    async fn verify(&self, token: &str) -> Result<NormalizedClaims, OidcError> {
        let header =
            jsonwebtoken::decode_header(token).map_err(|e| OidcError::Malformed(e.to_string()))?;

        if !ACCEPTED_ALGORITHMS.contains(&header.alg) {
            return Err(OidcError::UnsupportedAlgorithm(format!("{:?}", header.alg)));
        }

        let kid = header.kid.ok_or(OidcError::MissingKeyId)?;
        let key = self.keys.get(&kid).await?;

        // Signature only; claim checks run below in a fixed order.
        let mut validation = Validation::new(header.alg);
        validation.validate_exp = false;
        validation.validate_nbf = false;
        validation.validate_aud = false;
        validation.required_spec_claims = HashSet::new();

        let data = jsonwebtoken::decode::<RawClaims>(token, &key, &validation).map_err(|e| {
            match e.kind() {
                ErrorKind::InvalidSignature => OidcError::InvalidSignature,
                _ => OidcError::Malformed(e.to_string()),
            }
        })?;
        let raw = data.claims;

        self.check_issuer(&raw)?;
        self.check_audience(&raw)?;
        self.check_validity_window(&raw, Utc::now().timestamp())?;

        let normalized = claims::normalize(&raw)?;
        debug!(
            repository = %normalized.repository,
            git_ref = %normalized.git_ref,
            run_id = %normalized.run_id,
            "OIDC assertion verified"
        );
        Ok(normalized)
    }
}
