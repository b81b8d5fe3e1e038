//! Outbound access token minting and validation.
//!
//! Access tokens are HS256 JWTs signed with the broker's secret. The broker
//! keeps no record of what it issued; a token is valid exactly as long as its
//! signature verifies and `exp` is in the future.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation, errors::ErrorKind};
use serde::Serialize;
use serde_json::{Map, Value};
use tracing::debug;
use uuid::Uuid;

use crate::config::TokenConfig;
use crate::oidc::NormalizedClaims;

const SIGNING_ALGORITHM: Algorithm = Algorithm::HS256;
const ACCEPTED_ALGORITHMS: [Algorithm; 3] = [Algorithm::HS256, Algorithm::HS384, Algorithm::HS512];

/// Minting and validation failures.
#[derive(Debug, thiserror::Error)]
pub enum TokenError {
    /// The token is not a structurally valid JWT.
    #[error("malformed token: {0}")]
    Malformed(String),

    /// The header declares an algorithm outside the HMAC family.
    #[error("unsupported signing algorithm: {0}")]
    UnsupportedAlgorithm(String),

    /// The signature does not verify with the configured secret.
    #[error("invalid signature")]
    InvalidSignature,

    /// `exp` is absent or not in the future.
    #[error("token expired")]
    Expired,

    /// Signing failed while minting.
    #[error("failed to sign token: {0}")]
    Signing(#[source] jsonwebtoken::errors::Error),
}

/// Freshly minted token with its validity window.
#[derive(Debug, Clone)]
pub struct MintedToken {
    /// Compact JWT.
    pub token: String,
    /// The token's `jti`.
    pub jti: String,
    /// `iat`, whole seconds.
    pub issued_at: DateTime<Utc>,
    /// `exp`, exactly `issued_at + ttl`.
    pub expires_at: DateTime<Utc>,
}

/// Claims read back from a validated access token.
///
/// Fields with an unexpected JSON type decode to their empty value.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AccessClaims {
    /// Issuer.
    pub iss: String,
    /// `repo:<owner/name>`.
    pub sub: String,
    /// Audience.
    pub aud: String,
    /// Issued-at (Unix seconds).
    pub iat: i64,
    /// Expiry (Unix seconds).
    pub exp: i64,
    /// Unique token identifier.
    pub jti: String,
    /// Repository the token was issued to.
    pub repo: String,
    /// Git ref of the originating workflow run.
    #[serde(rename = "ref")]
    pub git_ref: String,
    /// Actor that triggered the run.
    pub actor: String,
    /// Workflow run identifier.
    pub run_id: String,
    /// Granted scopes.
    pub scopes: Vec<String>,
}

#[derive(Serialize)]
struct OutboundClaims<'a> {
    iss: &'a str,
    sub: String,
    aud: &'a str,
    iat: i64,
    exp: i64,
    jti: String,
    repo: &'a str,
    #[serde(rename = "ref")]
    git_ref: &'a str,
    actor: &'a str,
    run_id: &'a str,
    scopes: &'a [String],
}

/// Signs and validates access tokens. Immutable after construction.
pub struct Minter {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    ttl_secs: i64,
    issuer: String,
    audience: String,
    scopes: Vec<String>,
    minted: AtomicU64,
}

impl Minter {
    /// Build a minter from token settings and an already-resolved secret.
    #[must_use]
    pub fn new(config: &TokenConfig, secret: &[u8]) -> Self {
        Self {
            encoding_key: EncodingKey::from_secret(secret),
            decoding_key: DecodingKey::from_secret(secret),
            ttl_secs: i64::try_from(config.ttl.as_secs()).unwrap_or(i64::MAX),
            issuer: config.issuer.clone(),
            audience: config.audience.clone(),
            scopes: config.scopes.clone(),
            minted: AtomicU64::new(0),
        }
    }

    /// Number of tokens minted since construction.
    pub fn minted(&self) -> u64 {
        self.minted.load(Ordering::Relaxed)
    }

    /// Build from configuration, resolving the signing secret.
    pub fn from_config(config: &TokenConfig) -> crate::Result<Self> {
        let secret = config
            .resolve_secret()
            .ok_or_else(|| crate::Error::Config("token.signing_secret is not set".to_string()))?;
        Ok(Self::new(config, secret.as_bytes()))
    }

    /// Mint a token for a verified identity.
    pub fn mint(&self, claims: &NormalizedClaims) -> Result<MintedToken, TokenError> {
        let iat = Utc::now().timestamp();
        let exp = iat.saturating_add(self.ttl_secs);

        let outbound = OutboundClaims {
            iss: &self.issuer,
            sub: format!("repo:{}", claims.repository),
            aud: &self.audience,
            iat,
            exp,
            jti: Uuid::new_v4().to_string(),
            repo: &claims.repository,
            git_ref: &claims.git_ref,
            actor: &claims.actor,
            run_id: &claims.run_id,
            scopes: &self.scopes,
        };

        let header = Header::new(SIGNING_ALGORITHM);
        let token = jsonwebtoken::encode(&header, &outbound, &self.encoding_key)
            .map_err(TokenError::Signing)?;
        self.minted.fetch_add(1, Ordering::Relaxed);

        debug!(jti = %outbound.jti, repository = %claims.repository, "Access token minted");

        Ok(MintedToken {
            token,
            jti: outbound.jti,
            issued_at: DateTime::from_timestamp(iat, 0).unwrap_or_default(),
            expires_at: DateTime::from_timestamp(exp, 0).unwrap_or_default(),
        })
    }

    /// Validate a token minted with the same secret.
    ///
    /// Algorithm family, signature and expiry are hard failures; every other
    /// claim is read leniently.
    pub fn validate(&self, token: &str) -> Result<AccessClaims, TokenError> {
        self.validate_at(token, Utc::now().timestamp())
    }

    fn validate_at(&self, token: &str, now: i64) -> Result<AccessClaims, TokenError> {
        let header =
            jsonwebtoken::decode_header(token).map_err(|e| TokenError::Malformed(e.to_string()))?;
        if !ACCEPTED_ALGORITHMS.contains(&header.alg) {
            return Err(TokenError::UnsupportedAlgorithm(format!("{:?}", header.alg)));
        }

        let mut validation = Validation::new(header.alg);
        validation.validate_exp = false;
        validation.validate_aud = false;
        validation.required_spec_claims = HashSet::new();

        let raw = jsonwebtoken::decode::<Map<String, Value>>(token, &self.decoding_key, &validation)
            .map_err(|e| match e.kind() {
                ErrorKind::InvalidSignature => TokenError::InvalidSignature,
                _ => TokenError::Malformed(e.to_string()),
            })?
            .claims;

        let claims = AccessClaims::from_lenient(&raw);
        if raw.get("exp").and_then(Value::as_f64).is_none() || now >= claims.exp {
            return Err(TokenError::Expired);
        }
        Ok(claims)
    }
}

impl AccessClaims {
    fn from_lenient(raw: &Map<String, Value>) -> Self {
        let text = |name: &str| {
            raw.get(name)
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_default()
        };
        #[allow(clippy::cast_possible_truncation)]
        let seconds = |name: &str| {
            raw.get(name)
                .and_then(|v| v.as_i64().or_else(|| v.as_f64().map(|f| f.trunc() as i64)))
                .unwrap_or_default()
        };
        let scopes = raw
            .get("scopes")
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(|v| v.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default();

        Self {
            iss: text("iss"),
            sub: text("sub"),
            aud: text("aud"),
            iat: seconds("iat"),
            exp: seconds("exp"),
            jti: text("jti"),
            repo: text("repo"),
            git_ref: text("ref"),
            actor: text("actor"),
            run_id: text("run_id"),
            scopes,
        }
    }
}
