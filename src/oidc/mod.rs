//! Inbound OIDC assertion verification.
//!
//! # Verification flow
//!
//! 1. Decode the JWT header (no verification) to extract `kid` and `alg`.
//! 2. Reject anything outside the RSA family before touching the key cache,
//!    so an attacker cannot downgrade to an HMAC algorithm keyed with data
//!    they control.
//! 3. Resolve the signing key through the [`KeyCache`] (TTL-bound snapshot,
//!    one refresh on miss).
//! 4. Verify the signature, then `iss`, `aud`, `exp`/`nbf` (with leeway).
//! 5. Extract the CI context claims into [`NormalizedClaims`].
//!
//! The [`Verifier`] trait is the seam the exchange pipeline depends on.
//! [`GithubVerifier`] is the network-backed implementation; [`FakeVerifier`]
//! is a deterministic double for tests.

pub mod claims;
pub mod fake;
pub mod jwks;
pub mod verifier;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use fake::FakeVerifier;
pub use jwks::KeyCache;
pub use verifier::GithubVerifier;

/// Error variants for OIDC verification failures.
///
/// Callers see a single generic "invalid token" category; the variant is
/// logged so operators can tell a bad token from an unreachable provider.
#[derive(Debug, thiserror::Error)]
pub enum OidcError {
    /// The token is not a structurally valid JWT.
    #[error("malformed token: {0}")]
    Malformed(String),

    /// The header declares an algorithm outside the RSA family.
    #[error("unsupported signing algorithm: {0}")]
    UnsupportedAlgorithm(String),

    /// The JWT header contains no `kid` field.
    #[error("JWT missing 'kid' field in header")]
    MissingKeyId,

    /// The `kid` is not in the provider's key set, even after a refresh.
    #[error("unknown key ID: {0}")]
    UnknownKeyId(String),

    /// Network or HTTP error while fetching JWKS.
    #[error("JWKS fetch error: {0}")]
    JwksFetch(#[from] reqwest::Error),

    /// The signature does not verify against the resolved key.
    #[error("invalid signature")]
    InvalidSignature,

    /// The `iss` claim does not equal the configured issuer.
    #[error("issuer mismatch: expected {expected}, got {actual}")]
    IssuerMismatch {
        /// Expected issuer URL.
        expected: String,
        /// Actual issuer found in the token (empty if absent).
        actual: String,
    },

    /// The `aud` claim does not contain the configured audience.
    #[error("audience does not contain {expected}")]
    AudienceMismatch {
        /// Expected audience.
        expected: String,
    },

    /// The `aud` claim is neither a string nor an array.
    #[error("invalid audience claim type")]
    InvalidAudienceType,

    /// `exp` is in the past (beyond leeway).
    #[error("token expired")]
    Expired,

    /// `nbf` is in the future (beyond leeway).
    #[error("token not yet valid")]
    NotYetValid,

    /// A required claim is absent, empty, or of the wrong type.
    #[error("missing or invalid {0} claim")]
    MissingClaim(&'static str),
}

impl OidcError {
    /// Whether the failure came from the identity provider being unreachable
    /// or returning garbage, rather than from the token itself.
    #[must_use]
    pub fn is_upstream(&self) -> bool {
        matches!(self, Self::JwksFetch(_))
    }
}

/// Verified, provider-agnostic CI identity.
///
/// Every string field is non-empty once produced by a [`Verifier`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NormalizedClaims {
    /// `owner/name` of the repository the workflow runs in.
    pub repository: String,
    /// Git ref the workflow was triggered for (e.g. `refs/heads/main`).
    #[serde(rename = "ref")]
    pub git_ref: String,
    /// User or app that triggered the run.
    pub actor: String,
    /// Provider-unique workflow run identifier.
    pub run_id: String,
    /// Workflow reference (`path@ref`).
    pub workflow: String,
    /// Assertion `iat`.
    pub issued_at: DateTime<Utc>,
    /// Assertion `exp`.
    pub expires_at: DateTime<Utc>,
}

/// Strategy for turning a raw assertion into [`NormalizedClaims`].
///
/// Implementations must be `Send + Sync` because the verifier is shared
/// across request tasks.
#[async_trait::async_trait]
pub trait Verifier: Send + Sync + 'static {
    /// Verify `token` and return its normalized claims.
    async fn verify(&self, token: &str) -> Result<NormalizedClaims, OidcError>;
}
