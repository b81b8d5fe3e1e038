//! OIDC-to-access-token exchange pipeline.
//!
//! ```text
//! oidc_token
//!   -> Verifier      (signature, iss, aud, exp/nbf, required claims)
//!   -> RateLimiter   (per repository)
//!   -> PolicyEngine  (denylist, allowlist, default branch)
//!   -> Minter        (HS256 access token)
//! ```
//!
//! Stages run strictly in that order and the first failure ends the request.
//! Rate limiting runs before policy, so a denied repository still spends a
//! token from its bucket.

pub mod audit;
pub mod handler;

use std::sync::Arc;

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::config::Config;
use crate::oidc::{NormalizedClaims, OidcError, Verifier};
use crate::policy::{DenyReason, PolicyDecision, PolicyEngine};
use crate::rate_limit::RateLimiter;
use crate::token::{Minter, TokenError};

use audit::AuditEvent;

pub use handler::routes;

/// Provider tag reported in [`SubjectDetails`].
pub const PROVIDER: &str = "github_actions";

/// `POST /auth/github-oidc` body.
#[derive(Debug, Deserialize)]
pub struct ExchangeRequest {
    /// Raw OIDC assertion issued to the workflow.
    #[serde(default)]
    pub oidc_token: String,
}

/// Successful exchange.
#[derive(Debug, Serialize, Deserialize)]
pub struct ExchangeResponse {
    /// Signed access token.
    pub access_token: String,
    /// Whole seconds until the access token expires.
    pub expires_in: i64,
    /// Always `"Bearer"`.
    pub token_type: String,
    /// RFC 3339 issue time.
    pub issued_at: String,
    /// Verified workflow identity.
    pub subject: SubjectDetails,
}

/// Identity the access token was issued to.
#[derive(Debug, Serialize, Deserialize)]
pub struct SubjectDetails {
    /// Always [`PROVIDER`].
    pub provider: String,
    /// `owner/name`.
    pub repository: String,
    /// Git ref of the run.
    #[serde(rename = "ref")]
    pub git_ref: String,
    /// Workflow reference.
    pub workflow: String,
    /// Workflow run identifier.
    pub run_id: String,
    /// Actor that triggered the run.
    pub actor: String,
}

impl From<&NormalizedClaims> for SubjectDetails {
    fn from(claims: &NormalizedClaims) -> Self {
        Self {
            provider: PROVIDER.to_string(),
            repository: claims.repository.clone(),
            git_ref: claims.git_ref.clone(),
            workflow: claims.workflow.clone(),
            run_id: claims.run_id.clone(),
            actor: claims.actor.clone(),
        }
    }
}

/// JSON error body.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorBody {
    /// Stable machine-readable code.
    pub error: String,
    /// Human-readable detail.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Why an exchange failed. Each variant maps to one HTTP status and code.
#[derive(Debug, thiserror::Error)]
pub enum ExchangeError {
    /// Body unparseable or `oidc_token` missing/empty.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// The assertion did not verify, or the key provider was unreachable.
    #[error("verification failed: {0}")]
    Verification(#[from] OidcError),

    /// The repository's bucket is empty.
    #[error("rate limit exceeded for {0}")]
    RateLimited(String),

    /// Policy refused the exchange.
    #[error("policy violation: {0}")]
    Policy(DenyReason),

    /// Minting failed.
    #[error("internal error: {0}")]
    Internal(#[from] TokenError),
}

impl ExchangeError {
    /// Stable error code returned to the caller.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidRequest(_) => "invalid_request",
            Self::Verification(_) => "invalid_token",
            Self::RateLimited(_) => "rate_limited",
            Self::Policy(_) => "policy_violation",
            Self::Internal(_) => "internal_error",
        }
    }

    /// HTTP status for this failure.
    #[must_use]
    pub fn status(&self) -> StatusCode {
        match self {
            Self::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            Self::Verification(_) => StatusCode::UNAUTHORIZED,
            Self::RateLimited(_) => StatusCode::TOO_MANY_REQUESTS,
            Self::Policy(_) => StatusCode::FORBIDDEN,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Message safe to show the caller. Verification and internal details
    /// stay in the logs.
    #[must_use]
    pub fn public_message(&self) -> String {
        match self {
            Self::InvalidRequest(detail) => detail.clone(),
            Self::Verification(_) => "failed to verify OIDC token".to_string(),
            Self::RateLimited(_) => "rate limit exceeded for repository".to_string(),
            Self::Policy(reason) => reason.to_string(),
            Self::Internal(_) => "failed to create access token".to_string(),
        }
    }
}

impl IntoResponse for ExchangeError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: self.code().to_string(),
            message: Some(self.public_message()),
        };
        (self.status(), Json(body)).into_response()
    }
}

/// The exchange pipeline. Shared by all request tasks.
pub struct TokenExchange {
    verifier: Arc<dyn Verifier>,
    limiter: RateLimiter,
    policy: PolicyEngine,
    minter: Minter,
}

impl TokenExchange {
    /// Assemble a pipeline from its stages.
    #[must_use]
    pub fn new(
        verifier: Arc<dyn Verifier>,
        limiter: RateLimiter,
        policy: PolicyEngine,
        minter: Minter,
    ) -> Self {
        Self {
            verifier,
            limiter,
            policy,
            minter,
        }
    }

    /// Build the non-verifier stages from configuration.
    pub fn from_config(config: &Config, verifier: Arc<dyn Verifier>) -> crate::Result<Self> {
        Ok(Self::new(
            verifier,
            RateLimiter::new(&config.rate_limit)?,
            PolicyEngine::new(&config.policy),
            Minter::from_config(&config.token)?,
        ))
    }

    /// The per-repository rate limiter.
    #[must_use]
    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    /// The token minter.
    #[must_use]
    pub fn minter(&self) -> &Minter {
        &self.minter
    }

    /// Run the full pipeline for one assertion.
    pub async fn exchange(&self, oidc_token: &str) -> Result<ExchangeResponse, ExchangeError> {
        if oidc_token.is_empty() {
            audit::emit(&AuditEvent::invalid("missing oidc_token"));
            return Err(ExchangeError::InvalidRequest(
                "missing oidc_token field".to_string(),
            ));
        }

        let claims = match self.verifier.verify(oidc_token).await {
            Ok(claims) => claims,
            Err(e) => {
                if e.is_upstream() {
                    error!(error = %e, "OIDC key provider unavailable");
                } else {
                    warn!(error = %e, "OIDC verification failed");
                }
                audit::emit(&AuditEvent::invalid(e.to_string()));
                return Err(ExchangeError::Verification(e));
            }
        };

        info!(
            repository = %claims.repository,
            git_ref = %claims.git_ref,
            actor = %claims.actor,
            run_id = %claims.run_id,
            "Verified OIDC token"
        );

        if !self.limiter.allow(&claims.repository) {
            warn!(repository = %claims.repository, "Rate limit exceeded");
            audit::emit(&AuditEvent::rate_limited(&claims));
            return Err(ExchangeError::RateLimited(claims.repository));
        }

        if let PolicyDecision::Deny(reason) =
            self.policy.evaluate(&claims.repository, &claims.git_ref)
        {
            warn!(
                repository = %claims.repository,
                git_ref = %claims.git_ref,
                %reason,
                "Policy violation"
            );
            audit::emit(&AuditEvent::denied(&claims, reason.to_string()));
            return Err(ExchangeError::Policy(reason));
        }

        let minted = match self.minter.mint(&claims) {
            Ok(minted) => minted,
            Err(e) => {
                error!(error = %e, repository = %claims.repository, "Failed to mint access token");
                audit::emit(&AuditEvent::failed(&claims, e.to_string()));
                return Err(ExchangeError::Internal(e));
            }
        };

        let issued_at = Utc::now();
        let expires_in = (minted.expires_at - issued_at).num_seconds().max(0);
        info!(repository = %claims.repository, expires_in, "Issued access token");
        audit::emit(&AuditEvent::issued(&claims, &minted));

        Ok(ExchangeResponse {
            access_token: minted.token,
            expires_in,
            token_type: "Bearer".to_string(),
            issued_at: issued_at.to_rfc3339_opts(SecondsFormat::Secs, true),
            subject: SubjectDetails::from(&claims),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{PolicyConfig, TokenConfig};
    use crate::oidc::FakeVerifier;

    fn pipeline(
        verifier: FakeVerifier,
        policy: PolicyConfig,
        burst: u32,
    ) -> (Arc<FakeVerifier>, TokenExchange) {
        let verifier = Arc::new(verifier);
        let exchange = TokenExchange::new(
            Arc::clone(&verifier) as Arc<dyn Verifier>,
            RateLimiter::with_rate(0.01, burst).unwrap(),
            PolicyEngine::new(&policy),
            Minter::new(&TokenConfig::default(), b"secret"),
        );
        (verifier, exchange)
    }

    #[tokio::test]
    async fn success_reports_subject_and_ttl() {
        let (_, exchange) = pipeline(FakeVerifier::new(), PolicyConfig::default(), 5);

        let response = exchange.exchange("token").await.unwrap();

        assert_eq!(response.token_type, "Bearer");
        assert_eq!(response.subject.provider, "github_actions");
        assert_eq!(response.subject.repository, "test/repo");
        assert!((599..=600).contains(&response.expires_in), "{}", response.expires_in);
        assert!(exchange.minter().validate(&response.access_token).is_ok());
    }

    #[tokio::test]
    async fn empty_token_never_reaches_verifier() {
        let (verifier, exchange) = pipeline(FakeVerifier::new(), PolicyConfig::default(), 5);

        let err = exchange.exchange("").await.unwrap_err();

        assert_eq!(err.code(), "invalid_request");
        assert_eq!(verifier.calls(), 0);
    }

    #[tokio::test]
    async fn verification_failure_is_generic_and_skips_limiter() {
        let fake = FakeVerifier::with_fn(|_| Err(OidcError::Expired));
        let (_, exchange) = pipeline(fake, PolicyConfig::default(), 5);

        let err = exchange.exchange("token").await.unwrap_err();

        assert_eq!(err.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(err.public_message(), "failed to verify OIDC token");
        assert!(exchange.limiter().is_empty());
    }

    #[tokio::test]
    async fn policy_denial_passes_reason_through() {
        let policy = PolicyConfig {
            denylist: vec!["test/repo".to_string()],
            ..PolicyConfig::default()
        };
        let (_, exchange) = pipeline(FakeVerifier::new(), policy, 5);

        let err = exchange.exchange("token").await.unwrap_err();

        assert_eq!(err.code(), "policy_violation");
        assert_eq!(err.public_message(), "denied by policy");
        // The bucket was still charged.
        assert_eq!(exchange.limiter().len(), 1);
    }

    #[tokio::test]
    async fn rate_limit_applies_per_repository() {
        let (_, exchange) = pipeline(FakeVerifier::new(), PolicyConfig::default(), 1);

        assert!(exchange.exchange("token").await.is_ok());
        let err = exchange.exchange("token").await.unwrap_err();

        assert_eq!(err.status(), StatusCode::TOO_MANY_REQUESTS);
    }
}
