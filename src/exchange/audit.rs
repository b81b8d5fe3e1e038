//! Audit trail for token exchanges.
//!
//! Every exchange outcome is emitted via `tracing::info!` with the event
//! serialized as JSON in the `audit` field.
//!
//! # Events
//!
//! | Event | When |
//! |-------|------|
//! | `exchange.issued` | An access token was minted |
//! | `exchange.denied` | Policy refused the repository or ref |
//! | `exchange.rate_limited` | The repository exhausted its bucket |
//! | `exchange.invalid` | The request or the OIDC assertion was rejected |
//! | `exchange.failed` | Minting failed |

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::oidc::NormalizedClaims;
use crate::token::MintedToken;

/// Structured audit event.
#[derive(Debug, Serialize)]
pub struct AuditEvent {
    /// Event type string (e.g. `"exchange.issued"`).
    pub event: &'static str,
    /// Repository, once the assertion has been verified.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub repository: Option<String>,
    /// Git ref of the workflow run.
    #[serde(rename = "ref", skip_serializing_if = "Option::is_none")]
    pub git_ref: Option<String>,
    /// Actor that triggered the run.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub actor: Option<String>,
    /// Workflow run identifier.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,
    /// `jti` of the minted token.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token_jti: Option<String>,
    /// Expiry of the minted token.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    /// Why the exchange did not succeed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl AuditEvent {
    fn for_identity(event: &'static str, claims: &NormalizedClaims) -> Self {
        Self {
            event,
            repository: Some(claims.repository.clone()),
            git_ref: Some(claims.git_ref.clone()),
            actor: Some(claims.actor.clone()),
            run_id: Some(claims.run_id.clone()),
            token_jti: None,
            expires_at: None,
            reason: None,
        }
    }

    fn anonymous(event: &'static str, reason: String) -> Self {
        Self {
            event,
            repository: None,
            git_ref: None,
            actor: None,
            run_id: None,
            token_jti: None,
            expires_at: None,
            reason: Some(reason),
        }
    }

    /// Construct an `exchange.issued` event.
    #[must_use]
    pub fn issued(claims: &NormalizedClaims, minted: &MintedToken) -> Self {
        Self {
            token_jti: Some(minted.jti.clone()),
            expires_at: Some(minted.expires_at),
            ..Self::for_identity("exchange.issued", claims)
        }
    }

    /// Construct an `exchange.denied` event.
    #[must_use]
    pub fn denied(claims: &NormalizedClaims, reason: impl Into<String>) -> Self {
        Self {
            reason: Some(reason.into()),
            ..Self::for_identity("exchange.denied", claims)
        }
    }

    /// Construct an `exchange.rate_limited` event.
    #[must_use]
    pub fn rate_limited(claims: &NormalizedClaims) -> Self {
        Self::for_identity("exchange.rate_limited", claims)
    }

    /// Construct an `exchange.invalid` event.
    #[must_use]
    pub fn invalid(reason: impl Into<String>) -> Self {
        Self::anonymous("exchange.invalid", reason.into())
    }

    /// Construct an `exchange.failed` event.
    #[must_use]
    pub fn failed(claims: &NormalizedClaims, reason: impl Into<String>) -> Self {
        Self {
            reason: Some(reason.into()),
            ..Self::for_identity("exchange.failed", claims)
        }
    }
}

/// Emit an audit event:
///
/// ```text
/// INFO ci_token_broker::exchange::audit audit={"event":"exchange.issued",...}
/// ```
pub fn emit(event: &AuditEvent) {
    match serde_json::to_string(event) {
        Ok(ref json) => tracing::info!(audit = %json, "exchange audit"),
        Err(ref e) => tracing::warn!(error = %e, "Failed to serialize audit event"),
    }
}
