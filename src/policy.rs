//! Repository and branch policy.
//!
//! Checks run in a fixed order and the first failure wins:
//!
//! | Order | Check | Reason |
//! |-------|-------|--------|
//! | 1 | repository in denylist | `denied by policy` |
//! | 2 | allowlist non-empty and repository absent | `not in allowlist` |
//! | 3 | default-branch-only and ref is not the default branch | `only default branch permitted` |
//!
//! The denylist beats the allowlist. Matching is exact and case-sensitive.

use std::collections::HashSet;
use std::fmt;

use serde::Serialize;
use tracing::debug;

use crate::config::PolicyConfig;

const HEADS_PREFIX: &str = "refs/heads/";

/// Why a repository/ref pair was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DenyReason {
    /// Repository is on the denylist.
    DeniedByPolicy,
    /// An allowlist is configured and the repository is not on it.
    NotInAllowlist,
    /// Only the default branch may exchange tokens.
    BranchNotPermitted,
}

impl fmt::Display for DenyReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::DeniedByPolicy => "denied by policy",
            Self::NotInAllowlist => "not in allowlist",
            Self::BranchNotPermitted => "only default branch permitted",
        })
    }
}

/// Outcome of [`PolicyEngine::evaluate`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolicyDecision {
    /// Exchange may proceed.
    Allow,
    /// Exchange refused.
    Deny(DenyReason),
}

impl PolicyDecision {
    /// Whether the decision is [`PolicyDecision::Allow`].
    #[must_use]
    pub fn is_allowed(self) -> bool {
        matches!(self, Self::Allow)
    }
}

/// Immutable policy evaluated once per exchange.
#[derive(Debug, Clone)]
pub struct PolicyEngine {
    default_branch_only: bool,
    default_ref: String,
    allowlist: HashSet<String>,
    denylist: HashSet<String>,
}

impl PolicyEngine {
    /// Build the engine from configuration.
    #[must_use]
    pub fn new(config: &PolicyConfig) -> Self {
        Self {
            default_branch_only: config.default_branch_only,
            default_ref: format!("{HEADS_PREFIX}{}", config.default_branch),
            allowlist: config.allowlist.iter().cloned().collect(),
            denylist: config.denylist.iter().cloned().collect(),
        }
    }

    /// Decide whether `repository` at `git_ref` may receive a token.
    #[must_use]
    pub fn evaluate(&self, repository: &str, git_ref: &str) -> PolicyDecision {
        let decision = if self.denylist.contains(repository) {
            PolicyDecision::Deny(DenyReason::DeniedByPolicy)
        } else if !self.allowlist.is_empty() && !self.allowlist.contains(repository) {
            PolicyDecision::Deny(DenyReason::NotInAllowlist)
        } else if self.default_branch_only && !self.is_default_branch(git_ref) {
            PolicyDecision::Deny(DenyReason::BranchNotPermitted)
        } else {
            PolicyDecision::Allow
        };

        debug!(repository = %repository, git_ref = %git_ref, ?decision, "Policy evaluated");
        decision
    }

    /// Whether `git_ref` is exactly `refs/heads/<default_branch>`.
    #[must_use]
    pub fn is_default_branch(&self, git_ref: &str) -> bool {
        git_ref == self.default_ref
    }
}

/// Branch name of a `refs/heads/...` ref; other refs are returned unchanged.
#[must_use]
pub fn extract_branch(git_ref: &str) -> &str {
    git_ref.strip_prefix(HEADS_PREFIX).unwrap_or(git_ref)
}
