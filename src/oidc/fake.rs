//! Deterministic [`Verifier`] double for tests.

use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use chrono::{Duration, Utc};

use super::{NormalizedClaims, OidcError, Verifier};

type VerifyFn = dyn Fn(&str) -> Result<NormalizedClaims, OidcError> + Send + Sync;

/// Verifier that never touches the network.
///
/// Without a closure every call succeeds with [`FakeVerifier::default_claims`].
#[derive(Default)]
pub struct FakeVerifier {
    verify_fn: Option<Box<VerifyFn>>,
    calls: AtomicUsize,
}

impl FakeVerifier {
    /// Always succeeds with the default claims.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Delegate every call to `f`.
    #[must_use]
    pub fn with_fn<F>(f: F) -> Self
    where
        F: Fn(&str) -> Result<NormalizedClaims, OidcError> + Send + Sync + 'static,
    {
        Self {
            verify_fn: Some(Box::new(f)),
            calls: AtomicUsize::new(0),
        }
    }

    /// Number of times [`Verifier::verify`] has been invoked.
    #[must_use]
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Claim set returned when no closure is configured.
    #[must_use]
    pub fn default_claims() -> NormalizedClaims {
        let now = Utc::now();
        NormalizedClaims {
            repository: "test/repo".to_string(),
            git_ref: "refs/heads/main".to_string(),
            actor: "testuser".to_string(),
            run_id: "123456789".to_string(),
            workflow: ".github/workflows/test.yml@refs/heads/main".to_string(),
            issued_at: now,
            expires_at: now + Duration::hours(1),
        }
    }
}

#[async_trait]
impl Verifier for FakeVerifier {
    async fn verify(&self, token: &str) -> Result<NormalizedClaims, OidcError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match &self.verify_fn {
            Some(f) => f(token),
            None => Ok(Self::default_claims()),
        }
    }
}
