//! Configuration management
//!
//! Configuration is fixed for the process lifetime. Sources, later ones
//! overriding earlier ones:
//!
//! 1. Built-in defaults
//! 2. Optional YAML file (`--config`)
//! 3. Environment variables prefixed `CI_BROKER_`, `__` separating nested
//!    keys (e.g. `CI_BROKER_RATE_LIMIT__BURST=10`)

use std::{env, fmt, path::Path, time::Duration};

use figment::{
    Figment,
    providers::{Env, Format, Yaml},
};
use regex::Regex;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::{Error, Result};

/// Environment variable prefix for configuration overrides.
pub const ENV_PREFIX: &str = "CI_BROKER_";

/// Main configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    /// Environment files to load before resolving secrets.
    /// Paths support ~ expansion. Loaded in order, later files override earlier.
    pub env_files: Vec<String>,
    /// Server configuration
    pub server: ServerConfig,
    /// Inbound OIDC assertion verification
    pub oidc: OidcConfig,
    /// Repository and branch policy
    pub policy: PolicyConfig,
    /// Per-repository rate limiting
    pub rate_limit: RateLimitConfig,
    /// Outbound access token minting
    pub token: TokenConfig,
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Host to bind to
    pub host: String,
    /// Port to listen on
    pub port: u16,
    /// Per-request timeout
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,
    /// Graceful shutdown timeout
    #[serde(with = "humantime_serde")]
    pub shutdown_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            request_timeout: Duration::from_secs(30),
            shutdown_timeout: Duration::from_secs(15),
        }
    }
}

/// OIDC verification configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OidcConfig {
    /// Expected `iss` claim; also the base for the default JWKS URI
    #[serde(deserialize_with = "lenient_string::deserialize")]
    pub issuer: String,
    /// Expected `aud` claim value
    #[serde(deserialize_with = "lenient_string::deserialize")]
    pub audience: String,
    /// JWKS endpoint override (default: `<issuer>/.well-known/jwks`)
    #[serde(deserialize_with = "lenient_string::option")]
    pub jwks_uri: Option<String>,
    /// Leeway applied to both `exp` and `nbf`
    #[serde(with = "humantime_serde")]
    pub clock_skew: Duration,
    /// How long a fetched key set stays fresh
    #[serde(with = "humantime_serde")]
    pub jwks_ttl: Duration,
    /// Timeout for a single JWKS fetch
    #[serde(with = "humantime_serde")]
    pub fetch_timeout: Duration,
}

impl Default for OidcConfig {
    fn default() -> Self {
        Self {
            issuer: "https://token.actions.githubusercontent.com".to_string(),
            audience: "robohub".to_string(),
            jwks_uri: None,
            clock_skew: Duration::from_secs(60),
            jwks_ttl: Duration::from_secs(3600),
            fetch_timeout: Duration::from_secs(10),
        }
    }
}

impl OidcConfig {
    /// The JWKS endpoint to fetch signing keys from.
    #[must_use]
    pub fn resolved_jwks_uri(&self) -> String {
        self.jwks_uri.clone().unwrap_or_else(|| {
            let base = self.issuer.trim_end_matches('/');
            format!("{base}/.well-known/jwks")
        })
    }
}

/// Repository and branch policy configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyConfig {
    /// Only allow assertions issued for the default branch
    pub default_branch_only: bool,
    /// Name of the default branch (without `refs/heads/`)
    #[serde(deserialize_with = "lenient_string::deserialize")]
    pub default_branch: String,
    /// Repositories allowed to exchange tokens (empty = no restriction)
    #[serde(deserialize_with = "string_list::deserialize")]
    pub allowlist: Vec<String>,
    /// Repositories always denied, even when allowlisted
    #[serde(deserialize_with = "string_list::deserialize")]
    pub denylist: Vec<String>,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            default_branch_only: false,
            default_branch: "main".to_string(),
            allowlist: Vec::new(),
            denylist: Vec::new(),
        }
    }
}

/// Per-repository token bucket configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Refill rate in tokens per second
    pub requests_per_second: f64,
    /// Bucket capacity
    pub burst: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            requests_per_second: 1.0,
            burst: 5,
        }
    }
}

/// Outbound access token configuration
#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TokenConfig {
    /// HMAC signing secret.
    /// Supports: literal value, `env:VAR_NAME`, or `${VAR}` / `${VAR:-default}`.
    #[serde(deserialize_with = "lenient_string::option")]
    pub signing_secret: Option<String>,
    /// Lifetime of a minted token
    #[serde(with = "humantime_serde")]
    pub ttl: Duration,
    /// `iss` claim of minted tokens
    #[serde(deserialize_with = "lenient_string::deserialize")]
    pub issuer: String,
    /// `aud` claim of minted tokens
    #[serde(deserialize_with = "lenient_string::deserialize")]
    pub audience: String,
    /// Scopes granted to every minted token
    pub scopes: Vec<String>,
}

impl Default for TokenConfig {
    fn default() -> Self {
        Self {
            signing_secret: None,
            ttl: Duration::from_secs(600),
            issuer: "ci-token-broker".to_string(),
            audience: "ci-api".to_string(),
            scopes: vec!["ingest:build".to_string()],
        }
    }
}

// Hand-written so the signing secret never reaches logs.
impl fmt::Debug for TokenConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenConfig")
            .field(
                "signing_secret",
                &self.signing_secret.as_ref().map(|_| "<redacted>"),
            )
            .field("ttl", &self.ttl)
            .field("issuer", &self.issuer)
            .field("audience", &self.audience)
            .field("scopes", &self.scopes)
            .finish()
    }
}

impl TokenConfig {
    /// Resolve the signing secret (expand `env:VAR_NAME`).
    ///
    /// Returns `None` when no secret is configured or it resolves to an
    /// empty string.
    #[must_use]
    pub fn resolve_secret(&self) -> Option<String> {
        let raw = self.signing_secret.as_ref()?;
        let resolved = if let Some(var_name) = raw.strip_prefix("env:") {
            env::var(var_name).ok()?
        } else {
            raw.clone()
        };
        (!resolved.is_empty()).then_some(resolved)
    }
}

impl Config {
    /// Load configuration from file and environment
    ///
    /// # Errors
    ///
    /// Returns an error if the config file does not exist, cannot be parsed,
    /// or the resulting configuration is invalid.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::new();

        if let Some(p) = path {
            if !p.exists() {
                return Err(Error::Config(format!(
                    "Config file not found: {}",
                    p.display()
                )));
            }
            figment = figment.merge(Yaml::file(p));
        }

        figment = figment.merge(Env::prefixed(ENV_PREFIX).split("__"));

        let mut config: Self = figment
            .extract()
            .map_err(|e| Error::Config(e.to_string()))?;

        // Env files must be in the process environment before `${VAR}` expansion.
        config.load_env_files();
        config.expand_env_vars();
        config.validate()?;

        Ok(config)
    }

    /// Check invariants the pipeline relies on.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] describing the first violated constraint.
    pub fn validate(&self) -> Result<()> {
        if self.token.resolve_secret().is_none() {
            return Err(Error::Config(
                "token.signing_secret is required".to_string(),
            ));
        }
        if self.token.ttl.as_secs() == 0 {
            return Err(Error::Config("token.ttl must be at least 1s".to_string()));
        }
        if !(self.rate_limit.requests_per_second.is_finite()
            && self.rate_limit.requests_per_second > 0.0)
        {
            return Err(Error::Config(format!(
                "rate_limit.requests_per_second must be positive, got {}",
                self.rate_limit.requests_per_second
            )));
        }
        if self.rate_limit.burst == 0 {
            return Err(Error::Config("rate_limit.burst must be at least 1".to_string()));
        }
        if self.oidc.audience.is_empty() {
            return Err(Error::Config("oidc.audience is required".to_string()));
        }
        if self.oidc.jwks_ttl.is_zero() {
            return Err(Error::Config("oidc.jwks_ttl must be non-zero".to_string()));
        }
        Url::parse(&self.oidc.issuer)
            .map_err(|e| Error::Config(format!("oidc.issuer is not a valid URL: {e}")))?;
        Url::parse(&self.oidc.resolved_jwks_uri())
            .map_err(|e| Error::Config(format!("oidc.jwks_uri is not a valid URL: {e}")))?;
        if self.policy.default_branch_only && self.policy.default_branch.is_empty() {
            return Err(Error::Config(
                "policy.default_branch is required when default_branch_only is set".to_string(),
            ));
        }
        Ok(())
    }

    /// Load environment files into the process environment.
    /// Supports ~ expansion. Files that don't exist are silently skipped.
    fn load_env_files(&self) {
        for path_str in &self.env_files {
            let expanded = if path_str.starts_with('~') {
                if let Some(home) = dirs::home_dir() {
                    path_str.replacen('~', &home.display().to_string(), 1)
                } else {
                    path_str.clone()
                }
            } else {
                path_str.clone()
            };

            let path = Path::new(&expanded);
            if path.exists() {
                match dotenvy::from_path(path) {
                    Ok(()) => tracing::info!("Loaded env file: {expanded}"),
                    Err(e) => tracing::warn!("Failed to load env file {expanded}: {e}"),
                }
            } else {
                tracing::debug!("Env file not found (skipped): {expanded}");
            }
        }
    }

    /// Expand ${VAR} and ${VAR:-default} patterns in config values
    fn expand_env_vars(&mut self) {
        let Ok(re) = Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)(?::-([^}]*))?\}") else {
            return;
        };

        if let Some(secret) = self.token.signing_secret.as_mut() {
            *secret = Self::expand_string(&re, secret);
        }
        self.oidc.issuer = Self::expand_string(&re, &self.oidc.issuer);
        if let Some(uri) = self.oidc.jwks_uri.as_mut() {
            *uri = Self::expand_string(&re, uri);
        }
    }

    /// Expand environment variables in a string
    fn expand_string(re: &Regex, value: &str) -> String {
        re.replace_all(value, |caps: &regex::Captures| {
            let var_name = &caps[1];
            let default = caps.get(2).map_or("", |m| m.as_str());
            env::var(var_name).unwrap_or_else(|_| default.to_string())
        })
        .into_owned()
    }
}

/// Scalars read as text even when YAML or figment's env parser typed them
/// as numbers or booleans (e.g. an all-digit secret or audience).
mod lenient_string {
    use serde::{Deserialize, Deserializer};

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Text(String),
        Unsigned(u64),
        Signed(i64),
        Float(f64),
        Bool(bool),
    }

    impl From<Raw> for String {
        fn from(raw: Raw) -> Self {
            match raw {
                Raw::Text(s) => s,
                Raw::Unsigned(n) => n.to_string(),
                Raw::Signed(n) => n.to_string(),
                Raw::Float(n) => n.to_string(),
                Raw::Bool(b) => b.to_string(),
            }
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<String, D::Error>
    where
        D: Deserializer<'de>,
    {
        Raw::deserialize(deserializer).map(String::from)
    }

    pub fn option<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
    where
        D: Deserializer<'de>,
    {
        Ok(Option::<Raw>::deserialize(deserializer)?.map(String::from))
    }
}

/// Repository lists given either as a sequence or a comma-separated string
/// (the latter is what environment variables naturally carry).
mod string_list {
    use serde::{Deserialize, Deserializer};

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        List(Vec<String>),
        Csv(String),
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let items = match Raw::deserialize(deserializer)? {
            Raw::List(items) => items,
            Raw::Csv(s) => s.split(',').map(str::to_string).collect(),
        };
        Ok(items
            .into_iter()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect())
    }
}

/// Custom humantime serde module for Duration
pub mod humantime_serde {
    use std::time::Duration;

    use serde::{self, Deserialize, Deserializer, Serializer};

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Secs(u64),
        Text(String),
    }

    /// Serialize Duration to human-readable string (e.g., "30s")
    ///
    /// # Errors
    ///
    /// Returns a serialization error if the serializer fails.
    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&format!("{}s", duration.as_secs()))
    }

    /// Deserialize a duration from a bare number of seconds or a string
    /// such as "30s", "5m", "100ms".
    ///
    /// # Errors
    ///
    /// Returns a deserialization error if the value cannot be parsed as a duration.
    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        match Raw::deserialize(deserializer)? {
            Raw::Secs(secs) => Ok(Duration::from_secs(secs)),
            Raw::Text(s) => parse(s.trim()).map_err(serde::de::Error::custom),
        }
    }

    fn parse(s: &str) -> Result<Duration, String> {
        let invalid = |e: std::num::ParseIntError| format!("invalid duration {s:?}: {e}");
        // "ms" must be checked before "s" and "m".
        if let Some(ms) = s.strip_suffix("ms") {
            ms.parse::<u64>().map(Duration::from_millis).map_err(invalid)
        } else if let Some(secs) = s.strip_suffix('s') {
            secs.parse::<u64>().map(Duration::from_secs).map_err(invalid)
        } else if let Some(mins) = s.strip_suffix('m') {
            mins.parse::<u64>()
                .map(|m| Duration::from_secs(m * 60))
                .map_err(invalid)
        } else if let Some(hours) = s.strip_suffix('h') {
            hours
                .parse::<u64>()
                .map(|h| Duration::from_secs(h * 3600))
                .map_err(invalid)
        } else {
            s.parse::<u64>().map(Duration::from_secs).map_err(invalid)
        }
    }
}
