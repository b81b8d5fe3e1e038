//! Claim decoding for GitHub Actions OIDC assertions.
//!
//! Providers are loose about JSON types: `aud` may be a string or an array,
//! `run_id` may be a string or a number. Each such field goes through a
//! small tagged union with an explicit error path instead of relying on
//! implicit coercion.

use chrono::{DateTime, Utc};
use serde_json::{Map, Number, Value};

use super::{NormalizedClaims, OidcError};

/// Claim set as decoded from the JWT payload.
pub type RawClaims = Map<String, Value>;

/// Primary claim carrying the workflow reference.
pub const WORKFLOW_REF: &str = "workflow_ref";
/// Fallback used by reusable workflows.
pub const JOB_WORKFLOW_REF: &str = "job_workflow_ref";

/// The `aud` claim in either of its permitted shapes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Audience {
    /// `"aud": "x"`
    Single(String),
    /// `"aud": ["x", "y"]`; non-string members are dropped.
    Many(Vec<String>),
}

impl Audience {
    /// Decode from the raw claim value.
    pub fn from_claim(value: Option<&Value>) -> Result<Self, OidcError> {
        match value {
            Some(Value::String(s)) => Ok(Self::Single(s.clone())),
            Some(Value::Array(items)) => Ok(Self::Many(
                items
                    .iter()
                    .filter_map(|v| v.as_str().map(str::to_string))
                    .collect(),
            )),
            _ => Err(OidcError::InvalidAudienceType),
        }
    }

    /// Whether `expected` is one of the audiences.
    #[must_use]
    pub fn contains(&self, expected: &str) -> bool {
        match self {
            Self::Single(s) => s == expected,
            Self::Many(items) => items.iter().any(|s| s == expected),
        }
    }
}

/// The `run_id` claim, string or numeric.
#[derive(Debug, Clone, PartialEq)]
pub enum RunId {
    /// Already a string.
    Text(String),
    /// JSON number.
    Numeric(Number),
}

impl RunId {
    /// Decode from the raw claim value; `None` if absent or another type.
    #[must_use]
    pub fn from_claim(value: Option<&Value>) -> Option<Self> {
        match value {
            Some(Value::String(s)) => Some(Self::Text(s.clone())),
            Some(Value::Number(n)) => Some(Self::Numeric(n.clone())),
            _ => None,
        }
    }

    /// Render as an unsigned decimal string.
    ///
    /// Integers that fit in `u64` are rendered exactly. Anything that only
    /// decodes as a float has its fractional part discarded. Negative or
    /// non-finite numbers are rejected.
    #[must_use]
    pub fn render(&self) -> Option<String> {
        match self {
            Self::Text(s) => (!s.is_empty()).then(|| s.clone()),
            Self::Numeric(n) => {
                if let Some(u) = n.as_u64() {
                    return Some(u.to_string());
                }
                let f = n.as_f64()?;
                if !f.is_finite() || f < 0.0 {
                    return None;
                }
                // Precision above 2^53 is already gone at this point; this
                // branch only sees values serde_json could not hold as u64.
                Some(format!("{:.0}", f.trunc()))
            }
        }
    }
}

/// Read a NumericDate claim (`exp`, `nbf`, `iat`) as whole seconds.
#[must_use]
pub fn numeric_date(claims: &RawClaims, name: &str) -> Option<i64> {
    let Value::Number(n) = claims.get(name)? else {
        return None;
    };
    if let Some(i) = n.as_i64() {
        return Some(i);
    }
    #[allow(clippy::cast_possible_truncation)]
    n.as_f64().filter(|f| f.is_finite()).map(|f| f.trunc() as i64)
}

fn required_string(claims: &RawClaims, name: &'static str) -> Result<String, OidcError> {
    match claims.get(name) {
        Some(Value::String(s)) if !s.is_empty() => Ok(s.clone()),
        _ => Err(OidcError::MissingClaim(name)),
    }
}

fn workflow(claims: &RawClaims) -> Result<String, OidcError> {
    let primary = claims.get(WORKFLOW_REF).and_then(Value::as_str);
    let fallback = claims.get(JOB_WORKFLOW_REF).and_then(Value::as_str);
    primary
        .or(fallback)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .ok_or(OidcError::MissingClaim(WORKFLOW_REF))
}

fn timestamp(secs: Option<i64>) -> DateTime<Utc> {
    secs.and_then(|s| DateTime::from_timestamp(s, 0))
        .unwrap_or(DateTime::UNIX_EPOCH)
}

/// Extract the CI context claims from a verified claim set.
///
/// Fails on the first missing or invalid field; never returns a partially
/// populated record.
pub fn normalize(claims: &RawClaims) -> Result<NormalizedClaims, OidcError> {
    let repository = required_string(claims, "repository")?;
    let git_ref = required_string(claims, "ref")?;
    let actor = required_string(claims, "actor")?;
    let run_id = RunId::from_claim(claims.get("run_id"))
        .and_then(|r| r.render())
        .ok_or(OidcError::MissingClaim("run_id"))?;
    let workflow = workflow(claims)?;

    Ok(NormalizedClaims {
        repository,
        git_ref,
        actor,
        run_id,
        workflow,
        issued_at: timestamp(numeric_date(claims, "iat")),
        expires_at: timestamp(numeric_date(claims, "exp")),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn claims(value: Value) -> RawClaims {
        match value {
            Value::Object(map) => map,
            _ => panic!("claims fixture must be an object"),
        }
    }

    fn full_claims() -> RawClaims {
        claims(json!({
            "repository": "octo-org/octo-repo",
            "ref": "refs/heads/main",
            "actor": "octocat",
            "run_id": "123456789",
            "workflow_ref": "octo-org/octo-repo/.github/workflows/ci.yml@refs/heads/main",
            "iat": 1_700_000_000,
            "exp": 1_700_000_600,
        }))
    }

    #[test]
    fn audience_accepts_string() {
        let aud = Audience::from_claim(Some(&json!("robohub"))).unwrap();

        assert!(aud.contains("robohub"));
        assert!(!aud.contains("other"));
    }

    #[test]
    fn audience_accepts_array_and_skips_non_strings() {
        let aud = Audience::from_claim(Some(&json!(["other", 7, "robohub"]))).unwrap();

        assert_eq!(
            aud,
            Audience::Many(vec!["other".to_string(), "robohub".to_string()])
        );
        assert!(aud.contains("robohub"));
    }

    #[test]
    fn audience_empty_array_contains_nothing() {
        let aud = Audience::from_claim(Some(&json!([]))).unwrap();

        assert!(!aud.contains("robohub"));
    }

    #[test]
    fn audience_rejects_other_types() {
        assert!(matches!(
            Audience::from_claim(Some(&json!(123))),
            Err(OidcError::InvalidAudienceType)
        ));
        assert!(matches!(
            Audience::from_claim(None),
            Err(OidcError::InvalidAudienceType)
        ));
    }

    #[test]
    fn run_id_string_passes_through() {
        let run_id = RunId::from_claim(Some(&json!("123456789"))).unwrap();

        assert_eq!(run_id.render().as_deref(), Some("123456789"));
    }

    #[test]
    fn run_id_integer_renders_decimal() {
        let run_id = RunId::from_claim(Some(&json!(123_456_789))).unwrap();

        assert_eq!(run_id.render().as_deref(), Some("123456789"));
    }

    #[test]
    fn run_id_float_discards_fraction() {
        let run_id = RunId::from_claim(Some(&json!(123_456_789.9))).unwrap();

        assert_eq!(run_id.render().as_deref(), Some("123456789"));
    }

    #[test]
    fn run_id_large_integer_keeps_exact_precision() {
        // 2^53 + 1 is not representable as f64; a float round trip would
        // render 9007199254740992.
        let payload = r#"{"run_id": 9007199254740993}"#;
        let parsed: RawClaims = serde_json::from_str(payload).unwrap();

        let run_id = RunId::from_claim(parsed.get("run_id")).unwrap();

        assert_eq!(run_id.render().as_deref(), Some("9007199254740993"));
    }

    #[test]
    fn run_id_rejects_negative_empty_and_other_types() {
        assert_eq!(RunId::from_claim(Some(&json!(-5))).unwrap().render(), None);
        assert_eq!(RunId::from_claim(Some(&json!(""))).unwrap().render(), None);
        assert!(RunId::from_claim(Some(&json!(true))).is_none());
        assert!(RunId::from_claim(None).is_none());
    }

    #[test]
    fn normalize_extracts_all_fields() {
        let normalized = normalize(&full_claims()).unwrap();

        assert_eq!(normalized.repository, "octo-org/octo-repo");
        assert_eq!(normalized.git_ref, "refs/heads/main");
        assert_eq!(normalized.actor, "octocat");
        assert_eq!(normalized.run_id, "123456789");
        assert_eq!(
            normalized.workflow,
            "octo-org/octo-repo/.github/workflows/ci.yml@refs/heads/main"
        );
        assert_eq!(normalized.issued_at.timestamp(), 1_700_000_000);
        assert_eq!(normalized.expires_at.timestamp(), 1_700_000_600);
    }

    #[test]
    fn normalize_falls_back_to_job_workflow_ref() {
        let mut raw = full_claims();
        raw.remove(WORKFLOW_REF);
        raw.insert(
            JOB_WORKFLOW_REF.to_string(),
            json!("octo-org/shared/.github/workflows/build.yml@refs/tags/v1"),
        );

        let normalized = normalize(&raw).unwrap();

        assert_eq!(
            normalized.workflow,
            "octo-org/shared/.github/workflows/build.yml@refs/tags/v1"
        );
    }

    #[test]
    fn normalize_rejects_when_both_workflow_claims_absent() {
        let mut raw = full_claims();
        raw.remove(WORKFLOW_REF);

        assert!(matches!(
            normalize(&raw),
            Err(OidcError::MissingClaim("workflow_ref"))
        ));
    }

    #[test]
    fn normalize_names_each_missing_field() {
        for field in ["repository", "ref", "actor", "run_id"] {
            let mut raw = full_claims();
            raw.remove(field);

            match normalize(&raw) {
                Err(OidcError::MissingClaim(name)) => assert_eq!(name, field),
                other => panic!("expected MissingClaim({field}), got {other:?}"),
            }
        }
    }

    #[test]
    fn normalize_rejects_empty_strings() {
        let mut raw = full_claims();
        raw.insert("actor".to_string(), json!(""));

        assert!(matches!(
            normalize(&raw),
            Err(OidcError::MissingClaim("actor"))
        ));
    }

    #[test]
    fn numeric_date_accepts_float_seconds() {
        let raw = claims(json!({"exp": 1_700_000_600.75}));

        assert_eq!(numeric_date(&raw, "exp"), Some(1_700_000_600));
        assert_eq!(numeric_date(&raw, "nbf"), None);
    }
}
