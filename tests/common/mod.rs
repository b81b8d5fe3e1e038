//! Shared fixtures: a local JWKS endpoint and helpers to sign assertions
//! with the fixture RSA keys.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use axum::{Json, Router, extract::State, http::StatusCode, response::IntoResponse, routing::get};
use chrono::Utc;
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use parking_lot::RwLock;
use serde_json::{Value, json};

use ci_token_broker::config::OidcConfig;

pub const ISSUER: &str = "https://token.actions.githubusercontent.com";
pub const AUDIENCE: &str = "robohub";

/// Modulus of `fixtures/idp_signing_key.pem`.
pub const IDP_MODULUS: &str = "r0ZldsE3QQ3WrCNIL8N_voVGV3yjRWbto1mNiW8yyfNvHjuecEBdQmNeW5OB1a1R3Uy-uDHBBTIvJ0XBmDj9r2udgDgiTnl6K9Em1jZUAf0ZXQIU0qfJaQxM7tNnXbnU923_Gr5a__HuvHwOEnl3ghRc_AJYl2Mt0fM1WtYuEhJieriD_kQRyzfWzR6iGeVxFDtRXgU_3Yu_IFItt_ZNcCAZq9MaEVhc4QVsE5fOkw4a-_s4PthnerG5GmpTCWT8iwsbvIAVYSCbc95LK-Y6IzmIYaY85EWlvuajWcq5JX-rAN8ngsBAASlMJCYNguqwItSc1qNid-YOVw8001RF8Q";
/// Modulus of `fixtures/rogue_signing_key.pem`.
pub const ROGUE_MODULUS: &str = "y3BFma1PZTRVibyGZuUfdPX5Xjr358d4NUEF7yWk7ENDHSnepkOeNgNYpdAUXJPxTiyPTC59YIaR00JZxs1xcRkeajXGMmZty59JZEsp3RmXk49yFsAYjufw9MqJWRAmRDhAF5DY9WZRA_26bgsUTqHymbFPA-iDyn3GelXnwF-ZLdhOIFgV8Z-uYyqPady2CPeXi_dzY6KiFuHKS92sw5s-bboSf1uMN9I35AkKnRmo-e7mISjnUgLfa9IK_3gJDT7UQUFUsZrwUBOr_hvalZ3wnzkMk_whCNvWrM0ROGizhPF-igLNM8gt79vUg6PfJbpobvv2SfrzfoPWfbJDxQ";
pub const EXPONENT: &str = "AQAB";

pub fn idp_key() -> EncodingKey {
    EncodingKey::from_rsa_pem(include_bytes!("../fixtures/idp_signing_key.pem")).unwrap()
}

pub fn rogue_key() -> EncodingKey {
    EncodingKey::from_rsa_pem(include_bytes!("../fixtures/rogue_signing_key.pem")).unwrap()
}

/// One RSA JWK entry.
pub fn jwk(kid: &str, modulus: &str) -> Value {
    json!({"kty": "RSA", "use": "sig", "alg": "RS256", "kid": kid, "n": modulus, "e": EXPONENT})
}

/// JWKS document with the identity provider key under `kid`.
pub fn jwks(kid: &str) -> Value {
    json!({"keys": [jwk(kid, IDP_MODULUS)]})
}

/// Claim set GitHub Actions would issue for a run on `main`.
pub fn github_claims() -> Value {
    let now = Utc::now().timestamp();
    json!({
        "iss": ISSUER,
        "aud": AUDIENCE,
        "iat": now,
        "nbf": now,
        "exp": now + 300,
        "sub": "repo:octo-org/octo-repo:ref:refs/heads/main",
        "repository": "octo-org/octo-repo",
        "ref": "refs/heads/main",
        "actor": "octocat",
        "run_id": "4242",
        "workflow_ref": "octo-org/octo-repo/.github/workflows/release.yml@refs/heads/main",
    })
}

/// Sign `claims` as RS256 with an optional `kid`.
pub fn sign(kid: Option<&str>, claims: &Value, key: &EncodingKey) -> String {
    sign_with(Algorithm::RS256, kid, claims, key)
}

pub fn sign_with(alg: Algorithm, kid: Option<&str>, claims: &Value, key: &EncodingKey) -> String {
    let mut header = Header::new(alg);
    header.kid = kid.map(str::to_string);
    jsonwebtoken::encode(&header, claims, key).unwrap()
}

/// Verifier configuration pointing at a local JWKS endpoint.
pub fn oidc_config(jwks_uri: &str) -> OidcConfig {
    OidcConfig {
        issuer: ISSUER.to_string(),
        audience: AUDIENCE.to_string(),
        jwks_uri: Some(jwks_uri.to_string()),
        clock_skew: Duration::from_secs(60),
        jwks_ttl: Duration::from_secs(3600),
        fetch_timeout: Duration::from_secs(5),
    }
}

#[derive(Clone)]
struct JwksState {
    document: Arc<RwLock<Value>>,
    fetches: Arc<AtomicUsize>,
    failing: Arc<AtomicBool>,
}

/// JWKS endpoint on an ephemeral localhost port that counts fetches.
pub struct JwksServer {
    pub uri: String,
    state: JwksState,
}

impl JwksServer {
    pub async fn start(document: Value) -> Self {
        let state = JwksState {
            document: Arc::new(RwLock::new(document)),
            fetches: Arc::new(AtomicUsize::new(0)),
            failing: Arc::new(AtomicBool::new(false)),
        };

        let app = Router::new()
            .route("/.well-known/jwks", get(serve_jwks))
            .with_state(state.clone());

        let listener = tokio::net::TcpListener::bind(SocketAddr::from(([127, 0, 0, 1], 0)))
            .await
            .unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            uri: format!("http://{addr}/.well-known/jwks"),
            state,
        }
    }

    /// Number of JWKS requests served so far.
    pub fn fetches(&self) -> usize {
        self.state.fetches.load(Ordering::SeqCst)
    }

    /// Replace the published key set.
    pub fn publish(&self, document: Value) {
        *self.state.document.write() = document;
    }

    /// Answer subsequent requests with `500`.
    pub fn fail(&self, failing: bool) {
        self.state.failing.store(failing, Ordering::SeqCst);
    }
}

async fn serve_jwks(State(state): State<JwksState>) -> impl IntoResponse {
    state.fetches.fetch_add(1, Ordering::SeqCst);
    if state.failing.load(Ordering::SeqCst) {
        return (StatusCode::INTERNAL_SERVER_ERROR, Json(json!({"error": "boom"})));
    }
    let document = state.document.read().clone();
    (StatusCode::OK, Json(document))
}
