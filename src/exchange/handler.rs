//! HTTP surface of the exchange pipeline.
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `POST` | `/auth/github-oidc` | Exchange a GitHub Actions OIDC token for an access token |
//! | `GET` | `/healthz` | Liveness |
//! | `GET` | `/readyz` | Readiness |

use std::sync::Arc;

use axum::{
    Json, Router,
    body::Bytes,
    extract::State,
    response::IntoResponse,
    routing::{get, post},
};
use tracing::warn;

use super::{ExchangeError, ExchangeRequest, TokenExchange, audit};

/// Build the broker's routes.
pub fn routes(exchange: Arc<TokenExchange>) -> Router {
    Router::new()
        .route("/auth/github-oidc", post(github_oidc))
        .route("/healthz", get(health))
        .route("/readyz", get(health))
        .with_state(exchange)
}

/// `POST /auth/github-oidc`
///
/// The body is decoded as JSON whatever `Content-Type` the caller sends.
async fn github_oidc(
    State(exchange): State<Arc<TokenExchange>>,
    body: Bytes,
) -> Result<impl IntoResponse, ExchangeError> {
    let request: ExchangeRequest = serde_json::from_slice(&body).map_err(|e| {
        warn!(error = %e, "Invalid request body");
        audit::emit(&audit::AuditEvent::invalid(e.to_string()));
        ExchangeError::InvalidRequest("invalid JSON in request body".to_string())
    })?;

    let response = exchange.exchange(&request.oidc_token).await?;
    Ok(Json(response))
}

async fn health() -> &'static str {
    "ok"
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{
        body::{Body, to_bytes},
        http::{Request, StatusCode, header},
    };
    use tower::ServiceExt;

    use crate::config::{PolicyConfig, TokenConfig};
    use crate::exchange::ErrorBody;
    use crate::oidc::FakeVerifier;
    use crate::policy::PolicyEngine;
    use crate::rate_limit::RateLimiter;
    use crate::token::Minter;

    fn app() -> Router {
        let exchange = TokenExchange::new(
            Arc::new(FakeVerifier::new()),
            RateLimiter::with_rate(1.0, 5).unwrap(),
            PolicyEngine::new(&PolicyConfig::default()),
            Minter::new(&TokenConfig::default(), b"secret"),
        );
        routes(Arc::new(exchange))
    }

    async fn error_body(response: axum::response::Response) -> ErrorBody {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn health_endpoints_answer_ok() {
        for path in ["/healthz", "/readyz"] {
            let response = app()
                .oneshot(Request::get(path).body(Body::empty()).unwrap())
                .await
                .unwrap();

            assert_eq!(response.status(), StatusCode::OK);
            let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
            assert_eq!(&bytes[..], b"ok");
        }
    }

    #[tokio::test]
    async fn malformed_json_is_invalid_request() {
        let request = Request::post("/auth/github-oidc")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from("{not json"))
            .unwrap();

        let response = app().oneshot(request).await.unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(error_body(response).await.error, "invalid_request");
    }

    #[tokio::test]
    async fn missing_field_is_invalid_request() {
        let request = Request::post("/auth/github-oidc")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from("{}"))
            .unwrap();

        let response = app().oneshot(request).await.unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = error_body(response).await;
        assert_eq!(body.error, "invalid_request");
        assert_eq!(body.message.as_deref(), Some("missing oidc_token field"));
    }

    #[tokio::test]
    async fn body_without_content_type_is_decoded() {
        // GIVEN: a curl-style post with no JSON content type
        let request = Request::post("/auth/github-oidc")
            .body(Body::from(r#"{"oidc_token":"abc"}"#))
            .unwrap();

        // WHEN
        let response = app().oneshot(request).await.unwrap();

        // THEN
        assert_eq!(response.status(), StatusCode::OK);
    }
}
