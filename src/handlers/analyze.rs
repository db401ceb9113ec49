//! # Analyze Endpoint
//!
//! `POST /api/v1/analyze` — the stateless HTTP surface over the analysis
//! path: admission check against the sliding-window limiter, backend call,
//! fallback on any backend failure. The response always carries usable
//! feedback; only rate limiting (429) and insufficient input (400) are
//! surfaced as HTTP errors.

use crate::analysis::{AnalysisContext, Exchange};
use crate::error::{AppError, AppResult};
use crate::state::AppState;
use actix_web::{web, HttpRequest, HttpResponse};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalyzeRequest {
    pub code: String,

    #[serde(default)]
    pub language: Option<String>,

    #[serde(default)]
    pub question: Option<String>,

    #[serde(default)]
    pub conversation: Option<Vec<Exchange>>,

    /// What the user just said, when this is a chat turn
    #[serde(default)]
    pub current_message: Option<String>,

    #[serde(default)]
    pub is_chat: Option<bool>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalyzeResponse {
    pub feedback: String,
    pub is_fallback: bool,
}

/// Client identity for rate limiting: the peer address, honoring
/// X-Forwarded-For through actix's connection info.
fn client_id(req: &HttpRequest) -> String {
    req.connection_info()
        .realip_remote_addr()
        .unwrap_or("unknown")
        .to_string()
}

pub async fn analyze(
    req: HttpRequest,
    body: web::Json<AnalyzeRequest>,
    state: web::Data<AppState>,
) -> AppResult<HttpResponse> {
    let body = body.into_inner();
    let is_chat = body.is_chat.unwrap_or(false);
    let min_code_len = state.get_config().analysis.min_code_len;

    // Chat turns may arrive with little or no code; edit-triggered
    // analysis needs something to look at.
    if !is_chat && body.code.trim().len() < min_code_len {
        return Err(AppError::BadRequest(format!(
            "Code must be at least {} characters for analysis",
            min_code_len
        )));
    }

    let client = client_id(&req);
    let decision = state.limiter.check(&client);
    if !decision.admitted {
        debug!(client = %client, retry_after = decision.retry_after_secs, "analyze request rate limited");
        return Err(AppError::RateLimited {
            remaining: decision.remaining,
            retry_after_secs: decision.retry_after_secs,
        });
    }

    let ctx = AnalysisContext {
        code: body.code,
        language: body.language.unwrap_or_else(|| "javascript".to_string()),
        question: body.question.unwrap_or_default(),
        conversation: body.conversation.unwrap_or_default(),
        current_message: body.current_message,
        is_chat,
    };

    let (feedback, is_fallback) = match state.backend.request_feedback(&ctx).await {
        Ok(text) => (text, false),
        Err(err) => {
            warn!(client = %client, error = %err, "backend failed, serving fallback feedback");
            (state.fallback.analyze(&ctx.code), true)
        }
    };

    Ok(HttpResponse::Ok()
        .insert_header(("X-RateLimit-Remaining", decision.remaining.to_string()))
        .json(AnalyzeResponse { feedback, is_fallback }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::{BackendError, ReasoningBackend};
    use crate::audio::SimulatedSink;
    use crate::config::AppConfig;
    use actix_web::{http::StatusCode, test, App};
    use async_trait::async_trait;
    use std::sync::Arc;

    struct OkBackend;

    #[async_trait]
    impl ReasoningBackend for OkBackend {
        async fn request_feedback(&self, _ctx: &AnalysisContext) -> Result<String, BackendError> {
            Ok("solid approach".to_string())
        }
    }

    struct TimeoutBackend;

    #[async_trait]
    impl ReasoningBackend for TimeoutBackend {
        async fn request_feedback(&self, _ctx: &AnalysisContext) -> Result<String, BackendError> {
            Err(BackendError::Timeout)
        }
    }

    fn test_state(backend: Arc<dyn ReasoningBackend>) -> AppState {
        AppState::new(AppConfig::default(), backend, Arc::new(SimulatedSink))
    }

    fn analyze_body(code: &str) -> serde_json::Value {
        serde_json::json!({ "code": code, "language": "javascript", "question": "reverse a list" })
    }

    #[actix_web::test]
    async fn returns_backend_feedback_when_available() {
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(test_state(Arc::new(OkBackend))))
                .route("/api/v1/analyze", web::post().to(analyze)),
        )
        .await;

        let req = test::TestRequest::post()
            .uri("/api/v1/analyze")
            .set_json(analyze_body("for (let i=0;i<n;i++) { sum += a[i]; }"))
            .to_request();
        let response: AnalyzeResponse = test::call_and_read_body_json(&app, req).await;

        assert_eq!(response.feedback, "solid approach");
        assert!(!response.is_fallback);
    }

    #[actix_web::test]
    async fn backend_timeout_serves_fallback_with_flag() {
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(test_state(Arc::new(TimeoutBackend))))
                .route("/api/v1/analyze", web::post().to(analyze)),
        )
        .await;

        let req = test::TestRequest::post()
            .uri("/api/v1/analyze")
            .set_json(analyze_body("for (let i=0;i<n;i++) { sum += a[i]; }"))
            .to_request();
        let response: AnalyzeResponse = test::call_and_read_body_json(&app, req).await;

        assert!(!response.feedback.is_empty());
        assert!(response.is_fallback);
    }

    #[actix_web::test]
    async fn short_code_is_rejected_with_400() {
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(test_state(Arc::new(OkBackend))))
                .route("/api/v1/analyze", web::post().to(analyze)),
        )
        .await;

        let req = test::TestRequest::post()
            .uri("/api/v1/analyze")
            .set_json(analyze_body("x = 1"))
            .to_request();
        let response = test::call_service(&app, req).await;

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[actix_web::test]
    async fn short_code_is_allowed_for_chat_turns() {
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(test_state(Arc::new(OkBackend))))
                .route("/api/v1/analyze", web::post().to(analyze)),
        )
        .await;

        let req = test::TestRequest::post()
            .uri("/api/v1/analyze")
            .set_json(serde_json::json!({
                "code": "",
                "isChat": true,
                "currentMessage": "what data structure should I use?"
            }))
            .to_request();
        let response = test::call_service(&app, req).await;

        assert_eq!(response.status(), StatusCode::OK);
    }

    #[actix_web::test]
    async fn thirty_first_request_in_a_minute_gets_429() {
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(test_state(Arc::new(OkBackend))))
                .route("/api/v1/analyze", web::post().to(analyze)),
        )
        .await;

        for i in 0..30 {
            let req = test::TestRequest::post()
                .uri("/api/v1/analyze")
                .peer_addr("10.1.2.3:9999".parse().unwrap())
                .set_json(analyze_body("for (let i=0;i<n;i++) { sum += a[i]; }"))
                .to_request();
            let response = test::call_service(&app, req).await;
            assert_eq!(response.status(), StatusCode::OK, "request {} should pass", i + 1);
        }

        let req = test::TestRequest::post()
            .uri("/api/v1/analyze")
            .peer_addr("10.1.2.3:9999".parse().unwrap())
            .set_json(analyze_body("for (let i=0;i<n;i++) { sum += a[i]; }"))
            .to_request();
        let response = test::call_service(&app, req).await;

        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers().get("X-RateLimit-Remaining").unwrap(), "0");
        let reset: u64 = response
            .headers()
            .get("X-RateLimit-Reset")
            .unwrap()
            .to_str()
            .unwrap()
            .parse()
            .unwrap();
        assert!(reset > 0);
    }

    #[actix_web::test]
    async fn denied_requests_do_not_consume_quota() {
        let mut config = AppConfig::default();
        config.limits.max_requests = 1;
        let state = AppState::new(config, Arc::new(OkBackend), Arc::new(SimulatedSink));
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(state.clone()))
                .route("/api/v1/analyze", web::post().to(analyze)),
        )
        .await;

        let make_req = || {
            test::TestRequest::post()
                .uri("/api/v1/analyze")
                .peer_addr("10.9.9.9:1000".parse().unwrap())
                .set_json(analyze_body("for (let i=0;i<n;i++) { sum += a[i]; }"))
                .to_request()
        };

        assert_eq!(test::call_service(&app, make_req()).await.status(), StatusCode::OK);
        for _ in 0..5 {
            let response = test::call_service(&app, make_req()).await;
            assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
            // Denials never extend the wait: the reset still tracks the one
            // admitted timestamp, so it stays within the original window.
            let reset: u64 = response
                .headers()
                .get("X-RateLimit-Reset")
                .unwrap()
                .to_str()
                .unwrap()
                .parse()
                .unwrap();
            assert!(reset <= 60);
        }
    }
}
