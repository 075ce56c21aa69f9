//! Actix Web HTTP server.
//!
//! Exposes OpenAI-compatible endpoints:
//! - `GET /health`
//! - `POST /v1/chat/completions`
//! - `POST /v1/completions`
//! - `GET /v1/models`
//!
//! Every response carries permissive CORS headers. Backend failures are
//! collapsed to a plain `500 Internal server error`; the detailed error only
//! goes to the log.

use crate::context::CallContext;
use crate::streaming::{self, FrameKind, StreamOptions};
use crate::translation::Translator;
use crate::types::{
    ChatCompletionRequest, CompletionRequest, CompletionResponse, ModelCard, ModelList,
};
use actix_web::http::{header, Method};
use actix_web::middleware::DefaultHeaders;
use actix_web::{web, App, HttpRequest, HttpResponse, HttpServer};
use anyhow::{Context, Result};
use futures::StreamExt;
use serde::de::DeserializeOwned;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

pub const DEFAULT_PORT: u16 = 3002;
pub const DEFAULT_MAX_BODY_BYTES: usize = 32 * 1024 * 1024;
pub const DEFAULT_MODEL_ID: &str = "khoj-chat";

/// Graceful shutdown budget, in seconds.
const SHUTDOWN_TIMEOUT_SECS: u64 = 5;

/// Fixed `created` timestamp reported for the synthetic model.
const MODEL_CREATED: i64 = 1_700_000_000;

/// Listener and response-shaping settings.
#[derive(Debug, Clone)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
    pub max_body_bytes: usize,
    pub model_id: String,
    pub stream: StreamOptions,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: DEFAULT_PORT,
            max_body_bytes: DEFAULT_MAX_BODY_BYTES,
            model_id: DEFAULT_MODEL_ID.to_string(),
            stream: StreamOptions::default(),
        }
    }
}

pub struct AppState {
    pub translator: Arc<Translator>,
    pub stream: StreamOptions,
    pub model_id: String,
}

impl AppState {
    pub fn new(translator: Arc<Translator>, settings: &ServerSettings) -> Self {
        Self {
            translator,
            stream: settings.stream,
            model_id: settings.model_id.clone(),
        }
    }
}

/// CORS headers added to every response.
pub fn cors_headers() -> DefaultHeaders {
    DefaultHeaders::new()
        .add((header::ACCESS_CONTROL_ALLOW_ORIGIN, "*"))
        .add((
            header::ACCESS_CONTROL_ALLOW_METHODS,
            "POST, GET, OPTIONS, PUT, DELETE",
        ))
        .add((
            header::ACCESS_CONTROL_ALLOW_HEADERS,
            "Content-Type, Authorization, X-Requested-With",
        ))
        .add((
            header::ACCESS_CONTROL_EXPOSE_HEADERS,
            "Content-Length, Content-Type",
        ))
        .add((header::ACCESS_CONTROL_MAX_AGE, "86400"))
}

/// Route table, shared by the real server and the handler tests.
pub fn routes(cfg: &mut web::ServiceConfig) {
    cfg.route("/health", web::get().to(health_check))
        .service(
            web::resource("/v1/chat/completions")
                .route(web::post().to(handle_chat_completions))
                .route(web::method(Method::OPTIONS).to(preflight)),
        )
        .service(
            web::resource("/v1/completions")
                .route(web::post().to(handle_completions))
                .route(web::method(Method::OPTIONS).to(preflight)),
        )
        .service(
            web::resource("/v1/models")
                .route(web::get().to(list_models))
                .route(web::method(Method::OPTIONS).to(preflight)),
        );
}

/// A running server. Dropping the handle does not stop the server.
pub struct ServerHandle {
    addr: SocketAddr,
    handle: actix_web::dev::ServerHandle,
    task: JoinHandle<std::io::Result<()>>,
}

impl ServerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Graceful stop: in-flight requests get up to 5 seconds to finish.
    pub async fn stop(self) -> Result<()> {
        info!(addr = %self.addr, "stopping server");
        self.handle.stop(true).await;
        self.task
            .await
            .context("server task failed")?
            .context("server error")
    }
}

/// Bind and start serving in the background.
pub fn start(state: AppState, settings: &ServerSettings) -> Result<ServerHandle> {
    let state = web::Data::new(state);
    let max_body_bytes = settings.max_body_bytes;

    let server = HttpServer::new(move || {
        App::new()
            .app_data(state.clone())
            .app_data(web::PayloadConfig::new(max_body_bytes))
            .wrap(cors_headers())
            .configure(routes)
    })
    .shutdown_timeout(SHUTDOWN_TIMEOUT_SECS)
    .disable_signals()
    .bind((settings.host.as_str(), settings.port))
    .with_context(|| format!("failed to bind {}:{}", settings.host, settings.port))?;

    let addr = server
        .addrs()
        .first()
        .copied()
        .context("server bound no address")?;

    let server = server.run();
    let handle = server.handle();
    let task = tokio::spawn(server);

    info!(addr = %addr, "khoj-proxy listening");
    Ok(ServerHandle { addr, handle, task })
}

async fn health_check() -> HttpResponse {
    HttpResponse::Ok().json(serde_json::json!({"status": "healthy"}))
}

async fn preflight() -> HttpResponse {
    HttpResponse::Ok().finish()
}

fn parse_body<T: DeserializeOwned>(body: &[u8]) -> Result<T, HttpResponse> {
    serde_json::from_slice(body).map_err(|e| {
        error!(error = %e, "error parsing JSON");
        HttpResponse::BadRequest()
            .content_type("text/plain; charset=utf-8")
            .body("Invalid JSON")
    })
}

fn internal_error() -> HttpResponse {
    HttpResponse::InternalServerError()
        .content_type("text/plain; charset=utf-8")
        .body("Internal server error")
}

fn stream_response(state: &AppState, request: ChatCompletionRequest, kind: FrameKind) -> HttpResponse {
    let frames = streaming::stream_completion(
        state.translator.clone(),
        request,
        kind,
        state.stream,
        CallContext::new(),
    )
    .map(|frame| Ok::<_, actix_web::Error>(web::Bytes::from(frame)));

    HttpResponse::Ok()
        .content_type("text/event-stream")
        .insert_header((header::CACHE_CONTROL, "no-cache"))
        .insert_header((header::CONNECTION, "keep-alive"))
        .streaming(frames)
}

async fn handle_chat_completions(
    state: web::Data<AppState>,
    req: HttpRequest,
    body: web::Bytes,
) -> HttpResponse {
    let user_agent = req
        .headers()
        .get(header::USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    debug!(user_agent, body_len = body.len(), "starting chat completion request");

    let request: ChatCompletionRequest = match parse_body(&body) {
        Ok(r) => r,
        Err(resp) => return resp,
    };

    if request.stream {
        return stream_response(&state, request, FrameKind::Chat);
    }

    let ctx = CallContext::new();
    let _guard = ctx.drop_guard();
    match state.translator.complete(&ctx, &request).await {
        Ok(resp) => HttpResponse::Ok().json(resp),
        Err(e) => {
            error!(error = %e, "error handling chat completion");
            internal_error()
        }
    }
}

async fn handle_completions(state: web::Data<AppState>, body: web::Bytes) -> HttpResponse {
    let request: CompletionRequest = match parse_body(&body) {
        Ok(r) => r,
        Err(resp) => return resp,
    };
    let request = request.into_chat_request();

    if request.stream {
        return stream_response(&state, request, FrameKind::Text);
    }

    let ctx = CallContext::new();
    let _guard = ctx.drop_guard();
    match state.translator.complete(&ctx, &request).await {
        Ok(resp) => HttpResponse::Ok().json(CompletionResponse::from(resp)),
        Err(e) => {
            error!(error = %e, "error handling completion");
            internal_error()
        }
    }
}

async fn list_models(state: web::Data<AppState>) -> HttpResponse {
    HttpResponse::Ok().json(ModelList {
        object: "list".to_string(),
        data: vec![ModelCard {
            id: state.model_id.clone(),
            object: "model".to_string(),
            created: MODEL_CREATED,
            owned_by: "khoj".to_string(),
        }],
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conversation::testing::{memory_manager, MockKhoj};
    use crate::error::UpstreamError;
    use crate::translation::{estimate_usage, TranslatorOptions};
    use actix_web::http::StatusCode;
    use actix_web::test;
    use serde_json::Value;
    use std::time::Duration;
    use tempfile::TempDir;

    fn app_state(api: Arc<MockKhoj>) -> (web::Data<AppState>, TempDir) {
        let (manager, dir) = memory_manager(api.clone(), Some("abc"));
        let translator = Arc::new(Translator::new(api, manager, TranslatorOptions::default()));
        let settings = ServerSettings {
            stream: StreamOptions {
                chunk_size: 50,
                frame_delay: Duration::ZERO,
            },
            ..Default::default()
        };
        (web::Data::new(AppState::new(translator, &settings)), dir)
    }

    macro_rules! app {
        ($state:expr) => {
            test::init_service(
                App::new()
                    .app_data($state)
                    .app_data(web::PayloadConfig::new(DEFAULT_MAX_BODY_BYTES))
                    .wrap(cors_headers())
                    .configure(routes),
            )
            .await
        };
    }

    fn post(uri: &str, body: &str) -> test::TestRequest {
        test::TestRequest::post()
            .uri(uri)
            .insert_header((header::CONTENT_TYPE, "application/json"))
            .set_payload(body.to_string())
    }

    #[actix_web::test]
    async fn health_reports_healthy_with_cors() {
        let (state, _dir) = app_state(Arc::new(MockKhoj::answering("")));
        let app = app!(state);

        let resp = test::call_service(&app, test::TestRequest::get().uri("/health").to_request()).await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(
            resp.headers().get(header::ACCESS_CONTROL_ALLOW_ORIGIN).unwrap(),
            "*"
        );
        let body: Value = test::read_body_json(resp).await;
        assert_eq!(body, serde_json::json!({"status": "healthy"}));
    }

    #[actix_web::test]
    async fn options_short_circuits() {
        let api = Arc::new(MockKhoj::answering("unused"));
        let (state, _dir) = app_state(api.clone());
        let app = app!(state);

        let req = test::TestRequest::default()
            .method(Method::OPTIONS)
            .uri("/v1/chat/completions")
            .to_request();
        let resp = test::call_service(&app, req).await;

        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(
            resp.headers().get(header::ACCESS_CONTROL_MAX_AGE).unwrap(),
            "86400"
        );
        assert_eq!(api.chat_calls(), 0);
    }

    #[actix_web::test]
    async fn malformed_json_is_bad_request() {
        let api = Arc::new(MockKhoj::answering("unused"));
        let (state, _dir) = app_state(api.clone());
        let app = app!(state);

        let resp = test::call_service(&app, post("/v1/chat/completions", "{not json").to_request()).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert_eq!(test::read_body(resp).await, "Invalid JSON");

        let resp = test::call_service(
            &app,
            post(
                "/v1/chat/completions",
                r#"{"model":"m","messages":[{"role":"wizard","content":"hi"}]}"#,
            ).to_request(),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert_eq!(api.chat_calls(), 0);
    }

    #[actix_web::test]
    async fn chat_completion_round_trip() {
        let api = Arc::new(MockKhoj::answering("hello"));
        let (state, _dir) = app_state(api.clone());
        let app = app!(state);

        let resp = test::call_service(
            &app,
            post(
                "/v1/chat/completions",
                r#"{"model":"khoj-chat","messages":[{"role":"user","content":"hi"}]}"#,
            ).to_request(),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::OK);

        let body: Value = test::read_body_json(resp).await;
        assert_eq!(body["object"], "chat.completion");
        assert_eq!(body["choices"][0]["message"]["role"], "assistant");
        assert_eq!(body["choices"][0]["message"]["content"], "hello");
        assert_eq!(body["choices"][0]["finish_reason"], "stop");
        let usage = estimate_usage("user: hi\n", "hello");
        assert_eq!(body["usage"]["total_tokens"], usage.total_tokens);
        assert_eq!(api.last_request().unwrap().conversation_id, "abc");
    }

    #[actix_web::test]
    async fn upstream_failure_is_generic_500() {
        let api = Arc::new(MockKhoj::failing(|| UpstreamError::ClientStatus {
            status: 401,
            body: "bad key".to_string(),
        }));
        let (state, _dir) = app_state(api);
        let app = app!(state);

        let resp = test::call_service(
            &app,
            post(
                "/v1/chat/completions",
                r#"{"model":"m","messages":[{"role":"user","content":"hi"}]}"#,
            ).to_request(),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(test::read_body(resp).await, "Internal server error");
    }

    #[actix_web::test]
    async fn streaming_chat_emits_sse_frames() {
        let (state, _dir) = app_state(Arc::new(MockKhoj::answering(&"z".repeat(60))));
        let app = app!(state);

        let resp = test::call_service(
            &app,
            post(
                "/v1/chat/completions",
                r#"{"model":"m","stream":true,"messages":[{"role":"user","content":"hi"}]}"#,
            ).to_request(),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(
            resp.headers().get(header::CONTENT_TYPE).unwrap(),
            "text/event-stream"
        );
        assert_eq!(resp.headers().get(header::CACHE_CONTROL).unwrap(), "no-cache");

        let body = test::read_body(resp).await;
        let text = std::str::from_utf8(&body).unwrap();
        let frames: Vec<&str> = text.split_terminator("\n\n").collect();
        assert_eq!(frames.len(), 4);
        assert!(frames[0].contains("chat.completion.chunk"));
        assert!(frames[2].contains(r#""finish_reason":"stop""#));
        assert_eq!(frames[3], "data: [DONE]");
    }

    #[actix_web::test]
    async fn streaming_failure_sends_error_frame_without_done() {
        let api = Arc::new(MockKhoj::failing(|| UpstreamError::Cancelled));
        let (state, _dir) = app_state(api);
        let app = app!(state);

        let resp = test::call_service(
            &app,
            post(
                "/v1/chat/completions",
                r#"{"model":"m","stream":true,"messages":[{"role":"user","content":"hi"}]}"#,
            ).to_request(),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::OK);

        let body = test::read_body(resp).await;
        let text = std::str::from_utf8(&body).unwrap();
        assert!(text.contains(r#""type":"api_error""#));
        assert!(!text.contains("[DONE]"));
    }

    #[actix_web::test]
    async fn legacy_completion_is_rewrapped() {
        let api = Arc::new(MockKhoj::answering("42"));
        let (state, _dir) = app_state(api.clone());
        let app = app!(state);

        let resp = test::call_service(
            &app,
            post("/v1/completions", r#"{"model":"m","prompt":"answer?"}"#).to_request(),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::OK);

        let body: Value = test::read_body_json(resp).await;
        assert_eq!(body["object"], "text_completion");
        assert!(body["id"].as_str().unwrap().starts_with("cmpl-"));
        assert_eq!(body["choices"][0]["text"], "42");
        assert_eq!(api.last_request().unwrap().q, "user: answer?\n");
    }

    #[actix_web::test]
    async fn models_lists_single_synthetic_model() {
        let (state, _dir) = app_state(Arc::new(MockKhoj::answering("")));
        let app = app!(state);

        let resp =
            test::call_service(&app, test::TestRequest::get().uri("/v1/models").to_request()).await;
        let body: ModelList = test::read_body_json(resp).await;

        assert_eq!(body.object, "list");
        assert_eq!(body.data.len(), 1);
        assert_eq!(body.data[0].id, DEFAULT_MODEL_ID);
    }
}
