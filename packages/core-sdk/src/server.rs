use std::sync::Arc;

use anyhow::Result;
use axum::{
    body::{Body, Bytes},
    extract::{rejection::BytesRejection, DefaultBodyLimit, State},
    http::{
        header::{
            ACCESS_CONTROL_ALLOW_HEADERS, ACCESS_CONTROL_ALLOW_METHODS,
            ACCESS_CONTROL_ALLOW_ORIGIN, CACHE_CONTROL, CONNECTION, CONTENT_TYPE,
        },
        HeaderValue, StatusCode,
    },
    middleware,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde_json::Value;
use tower_http::trace::TraceLayer;

use crate::{config::RelayConfig, error::RelayError, llm, relay, telemetry};

/** \brief 聊天中继端点路径。 */
pub const CHAT_PATH: &str = "/dbt-chat";

const ALLOWED_HEADERS: &str = "authorization, x-client-info, apikey, content-type";
const ALLOWED_METHODS: &str = "POST, OPTIONS";
/** \brief 50 条 × 10000 字符的最坏情况（UTF-8 最多 4 字节/字符）留出余量。 */
const MAX_BODY_BYTES: usize = 4 * 1024 * 1024;

/**
 * \brief 中继共享状态：只读配置与复用的 HTTP 客户端，无可变状态。
 */
#[derive(Clone)]
pub struct RelayState {
    config: Arc<RelayConfig>,
    client: reqwest::Client,
}

impl RelayState {
    pub fn new(config: RelayConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.stream_timeout)
            .build()?;
        Ok(Self {
            config: Arc::new(config),
            client,
        })
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }
}

/**
 * \brief 构建中继路由，所有响应均附带跨域头。
 */
pub fn router(state: RelayState) -> Router {
    Router::new()
        .route(CHAT_PATH, post(chat).options(preflight))
        .route("/api/health", get(health_check))
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .layer(middleware::map_response(with_cors_headers))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/**
 * \brief 启动中继 HTTP 服务。
 * \param addr 监听地址，如 "127.0.0.1:8787"
 */
pub async fn run(addr: &str, config: RelayConfig) -> Result<()> {
    if !config.has_gateway_key() {
        tracing::warn!("no default gateway key configured; only custom-key requests will succeed");
    }
    let state = RelayState::new(config)?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("Relay listening on http://{}{}", addr, CHAT_PATH);
    axum::serve(listener, router(state)).await?;
    Ok(())
}

async fn with_cors_headers(mut response: Response) -> Response {
    let headers = response.headers_mut();
    headers.insert(ACCESS_CONTROL_ALLOW_ORIGIN, HeaderValue::from_static("*"));
    headers.insert(
        ACCESS_CONTROL_ALLOW_HEADERS,
        HeaderValue::from_static(ALLOWED_HEADERS),
    );
    headers.insert(
        ACCESS_CONTROL_ALLOW_METHODS,
        HeaderValue::from_static(ALLOWED_METHODS),
    );
    response
}

/**
 * \brief 跨域预检：空响应体 + 200。
 */
async fn preflight() -> StatusCode {
    StatusCode::OK
}

/**
 * \brief 聊天中继：POST /dbt-chat
 *
 * 校验 → 选择凭据 → 注入系统提示词转发上游 → 原样透传事件流。
 */
async fn chat(
    State(state): State<RelayState>,
    body: Result<Bytes, BytesRejection>,
) -> Result<Response, RelayError> {
    let body = body.map_err(|rejection| {
        telemetry::log_event("relay.chat", &format!("rejected: {}", rejection.body_text()));
        if rejection.status() == StatusCode::PAYLOAD_TOO_LARGE {
            RelayError::PayloadTooLarge
        } else {
            RelayError::MalformedBody
        }
    })?;
    let payload: Value = serde_json::from_slice(&body).map_err(|e| {
        telemetry::log_event("relay.chat", &format!("rejected: unparsable body: {}", e));
        RelayError::MalformedBody
    })?;

    let messages = relay::validate(&payload).map_err(|e| {
        telemetry::log_event("relay.chat", &format!("rejected: {}", e));
        e
    })?;

    let custom_key = payload.get("customApiKey").and_then(Value::as_str);
    let upstream = relay::select_upstream(&state.config, custom_key)?;

    telemetry::log_event(
        "relay.chat",
        &format!(
            "Processing chat request with {} messages ({})",
            messages.len(),
            upstream.source.label()
        ),
    );

    let resp = llm::open_completion_stream(&state.client, &upstream, &messages).await?;
    let body = Body::from_stream(relay::relay_body(resp.bytes_stream(), upstream.source));

    Ok((
        StatusCode::OK,
        [
            (CONTENT_TYPE, "text/event-stream"),
            (CACHE_CONTROL, "no-cache"),
            (CONNECTION, "keep-alive"),
        ],
        body,
    )
        .into_response())
}

/**
 * \brief 健康检查：只报告配置状态，不访问上游。
 */
async fn health_check(State(state): State<RelayState>) -> Json<Value> {
    let cfg = state.config();
    Json(serde_json::json!({
        "ok": true,
        "gateway_configured": cfg.has_gateway_key(),
        "gateway_model": cfg.gateway_model,
        "direct_model": cfg.direct_model,
    }))
}
