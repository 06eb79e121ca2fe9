use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use thiserror::Error;

use crate::models::ErrorBody;

pub const MAX_MESSAGES: usize = 50;
pub const MAX_CONTENT_CHARS: usize = 10_000;

/**
 * \brief 中继端点的拒绝与失败结果。
 *
 * 每个变体对应唯一的 HTTP 状态码与稳定的 `kind`；Display 文本即响应中的 `error` 字段。
 */
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RelayError {
    #[error("Invalid request: body must be a JSON object")]
    MalformedBody,

    #[error("Invalid request: body too large")]
    PayloadTooLarge,

    #[error("Invalid request: messages must be a non-empty array")]
    EmptyMessages,

    #[error("Too many messages: maximum {} messages allowed", MAX_MESSAGES)]
    TooManyMessages,

    #[error("Invalid message format: role and content required")]
    MissingField,

    #[error("Message content too long: maximum {} characters", MAX_CONTENT_CHARS)]
    ContentTooLong,

    #[error("AI service not configured")]
    NotConfigured,

    #[error("Rate limit exceeded. Please try again in a moment.")]
    RateLimited,

    #[error("AI service credits depleted. Please contact support.")]
    CreditsDepleted,

    /** \brief 上游返回未列出的状态码或无法连接；`status` 仅用于日志。 */
    #[error("AI service error")]
    Upstream { status: Option<u16> },
}

impl RelayError {
    pub fn status(&self) -> StatusCode {
        match self {
            RelayError::MalformedBody
            | RelayError::EmptyMessages
            | RelayError::TooManyMessages
            | RelayError::MissingField
            | RelayError::ContentTooLong => StatusCode::BAD_REQUEST,
            RelayError::PayloadTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            RelayError::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            RelayError::CreditsDepleted => StatusCode::PAYMENT_REQUIRED,
            RelayError::NotConfigured | RelayError::Upstream { .. } => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            RelayError::MalformedBody
            | RelayError::PayloadTooLarge
            | RelayError::EmptyMessages
            | RelayError::TooManyMessages
            | RelayError::MissingField
            | RelayError::ContentTooLong => "invalid_request",
            RelayError::NotConfigured => "not_configured",
            RelayError::RateLimited => "rate_limited",
            RelayError::CreditsDepleted => "credits_depleted",
            RelayError::Upstream { .. } => "service_error",
        }
    }

    /**
     * \brief 将上游非成功状态码映射为对调用方可见的结果。
     */
    pub fn from_upstream_status(status: u16) -> Self {
        match status {
            429 => RelayError::RateLimited,
            402 => RelayError::CreditsDepleted,
            other => RelayError::Upstream {
                status: Some(other),
            },
        }
    }

    pub fn body(&self) -> ErrorBody {
        ErrorBody {
            error: self.to_string(),
            kind: self.kind().to_string(),
        }
    }
}

impl IntoResponse for RelayError {
    fn into_response(self) -> Response {
        (self.status(), Json(self.body())).into_response()
    }
}

/**
 * \brief 会话控制器对外暴露的错误。
 */
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ChatError {
    #[error("Please sign in to use the chat")]
    NotSignedIn,

    #[error("A message is already being sent")]
    Busy,

    /** \brief 中继拒绝了请求；`message` 为其 `error` 字段 */
    #[error("{message}")]
    Relay { status: u16, message: String },

    #[error("Network error: {0}")]
    Network(String),

    #[error("Stream error: {0}")]
    Stream(String),

    #[error("Request aborted")]
    Cancelled,

    #[error("Storage error: {0}")]
    Storage(String),
}

impl ChatError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, ChatError::Cancelled)
    }
}
