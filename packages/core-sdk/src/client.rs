use std::{pin::Pin, sync::RwLock, time::Duration};

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE};

use crate::{
    error::ChatError,
    models::{ErrorBody, RelayRequest},
};

/** \brief 中继响应体的字节流。 */
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, ChatError>> + Send>>;

/**
 * \brief 发送会话到中继并取得事件流响应体。
 */
#[async_trait]
pub trait RelayTransport: Send + Sync {
    async fn open(&self, request: &RelayRequest, session_token: &str)
        -> Result<ByteStream, ChatError>;
}

/**
 * \brief 认证提供方；每次发送都重新获取令牌，不做长期缓存。
 */
#[async_trait]
pub trait SessionProvider: Send + Sync {
    async fn access_token(&self) -> Result<Option<String>, ChatError>;
}

/**
 * \brief 固定令牌（来自命令行或环境变量）。
 */
#[derive(Debug, Clone, Default)]
pub struct StaticSession {
    token: Option<String>,
}

impl StaticSession {
    pub fn new(token: Option<String>) -> Self {
        Self {
            token: token.filter(|t| !t.trim().is_empty()),
        }
    }
}

#[async_trait]
impl SessionProvider for StaticSession {
    async fn access_token(&self) -> Result<Option<String>, ChatError> {
        Ok(self.token.clone())
    }
}

/**
 * \brief 仅在本次会话内有效的自定义 API Key，从不落盘。
 */
#[derive(Debug, Default)]
pub struct SessionCredentials {
    key: RwLock<Option<String>>,
}

impl SessionCredentials {
    pub fn new(initial: Option<String>) -> Self {
        let creds = Self::default();
        if let Some(key) = initial {
            creds.set(&key);
        }
        creds
    }

    /**
     * \brief 保存去除首尾空白后的 Key；空白输入等同于清除。
     */
    pub fn set(&self, key: &str) {
        let trimmed = key.trim();
        if let Ok(mut guard) = self.key.write() {
            *guard = if trimmed.is_empty() {
                None
            } else {
                Some(trimmed.to_string())
            };
        }
    }

    pub fn clear(&self) {
        if let Ok(mut guard) = self.key.write() {
            *guard = None;
        }
    }

    pub fn get(&self) -> Option<String> {
        self.key.read().ok().and_then(|g| g.clone())
    }
}

/**
 * \brief 基于 reqwest 的中继客户端。
 *
 * `timeout` 覆盖从发起请求到读完响应体的全过程；超时在读取响应体时表现为 `ChatError::Stream`。
 */
#[derive(Debug, Clone)]
pub struct HttpRelayClient {
    client: reqwest::Client,
    url: String,
}

impl HttpRelayClient {
    pub fn new(url: impl Into<String>, timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl RelayTransport for HttpRelayClient {
    async fn open(
        &self,
        request: &RelayRequest,
        session_token: &str,
    ) -> Result<ByteStream, ChatError> {
        let resp = self
            .client
            .post(&self.url)
            .header(CONTENT_TYPE, "application/json")
            .header(AUTHORIZATION, format!("Bearer {}", session_token))
            .json(request)
            .send()
            .await
            .map_err(|e| ChatError::Network(e.to_string()))?;

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let text = resp.text().await.unwrap_or_default();
            let message = serde_json::from_str::<ErrorBody>(&text)
                .ok()
                .map(|b| b.error)
                .filter(|m| !m.is_empty())
                .unwrap_or_else(|| "Failed to get response".to_string());
            return Err(ChatError::Relay { status, message });
        }

        let stream = resp
            .bytes_stream()
            .map(|chunk| chunk.map_err(|e| ChatError::Stream(e.to_string())));
        Ok(Box::pin(stream))
    }
}
