use reqwest::header::{AUTHORIZATION, CONTENT_TYPE};
use serde_json::{json, Value};

use crate::{error::RelayError, models::RelayMessage, telemetry};

/**
 * \brief 固定系统提示词，用户不可编辑，总是作为第一条消息发送。
 */
pub const SYSTEM_PROMPT: &str = r#"You are an expert AI assistant specializing in India's Direct Benefit Transfer (DBT) system and Aadhaar linking processes. Your role is to help users understand:

1. **Aadhaar Basics**: What Aadhaar is, its purpose, and how to obtain one
2. **DBT System**: How Direct Benefit Transfer works and its benefits
3. **Aadhaar-Bank Linking**: The critical difference between:
   - Aadhaar-seeded accounts (Aadhaar stored in bank records but not verified)
   - Aadhaar-linked accounts (Verified through NPCI mapper and DBT-enabled)
4. **Government Schemes**: Popular DBT schemes like PAHAL, PM-KISAN, MGNREGA, scholarships, and pensions
5. **Verification Process**: How to check DBT status and link Aadhaar properly
6. **Troubleshooting**: Common issues and solutions for Aadhaar linking problems

**Communication Style:**
- Keep answers clear, concise, and easy to understand
- Use simple language avoiding technical jargon when possible
- Provide step-by-step instructions when explaining processes
- Be empathetic and patient, as many users may be unfamiliar with these systems
- When users ask about specific schemes, provide relevant details about eligibility and benefits
- If you don't know something specific, acknowledge it honestly

**Key Points to Remember:**
- Always emphasize the difference between "seeded" and "linked" Aadhaar accounts
- Encourage users to verify their DBT status through official channels
- Remind users that only NPCI mapper-verified accounts can receive DBT benefits
- Provide official sources and verification methods when discussing important processes"#;

/**
 * \brief 凭据来源：用户自定义 Key 直连，或默认 Key 走网关。
 */
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialSource {
    Custom,
    Gateway,
}

impl CredentialSource {
    pub fn label(&self) -> &'static str {
        match self {
            CredentialSource::Custom => "custom key",
            CredentialSource::Gateway => "gateway",
        }
    }
}

/**
 * \brief 一次转发所选定的上游端点。
 */
#[derive(Clone, PartialEq, Eq)]
pub struct Upstream {
    pub url: String,
    pub api_key: String,
    pub model: String,
    pub source: CredentialSource,
}

impl std::fmt::Debug for Upstream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Upstream")
            .field("url", &self.url)
            .field("api_key", &"<redacted>")
            .field("model", &self.model)
            .field("source", &self.source)
            .finish()
    }
}

/**
 * \brief 构造上游请求体：系统提示词 + 原样顺序的历史消息，开启流式。
 */
pub fn completion_payload(model: &str, messages: &[RelayMessage]) -> Value {
    let mut payload_messages = Vec::with_capacity(messages.len() + 1);
    payload_messages.push(json!({"role": "system", "content": SYSTEM_PROMPT}));
    for msg in messages {
        payload_messages.push(json!({"role": msg.role, "content": msg.content}));
    }
    json!({
        "model": model,
        "messages": payload_messages,
        "stream": true
    })
}

/**
 * \brief 向上游发起流式补全请求，仅返回成功的响应（响应体未读取）。
 *
 * 非成功状态码按 429/402/其它 映射；上游错误正文只写日志，不返回给调用方。
 */
pub async fn open_completion_stream(
    client: &reqwest::Client,
    upstream: &Upstream,
    messages: &[RelayMessage],
) -> Result<reqwest::Response, RelayError> {
    let body = completion_payload(&upstream.model, messages);

    let resp = client
        .post(&upstream.url)
        .header(CONTENT_TYPE, "application/json")
        .header(AUTHORIZATION, format!("Bearer {}", upstream.api_key))
        .json(&body)
        .send()
        .await
        .map_err(|e| {
            telemetry::log_error(
                "relay.upstream",
                &format!("request to {} failed: {}", upstream.url, e),
            );
            RelayError::Upstream { status: None }
        })?;

    if !resp.status().is_success() {
        let status = resp.status();
        let text = resp.text().await.unwrap_or_default();
        telemetry::log_error(
            "relay.upstream",
            &format!("AI gateway error: {} -> {}", status, text),
        );
        return Err(RelayError::from_upstream_status(status.as_u16()));
    }

    Ok(resp)
}
