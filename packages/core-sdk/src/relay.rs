use async_stream::try_stream;
use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use serde_json::Value;

use crate::{
    config::RelayConfig,
    error::{RelayError, MAX_CONTENT_CHARS, MAX_MESSAGES},
    llm::{CredentialSource, Upstream},
    models::RelayMessage,
    telemetry,
};

/**
 * \brief 校验请求体并提取消息列表；首个失败的检查决定拒绝原因。
 *
 * 检查顺序：非空数组 → 数量上限 → 逐条检查 role/content 存在 → 逐条检查长度。
 * 只转发 role 与 content 两个字段。
 */
pub fn validate(body: &Value) -> Result<Vec<RelayMessage>, RelayError> {
    let items = match body.get("messages").and_then(Value::as_array) {
        Some(items) if !items.is_empty() => items,
        _ => return Err(RelayError::EmptyMessages),
    };
    if items.len() > MAX_MESSAGES {
        return Err(RelayError::TooManyMessages);
    }

    let mut messages = Vec::with_capacity(items.len());
    for item in items {
        let role = non_empty_str(item, "role");
        let content = non_empty_str(item, "content");
        let (Some(role), Some(content)) = (role, content) else {
            return Err(RelayError::MissingField);
        };
        if content.chars().count() > MAX_CONTENT_CHARS {
            return Err(RelayError::ContentTooLong);
        }
        messages.push(RelayMessage::new(role, content));
    }
    Ok(messages)
}

fn non_empty_str<'a>(item: &'a Value, field: &str) -> Option<&'a str> {
    item.get(field)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
}

/**
 * \brief 选择上游：带前缀的自定义 Key 直连公共端点，否则使用默认 Key 走网关。
 */
pub fn select_upstream(
    config: &RelayConfig,
    custom_key: Option<&str>,
) -> Result<Upstream, RelayError> {
    let custom = custom_key
        .map(str::trim)
        .filter(|k| k.starts_with(config.key_prefix.as_str()));
    if let Some(key) = custom {
        return Ok(Upstream {
            url: config.direct_url.clone(),
            api_key: key.to_string(),
            model: config.direct_model.clone(),
            source: CredentialSource::Custom,
        });
    }

    match config
        .gateway_key
        .as_deref()
        .map(str::trim)
        .filter(|k| !k.is_empty())
    {
        Some(key) => Ok(Upstream {
            url: config.gateway_url.clone(),
            api_key: key.to_string(),
            model: config.gateway_model.clone(),
            source: CredentialSource::Gateway,
        }),
        None => {
            telemetry::log_error("relay.config", "AI service not configured");
            Err(RelayError::NotConfigured)
        }
    }
}

/**
 * \brief 上游响应体的透传流：逐块原样转发，不缓冲、不改写，只统计字节数。
 */
pub fn relay_body<S>(
    upstream: S,
    source: CredentialSource,
) -> impl Stream<Item = Result<Bytes, reqwest::Error>> + Send + 'static
where
    S: Stream<Item = Result<Bytes, reqwest::Error>> + Send + 'static,
{
    try_stream! {
        let mut upstream = Box::pin(upstream);
        let mut total = 0usize;
        while let Some(chunk) = upstream.next().await {
            let chunk = chunk.map_err(|e| {
                telemetry::log_error(
                    "relay.stream",
                    &format!("upstream stream aborted after {} bytes: {}", total, e),
                );
                e
            })?;
            total += chunk.len();
            yield chunk;
        }
        tracing::debug!(bytes = total, source = source.label(), "upstream stream finished");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn msg(role: &str, content: &str) -> Value {
        json!({"role": role, "content": content})
    }

    fn gateway_config() -> RelayConfig {
        RelayConfig {
            gateway_key: Some("gw-key".to_string()),
            ..RelayConfig::default()
        }
    }

    #[test]
    fn test_validate_accepts_and_strips_extra_fields() {
        let body = json!({
            "messages": [
                {"role": "user", "content": "hi", "id": "user-1", "timestamp": 1},
                msg("assistant", "hello"),
            ]
        });
        let out = validate(&body).expect("valid");
        assert_eq!(
            out,
            vec![
                RelayMessage::new("user", "hi"),
                RelayMessage::new("assistant", "hello")
            ]
        );
    }

    #[test]
    fn test_validate_rejects_missing_or_empty_messages() {
        assert_eq!(validate(&json!({})), Err(RelayError::EmptyMessages));
        assert_eq!(
            validate(&json!({"messages": []})),
            Err(RelayError::EmptyMessages)
        );
        assert_eq!(
            validate(&json!({"messages": "hi"})),
            Err(RelayError::EmptyMessages)
        );
        assert_eq!(validate(&json!([1, 2])), Err(RelayError::EmptyMessages));
    }

    #[test]
    fn test_validate_message_count_limit() {
        let fifty: Vec<Value> = (0..50).map(|i| msg("user", &format!("m{}", i))).collect();
        assert_eq!(validate(&json!({ "messages": fifty })).map(|m| m.len()), Ok(50));

        let fifty_one: Vec<Value> = (0..51).map(|i| msg("user", &format!("m{}", i))).collect();
        assert_eq!(
            validate(&json!({ "messages": fifty_one })),
            Err(RelayError::TooManyMessages)
        );
    }

    #[test]
    fn test_validate_missing_fields() {
        assert_eq!(
            validate(&json!({"messages": [{"role": "user"}]})),
            Err(RelayError::MissingField)
        );
        assert_eq!(
            validate(&json!({"messages": [{"content": "hi"}]})),
            Err(RelayError::MissingField)
        );
        assert_eq!(
            validate(&json!({"messages": [msg("user", "")]})),
            Err(RelayError::MissingField)
        );
        assert_eq!(
            validate(&json!({"messages": [{"role": "user", "content": 42}]})),
            Err(RelayError::MissingField)
        );
    }

    #[test]
    fn test_validate_content_length_boundary() {
        let exact = "a".repeat(MAX_CONTENT_CHARS);
        assert!(validate(&json!({"messages": [msg("user", &exact)]})).is_ok());

        let over = "a".repeat(MAX_CONTENT_CHARS + 1);
        assert_eq!(
            validate(&json!({"messages": [msg("user", &over)]})),
            Err(RelayError::ContentTooLong)
        );

        // 按字符计数，而非字节
        let wide = "आ".repeat(MAX_CONTENT_CHARS);
        assert!(validate(&json!({"messages": [msg("user", &wide)]})).is_ok());
    }

    #[test]
    fn test_validate_first_failing_message_wins() {
        let over = "a".repeat(MAX_CONTENT_CHARS + 1);
        let body = json!({"messages": [msg("user", &over), {"role": "user"}]});
        assert_eq!(validate(&body), Err(RelayError::ContentTooLong));
    }

    #[test]
    fn test_select_custom_key_goes_direct() {
        let cfg = gateway_config();
        let up = select_upstream(&cfg, Some("  sk-user-key ")).expect("custom");
        assert_eq!(up.source, CredentialSource::Custom);
        assert_eq!(up.api_key, "sk-user-key");
        assert_eq!(up.url, cfg.direct_url);
        assert_eq!(up.model, cfg.direct_model);
    }

    #[test]
    fn test_select_unprefixed_custom_key_falls_back_to_gateway() {
        let cfg = gateway_config();
        let up = select_upstream(&cfg, Some("not-a-key")).expect("gateway");
        assert_eq!(up.source, CredentialSource::Gateway);
        assert_eq!(up.api_key, "gw-key");
        assert_eq!(up.url, cfg.gateway_url);
    }

    #[test]
    fn test_select_without_any_key_is_config_error() {
        let cfg = RelayConfig::default();
        assert_eq!(select_upstream(&cfg, None), Err(RelayError::NotConfigured));
        assert_eq!(
            select_upstream(&cfg, Some("bogus")),
            Err(RelayError::NotConfigured)
        );
        // 自定义 Key 可在无默认 Key 时单独使用
        assert!(select_upstream(&cfg, Some("sk-x")).is_ok());
    }

    #[tokio::test]
    async fn test_relay_body_passes_bytes_through_unchanged() {
        let chunks = vec![
            Ok(Bytes::from_static(b"data: {\"choices\":[{\"delta\":")),
            Ok(Bytes::from_static(b"{\"content\":\"Hi\"}}]}\n\n")),
            Ok(Bytes::from_static(b"data: [DONE]\n\n")),
        ];
        let expected: Vec<Bytes> = chunks
            .iter()
            .map(|c: &Result<Bytes, reqwest::Error>| c.as_ref().expect("ok").clone())
            .collect();
        let out: Vec<Bytes> = relay_body(futures_util::stream::iter(chunks), CredentialSource::Gateway)
            .map(|c| c.expect("chunk"))
            .collect()
            .await;
        assert_eq!(out, expected);
    }
}
