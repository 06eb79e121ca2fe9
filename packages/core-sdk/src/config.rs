use std::time::Duration;

use anyhow::{Context, Result};

pub mod env {
    pub const GATEWAY_KEY: &str = "DBT_ASSIST_GATEWAY_KEY";
    pub const GATEWAY_URL: &str = "DBT_ASSIST_GATEWAY_URL";
    pub const GATEWAY_MODEL: &str = "DBT_ASSIST_GATEWAY_MODEL";
    pub const DIRECT_URL: &str = "DBT_ASSIST_DIRECT_URL";
    pub const DIRECT_MODEL: &str = "DBT_ASSIST_DIRECT_MODEL";
    pub const KEY_PREFIX: &str = "DBT_ASSIST_KEY_PREFIX";
    pub const STREAM_TIMEOUT_SECS: &str = "DBT_ASSIST_STREAM_TIMEOUT_SECS";
    pub const RELAY_URL: &str = "DBT_ASSIST_RELAY_URL";
    pub const SESSION_TOKEN: &str = "DBT_ASSIST_SESSION_TOKEN";
    pub const API_KEY: &str = "DBT_ASSIST_API_KEY";
    pub const DB: &str = "DBT_ASSIST_DB";
    pub const MAX_REBUFFER: &str = "DBT_ASSIST_MAX_REBUFFER";
    pub const CLIENT_TIMEOUT_SECS: &str = "DBT_ASSIST_CLIENT_TIMEOUT_SECS";
    pub const TELEMETRY: &str = "DBT_ASSIST_TELEMETRY";
}

pub const DEFAULT_GATEWAY_URL: &str = "https://ai.gateway.lovable.dev/v1/chat/completions";
pub const DEFAULT_GATEWAY_MODEL: &str = "google/gemini-2.5-flash";
pub const DEFAULT_DIRECT_URL: &str = "https://api.openai.com/v1/chat/completions";
pub const DEFAULT_DIRECT_MODEL: &str = "gpt-4o-mini";
pub const DEFAULT_KEY_PREFIX: &str = "sk-";
pub const DEFAULT_STREAM_TIMEOUT_SECS: u64 = 300;
pub const DEFAULT_RELAY_URL: &str = "http://127.0.0.1:8787/dbt-chat";
pub const DEFAULT_DB_PATH: &str = "dbt-assist.db";
pub const DEFAULT_MAX_REBUFFER: u32 = 3;
pub const DEFAULT_CLIENT_TIMEOUT_SECS: u64 = 300;

/**
 * \brief 中继服务配置。
 */
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /** \brief 默认凭据，缺失时每次请求均返回配置错误 */
    pub gateway_key: Option<String>,
    pub gateway_url: String,
    pub gateway_model: String,
    /** \brief 使用自定义 Key 时直连的公共端点 */
    pub direct_url: String,
    pub direct_model: String,
    /** \brief 自定义 Key 必须携带的前缀 */
    pub key_prefix: String,
    /** \brief 单次上游交换（含流式响应体）的时长上限 */
    pub stream_timeout: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            gateway_key: None,
            gateway_url: DEFAULT_GATEWAY_URL.to_string(),
            gateway_model: DEFAULT_GATEWAY_MODEL.to_string(),
            direct_url: DEFAULT_DIRECT_URL.to_string(),
            direct_model: DEFAULT_DIRECT_MODEL.to_string(),
            key_prefix: DEFAULT_KEY_PREFIX.to_string(),
            stream_timeout: Duration::from_secs(DEFAULT_STREAM_TIMEOUT_SECS),
        }
    }
}

impl RelayConfig {
    /**
     * \brief 从环境变量读取配置，未设置的项使用默认值。
     */
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();
        let timeout_secs = parse_var(env::STREAM_TIMEOUT_SECS, DEFAULT_STREAM_TIMEOUT_SECS)?;
        Ok(Self {
            gateway_key: non_empty_var(env::GATEWAY_KEY),
            gateway_url: non_empty_var(env::GATEWAY_URL).unwrap_or(defaults.gateway_url),
            gateway_model: non_empty_var(env::GATEWAY_MODEL).unwrap_or(defaults.gateway_model),
            direct_url: non_empty_var(env::DIRECT_URL).unwrap_or(defaults.direct_url),
            direct_model: non_empty_var(env::DIRECT_MODEL).unwrap_or(defaults.direct_model),
            key_prefix: non_empty_var(env::KEY_PREFIX).unwrap_or(defaults.key_prefix),
            stream_timeout: Duration::from_secs(timeout_secs),
        })
    }

    pub fn has_gateway_key(&self) -> bool {
        self.gateway_key
            .as_deref()
            .map(|k| !k.trim().is_empty())
            .unwrap_or(false)
    }
}

/**
 * \brief 客户端（会话控制器）配置。
 */
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub relay_url: String,
    pub session_token: Option<String>,
    pub custom_api_key: Option<String>,
    pub db_path: String,
    pub max_rebuffer_attempts: u32,
    /** \brief 一次中继交换（请求 + 完整响应体）的时长上限 */
    pub stream_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            relay_url: DEFAULT_RELAY_URL.to_string(),
            session_token: None,
            custom_api_key: None,
            db_path: DEFAULT_DB_PATH.to_string(),
            max_rebuffer_attempts: DEFAULT_MAX_REBUFFER,
            stream_timeout: Duration::from_secs(DEFAULT_CLIENT_TIMEOUT_SECS),
        }
    }
}

impl ClientConfig {
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();
        Ok(Self {
            relay_url: non_empty_var(env::RELAY_URL).unwrap_or(defaults.relay_url),
            session_token: non_empty_var(env::SESSION_TOKEN),
            custom_api_key: non_empty_var(env::API_KEY),
            db_path: non_empty_var(env::DB).unwrap_or(defaults.db_path),
            max_rebuffer_attempts: parse_var(env::MAX_REBUFFER, DEFAULT_MAX_REBUFFER)?,
            stream_timeout: Duration::from_secs(parse_var(
                env::CLIENT_TIMEOUT_SECS,
                DEFAULT_CLIENT_TIMEOUT_SECS,
            )?),
        })
    }
}

/**
 * \brief 遥测文件镜像开关（`DBT_ASSIST_TELEMETRY=1`）。
 */
pub fn telemetry_from_env() -> bool {
    matches!(
        non_empty_var(env::TELEMETRY).as_deref(),
        Some("1") | Some("true") | Some("on")
    )
}

fn non_empty_var(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn parse_var<T>(name: &str, default: T) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match non_empty_var(name) {
        Some(raw) => raw
            .parse::<T>()
            .with_context(|| format!("invalid value for {}: {:?}", name, raw)),
        None => Ok(default),
    }
}
