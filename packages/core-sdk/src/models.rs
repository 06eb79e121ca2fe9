use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

/**
 * \brief 对话角色，序列化为小写字符串。
 */
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

/**
 * \brief 会话中的一条消息，本地持久化格式。
 */
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /** \brief 唯一 ID：`<role>-<毫秒时间戳>-<随机后缀>` */
    pub id: String,
    /** \brief 角色 */
    pub role: Role,
    /** \brief 内容（助手消息在流式期间持续增长） */
    pub content: String,
    /** \brief 毫秒时间戳 */
    pub timestamp: i64,
}

impl Message {
    /**
     * \brief 以当前时间创建新消息。
     */
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        let timestamp = now_millis();
        Self {
            id: next_message_id(role, timestamp),
            role,
            content: content.into(),
            timestamp,
        }
    }

    /**
     * \brief 转为中继请求中的历史条目。
     */
    pub fn to_relay(&self) -> RelayMessage {
        RelayMessage {
            role: self.role.as_str().to_string(),
            content: self.content.clone(),
        }
    }
}

/**
 * \brief 生成消息 ID，同一毫秒内也不会重复。
 */
pub fn next_message_id(role: Role, timestamp: i64) -> String {
    let suffix = Uuid::new_v4().simple().to_string();
    format!("{}-{}-{}", role.as_str(), timestamp, &suffix[..8])
}

pub fn now_millis() -> i64 {
    (OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000) as i64
}

/**
 * \brief 中继协议中的单条消息，与 OpenAI Chat 消息格式对齐。
 */
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayMessage {
    /** \brief 角色：system/user/assistant */
    pub role: String,
    /** \brief 内容 */
    pub content: String,
}

impl RelayMessage {
    pub fn new(role: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            content: content.into(),
        }
    }
}

/**
 * \brief 客户端发往中继的请求体。
 */
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayRequest {
    pub messages: Vec<RelayMessage>,
    /** \brief 用户在本次会话中提供的自定义 API Key */
    #[serde(
        rename = "customApiKey",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub custom_api_key: Option<String>,
}

/**
 * \brief 中继错误响应体；`kind` 为稳定的机器可读标识。
 */
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
    #[serde(default)]
    pub kind: String,
}

/**
 * \brief 预置的快捷问题。
 */
#[derive(Debug, Clone, Copy)]
pub struct QuickQuestion {
    pub label: &'static str,
    pub question: &'static str,
    pub category: &'static str,
}

pub const QUICK_QUESTIONS: &[QuickQuestion] = &[
    QuickQuestion {
        label: "Difference: Seeded vs Linked",
        question: "What's the difference between Aadhaar-seeded and Aadhaar-linked bank accounts?",
        category: "Banking",
    },
    QuickQuestion {
        label: "How to Link Aadhaar",
        question: "How do I link my Aadhaar with my bank account?",
        category: "Linking",
    },
    QuickQuestion {
        label: "Check DBT Status",
        question: "How can I check if my bank account is DBT-enabled?",
        category: "Verification",
    },
    QuickQuestion {
        label: "Popular DBT Schemes",
        question: "What are the most popular DBT schemes in India?",
        category: "Schemes",
    },
    QuickQuestion {
        label: "What is NPCI Mapper",
        question: "What is NPCI mapper and why is it important for DBT?",
        category: "Banking",
    },
    QuickQuestion {
        label: "Aadhaar Basics",
        question: "What is Aadhaar and why do I need it?",
        category: "Basics",
    },
];
