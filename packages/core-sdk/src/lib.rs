pub mod client;
pub mod config;
pub mod db;
pub mod error;
pub mod llm;
pub mod models;
pub mod relay;
pub mod server;
pub mod session;
pub mod sse;
pub mod telemetry;

/**
 * \brief SDK 预导入集合，方便外部引用常用模块。
 */
pub mod prelude {
    pub use crate::client::{HttpRelayClient, SessionCredentials, StaticSession};
    pub use crate::config::{ClientConfig, RelayConfig};
    pub use crate::db::{ConversationStore, SqliteStore};
    pub use crate::error::{ChatError, RelayError};
    pub use crate::models::{Message, Role, QUICK_QUESTIONS};
    pub use crate::session::{ChatSession, Phase, SendOutcome, SessionDeps, SessionEvent, SessionOptions};
    pub use crate::{server, telemetry};
}
