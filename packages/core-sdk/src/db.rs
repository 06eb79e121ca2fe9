use anyhow::{Context, Result};
use rusqlite::{params, Connection, ErrorCode, OptionalExtension};
use std::{sync::Mutex, thread, time::Duration};

use crate::models::Message;

/** \brief 会话在本地存储中的固定命名空间键。 */
pub const CHAT_HISTORY_KEY: &str = "dbt-chat-history";
/** \brief 上次发送失败、等待重试的用户输入。 */
pub const PENDING_RETRY_KEY: &str = "dbt-chat-pending-retry";

/**
 * \brief 会话持久化接口；控制器只通过它访问存储。
 */
pub trait ConversationStore: Send + Sync {
    /** \brief 读取已保存的会话；无记录时返回空列表。 */
    fn load(&self) -> Result<Vec<Message>>;
    /** \brief 覆盖保存整个会话。 */
    fn save(&self, messages: &[Message]) -> Result<()>;
    /** \brief 删除已保存的会话。 */
    fn clear(&self) -> Result<()>;

    /** \brief 读取待重试的输入；不支持的存储视为没有。 */
    fn load_pending_retry(&self) -> Result<Option<String>> {
        Ok(None)
    }

    /** \brief 保存（`Some`）或清除（`None`）待重试的输入。 */
    fn save_pending_retry(&self, _text: Option<&str>) -> Result<()> {
        Ok(())
    }
}

/**
 * \brief 打开默认数据库文件。
 */
pub fn open_db(path: &str) -> Result<Connection> {
    let conn = Connection::open(path).with_context(|| format!("open database {}", path))?;
    conn.busy_timeout(Duration::from_secs(5))?;
    Ok(conn)
}

/**
 * \brief 运行数据库迁移，创建键值表。
 */
pub fn migrate(conn: &Connection) -> Result<()> {
    retry_on_locked(|| {
        conn.execute_batch(
            r#"
        PRAGMA journal_mode=WAL;
        CREATE TABLE IF NOT EXISTS local_store (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        );
        "#,
        )
    })?;
    Ok(())
}

pub fn set_value(conn: &Connection, key: &str, value: &str) -> Result<()> {
    retry_on_locked(|| {
        conn.execute(
            "INSERT INTO local_store (key, value) VALUES (?1, ?2)
         ON CONFLICT(key) DO UPDATE SET value=excluded.value",
            params![key, value],
        )
    })?;
    Ok(())
}

pub fn get_value(conn: &Connection, key: &str) -> Result<Option<String>> {
    let val = conn
        .query_row(
            "SELECT value FROM local_store WHERE key=?1",
            params![key],
            |row| row.get::<_, String>(0),
        )
        .optional()?;
    Ok(val)
}

pub fn remove_value(conn: &Connection, key: &str) -> Result<()> {
    retry_on_locked(|| conn.execute("DELETE FROM local_store WHERE key=?1", params![key]))?;
    Ok(())
}

/**
 * \brief 基于 SQLite 键值表的会话存储，整段会话以 JSON 保存。
 */
pub struct SqliteStore {
    conn: Mutex<Connection>,
    key: String,
}

impl SqliteStore {
    pub fn open(path: &str) -> Result<Self> {
        let conn = open_db(path)?;
        Self::from_connection(conn)
    }

    pub fn from_connection(conn: Connection) -> Result<Self> {
        migrate(&conn).context("apply migrations failed")?;
        Ok(Self {
            conn: Mutex::new(conn),
            key: CHAT_HISTORY_KEY.to_string(),
        })
    }

    fn with_conn<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let guard = self
            .conn
            .lock()
            .map_err(|_| anyhow::anyhow!("local store connection poisoned"))?;
        f(&guard)
    }
}

impl ConversationStore for SqliteStore {
    fn load(&self) -> Result<Vec<Message>> {
        let raw = self.with_conn(|conn| get_value(conn, &self.key))?;
        match raw {
            Some(json) => serde_json::from_str(&json).context("decode stored conversation"),
            None => Ok(Vec::new()),
        }
    }

    fn save(&self, messages: &[Message]) -> Result<()> {
        let json = serde_json::to_string(messages)?;
        self.with_conn(|conn| set_value(conn, &self.key, &json))
    }

    fn clear(&self) -> Result<()> {
        self.with_conn(|conn| remove_value(conn, &self.key))
    }

    fn load_pending_retry(&self) -> Result<Option<String>> {
        self.with_conn(|conn| get_value(conn, PENDING_RETRY_KEY))
    }

    fn save_pending_retry(&self, text: Option<&str>) -> Result<()> {
        self.with_conn(|conn| match text {
            Some(text) => set_value(conn, PENDING_RETRY_KEY, text),
            None => remove_value(conn, PENDING_RETRY_KEY),
        })
    }
}

/**
 * \brief 内存存储，记录每次保存的快照，供测试与临时会话使用。
 */
#[derive(Default)]
pub struct MemoryStore {
    current: Mutex<Option<Vec<Message>>>,
    snapshots: Mutex<Vec<Vec<Message>>>,
    pending_retry: Mutex<Option<String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_messages(messages: Vec<Message>) -> Self {
        Self {
            current: Mutex::new(Some(messages)),
            ..Self::default()
        }
    }

    /** \brief 每次 `save` 的快照，按保存顺序排列。 */
    pub fn snapshots(&self) -> Vec<Vec<Message>> {
        self.snapshots.lock().map(|s| s.clone()).unwrap_or_default()
    }

    pub fn is_cleared(&self) -> bool {
        self.current.lock().map(|c| c.is_none()).unwrap_or(false)
    }
}

impl ConversationStore for MemoryStore {
    fn load(&self) -> Result<Vec<Message>> {
        let guard = self
            .current
            .lock()
            .map_err(|_| anyhow::anyhow!("memory store poisoned"))?;
        Ok(guard.clone().unwrap_or_default())
    }

    fn save(&self, messages: &[Message]) -> Result<()> {
        let mut guard = self
            .current
            .lock()
            .map_err(|_| anyhow::anyhow!("memory store poisoned"))?;
        *guard = Some(messages.to_vec());
        if let Ok(mut snaps) = self.snapshots.lock() {
            snaps.push(messages.to_vec());
        }
        Ok(())
    }

    fn clear(&self) -> Result<()> {
        let mut guard = self
            .current
            .lock()
            .map_err(|_| anyhow::anyhow!("memory store poisoned"))?;
        *guard = None;
        Ok(())
    }

    fn load_pending_retry(&self) -> Result<Option<String>> {
        let guard = self
            .pending_retry
            .lock()
            .map_err(|_| anyhow::anyhow!("memory store poisoned"))?;
        Ok(guard.clone())
    }

    fn save_pending_retry(&self, text: Option<&str>) -> Result<()> {
        let mut guard = self
            .pending_retry
            .lock()
            .map_err(|_| anyhow::anyhow!("memory store poisoned"))?;
        *guard = text.map(str::to_string);
        Ok(())
    }
}

fn retry_on_locked<T, F>(mut action: F) -> Result<T>
where
    F: FnMut() -> rusqlite::Result<T>,
{
    const MAX_RETRIES: usize = 5;
    for attempt in 0..=MAX_RETRIES {
        match action() {
            Ok(value) => return Ok(value),
            Err(rusqlite::Error::SqliteFailure(err, _))
                if matches!(
                    err.code,
                    ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked
                ) && attempt < MAX_RETRIES =>
            {
                let backoff = Duration::from_millis(200 * (attempt as u64 + 1));
                thread::sleep(backoff);
                continue;
            }
            Err(e) => return Err(e.into()),
        }
    }
    unreachable!("retry_on_locked should have returned within the loop");
}
