use std::sync::{Arc, Mutex, MutexGuard};

use futures_util::StreamExt;
use tokio::{
    runtime::{Handle, RuntimeFlavor},
    sync::mpsc::UnboundedSender,
};
use tokio_util::sync::CancellationToken;

use crate::{
    client::{RelayTransport, SessionCredentials, SessionProvider},
    config::DEFAULT_MAX_REBUFFER,
    db::ConversationStore,
    error::{ChatError, MAX_MESSAGES},
    models::{next_message_id, now_millis, Message, RelayMessage, RelayRequest, Role},
    sse::SseDecoder,
    telemetry,
};

/**
 * \brief 控制器所处阶段；Error/Cancelled 为瞬时转换，结束后回到 Idle。
 */
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Sending,
    Streaming,
}

/**
 * \brief 一次发送的最终结果。
 */
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendOutcome {
    Completed,
    Cancelled,
    Failed(ChatError),
}

/**
 * \brief 供界面增量渲染的通知。
 */
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    Phase(Phase),
    Delta { message_id: String, delta: String },
    Error(String),
}

#[derive(Debug, Clone)]
pub struct SessionOptions {
    /** \brief 单行解析失败后最多放回缓冲区的次数 */
    pub max_rebuffer_attempts: u32,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            max_rebuffer_attempts: DEFAULT_MAX_REBUFFER,
        }
    }
}

/**
 * \brief 控制器依赖的外部协作者。
 */
pub struct SessionDeps {
    pub store: Arc<dyn ConversationStore>,
    pub transport: Arc<dyn RelayTransport>,
    pub auth: Arc<dyn SessionProvider>,
    pub credentials: Arc<SessionCredentials>,
}

struct State {
    messages: Vec<Message>,
    phase: Phase,
    error: Option<String>,
    cancel: Option<CancellationToken>,
    /** \brief 每次发送递增，过期的收尾不得覆盖新发送的状态 */
    generation: u64,
    /** \brief 上次失败（已回滚）的用户输入，供重试使用 */
    last_failed: Option<String>,
}

struct Inner {
    deps: SessionDeps,
    options: SessionOptions,
    events: Option<UnboundedSender<SessionEvent>>,
    state: Mutex<State>,
}

/**
 * \brief 会话控制器：持有权威会话状态，驱动与中继的交换，每次变更后持久化。
 */
#[derive(Clone)]
pub struct ChatSession {
    inner: Arc<Inner>,
}

impl ChatSession {
    /**
     * \brief 从存储恢复会话；存储不可读时记录日志并从空会话开始。
     */
    pub fn restore(
        deps: SessionDeps,
        options: SessionOptions,
        events: Option<UnboundedSender<SessionEvent>>,
    ) -> Self {
        let messages = match deps.store.load() {
            Ok(messages) => messages,
            Err(e) => {
                telemetry::log_error(
                    "chat.store",
                    &format!("restore failed, starting empty: {:#}", e),
                );
                Vec::new()
            }
        };
        let last_failed = match deps.store.load_pending_retry() {
            Ok(text) => text,
            Err(e) => {
                telemetry::log_error("chat.store", &format!("load pending retry failed: {:#}", e));
                None
            }
        };
        Self {
            inner: Arc::new(Inner {
                deps,
                options,
                events,
                state: Mutex::new(State {
                    messages,
                    phase: Phase::Idle,
                    error: None,
                    cancel: None,
                    generation: 0,
                    last_failed,
                }),
            }),
        }
    }

    pub fn messages(&self) -> Vec<Message> {
        self.state().messages.clone()
    }

    pub fn phase(&self) -> Phase {
        self.state().phase
    }

    pub fn is_loading(&self) -> bool {
        self.phase() != Phase::Idle
    }

    pub fn error(&self) -> Option<String> {
        self.state().error.clone()
    }

    pub fn credentials(&self) -> &SessionCredentials {
        &self.inner.deps.credentials
    }

    /**
     * \brief 发送一条用户消息并流式接收回复。
     *
     * 仅在已有发送进行中时返回 `Err(Busy)`；其余结果（含失败）以 `SendOutcome` 表示，
     * 失败原因同时写入 `error()`。
     */
    pub async fn send_message(&self, text: &str) -> Result<SendOutcome, ChatError> {
        let (generation, token, user_id, history) = {
            let mut st = self.state();
            if st.phase != Phase::Idle {
                return Err(ChatError::Busy);
            }
            let user = Message::new(Role::User, text);
            let user_id = user.id.clone();
            st.messages.push(user);
            self.persist(&st.messages);
            // 新的发送取代上一次失败，重试不再指向它
            if st.last_failed.take().is_some() {
                self.persist_pending_retry(None);
            }

            st.generation += 1;
            st.phase = Phase::Sending;
            st.error = None;
            let token = CancellationToken::new();
            st.cancel = Some(token.clone());

            let skip = st.messages.len().saturating_sub(MAX_MESSAGES);
            let history: Vec<RelayMessage> =
                st.messages[skip..].iter().map(Message::to_relay).collect();
            (st.generation, token, user_id, history)
        };
        self.emit(SessionEvent::Phase(Phase::Sending));

        let assistant_id = next_message_id(Role::Assistant, now_millis());
        let result = self
            .exchange(generation, &token, history, &assistant_id)
            .await;
        Ok(self.finish(generation, &token, &user_id, &assistant_id, text, result))
    }

    /**
     * \brief 取消进行中的请求；已提交的部分回复保留，不设置错误。
     * \return 是否确有请求被取消
     */
    pub fn cancel_request(&self) -> bool {
        let mut st = self.state();
        let Some(token) = st.cancel.take() else {
            return false;
        };
        token.cancel();
        st.phase = Phase::Idle;
        drop(st);
        telemetry::log_event("chat.session", "Request aborted");
        self.emit(SessionEvent::Phase(Phase::Idle));
        true
    }

    /**
     * \brief 重试最近一条用户消息，会话中始终至多保留一份该消息。
     *
     * 上次发送失败时直接重发其文本；否则移除最近的用户消息及紧随其后的助手消息后重发。
     * 没有可重试的消息时返回 `Ok(None)`。
     */
    pub async fn retry_last_message(&self) -> Result<Option<SendOutcome>, ChatError> {
        let text = {
            let mut st = self.state();
            if st.phase != Phase::Idle {
                return Err(ChatError::Busy);
            }
            match st.last_failed.clone() {
                Some(text) => Some(text),
                None => match st.messages.iter().rposition(|m| m.role == Role::User) {
                    Some(i) => {
                        let text = st.messages[i].content.clone();
                        let followed_by_assistant = matches!(
                            st.messages.get(i + 1),
                            Some(m) if m.role == Role::Assistant
                        );
                        let end = if followed_by_assistant { i + 2 } else { i + 1 };
                        st.messages.drain(i..end);
                        self.persist(&st.messages);
                        Some(text)
                    }
                    None => None,
                },
            }
        };

        match text {
            Some(text) => self.send_message(&text).await.map(Some),
            None => Ok(None),
        }
    }

    /**
     * \brief 清空会话、持久化存储与错误状态，任何阶段均可调用。
     *
     * 先清空存储；存储失败时内存中的会话保持不变。
     */
    pub fn clear_chat(&self) -> Result<(), ChatError> {
        let mut st = self.state();
        let store = &self.inner.deps.store;
        with_blocking(|| {
            store.clear()?;
            store.save_pending_retry(None)
        })
        .map_err(|e| ChatError::Storage(format!("{:#}", e)))?;
        st.messages.clear();
        st.error = None;
        st.last_failed = None;
        Ok(())
    }

    async fn exchange(
        &self,
        generation: u64,
        token: &CancellationToken,
        history: Vec<RelayMessage>,
        assistant_id: &str,
    ) -> Result<(), ChatError> {
        let access_token = tokio::select! {
            biased;
            _ = token.cancelled() => return Err(ChatError::Cancelled),
            t = self.inner.deps.auth.access_token() => t?,
        }
        .ok_or(ChatError::NotSignedIn)?;

        let request = RelayRequest {
            messages: history,
            custom_api_key: self.inner.deps.credentials.get(),
        };
        let mut body = tokio::select! {
            biased;
            _ = token.cancelled() => return Err(ChatError::Cancelled),
            opened = self.inner.deps.transport.open(&request, &access_token) => opened?,
        };
        self.enter_streaming(generation);

        let mut decoder = SseDecoder::new(self.inner.options.max_rebuffer_attempts);
        let mut content = String::new();
        loop {
            let next = tokio::select! {
                biased;
                _ = token.cancelled() => return Err(ChatError::Cancelled),
                next = body.next() => next,
            };
            match next {
                Some(Ok(chunk)) => {
                    let deltas = decoder.feed(&chunk);
                    self.apply_deltas(token, assistant_id, &mut content, deltas)?;
                }
                Some(Err(err)) => return Err(err),
                None => {
                    let deltas = decoder.finish();
                    self.apply_deltas(token, assistant_id, &mut content, deltas)?;
                    break;
                }
            }
        }
        tracing::debug!(
            chars = content.chars().count(),
            done = decoder.saw_done(),
            "assistant stream finished"
        );
        Ok(())
    }

    /**
     * \brief 按到达顺序追加增量，并以保留 ID 更新唯一的助手消息。
     */
    fn apply_deltas(
        &self,
        token: &CancellationToken,
        assistant_id: &str,
        content: &mut String,
        deltas: Vec<String>,
    ) -> Result<(), ChatError> {
        for delta in deltas {
            let mut st = self.state();
            if token.is_cancelled() {
                return Err(ChatError::Cancelled);
            }
            content.push_str(&delta);
            let msg = Message {
                id: assistant_id.to_string(),
                role: Role::Assistant,
                content: content.clone(),
                timestamp: now_millis(),
            };
            match st.messages.iter().rposition(|m| m.id == assistant_id) {
                Some(i) => st.messages[i] = msg,
                None => st.messages.push(msg),
            }
            self.persist(&st.messages);
            drop(st);
            self.emit(SessionEvent::Delta {
                message_id: assistant_id.to_string(),
                delta,
            });
        }
        Ok(())
    }

    fn enter_streaming(&self, generation: u64) {
        let mut st = self.state();
        if st.generation != generation || st.phase == Phase::Idle {
            return;
        }
        st.phase = Phase::Streaming;
        drop(st);
        self.emit(SessionEvent::Phase(Phase::Streaming));
    }

    fn finish(
        &self,
        generation: u64,
        token: &CancellationToken,
        user_id: &str,
        assistant_id: &str,
        text: &str,
        result: Result<(), ChatError>,
    ) -> SendOutcome {
        let mut st = self.state();
        let current = st.generation == generation;
        let was_active = current && st.phase != Phase::Idle;
        if current {
            st.cancel = None;
            st.phase = Phase::Idle;
        }

        let mut error_event = None;
        let outcome = match result {
            Ok(()) => {
                if current {
                    st.last_failed = None;
                }
                SendOutcome::Completed
            }
            Err(_) if token.is_cancelled() => SendOutcome::Cancelled,
            Err(ChatError::Cancelled) => SendOutcome::Cancelled,
            Err(err) => {
                telemetry::log_error("chat.session", &format!("Chat error: {}", err));
                // 失败时只保留完整往返的交换
                st.messages
                    .retain(|m| m.id != user_id && m.id != assistant_id);
                self.persist(&st.messages);
                if current {
                    st.error = Some(err.to_string());
                    st.last_failed = Some(text.to_string());
                    self.persist_pending_retry(Some(text));
                }
                error_event = Some(err.to_string());
                SendOutcome::Failed(err)
            }
        };
        drop(st);

        if was_active {
            self.emit(SessionEvent::Phase(Phase::Idle));
        }
        if let Some(message) = error_event {
            self.emit(SessionEvent::Error(message));
        }
        outcome
    }

    fn persist(&self, messages: &[Message]) {
        if let Err(e) = with_blocking(|| self.inner.deps.store.save(messages)) {
            telemetry::log_error("chat.store", &format!("save failed: {:#}", e));
        }
    }

    fn persist_pending_retry(&self, text: Option<&str>) {
        if let Err(e) = with_blocking(|| self.inner.deps.store.save_pending_retry(text)) {
            telemetry::log_error("chat.store", &format!("save pending retry failed: {:#}", e));
        }
    }

    fn emit(&self, event: SessionEvent) {
        if let Some(tx) = &self.inner.events {
            let _ = tx.send(event);
        }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/**
 * \brief 执行同步存储操作。
 *
 * 多线程运行时中经 `block_in_place` 让出工作线程，SQLite 忙等与退避不会阻塞其他任务；
 * 单线程运行时或运行时之外直接执行。
 */
fn with_blocking<T>(f: impl FnOnce() -> T) -> T {
    match Handle::try_current() {
        Ok(handle) if handle.runtime_flavor() == RuntimeFlavor::MultiThread => {
            tokio::task::block_in_place(f)
        }
        _ => f(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{collections::VecDeque, time::Duration};

    use async_trait::async_trait;
    use bytes::Bytes;
    use tokio::sync::mpsc::{self, UnboundedReceiver};
    use tokio_stream::wrappers::UnboundedReceiverStream;

    use crate::{
        client::{ByteStream, StaticSession},
        db::{MemoryStore, SqliteStore},
    };

    const QUESTION: &str = "What is DBT?";

    fn delta_line(content: &str) -> String {
        format!(
            "data: {}\n",
            serde_json::json!({"choices": [{"delta": {"content": content}}]})
        )
    }

    fn hello_chunks() -> Vec<String> {
        vec![
            delta_line("Hel"),
            delta_line("lo"),
            "data: [DONE]\n".to_string(),
        ]
    }

    enum Reply {
        Chunks(Vec<String>),
        Channel(UnboundedReceiver<Result<Bytes, ChatError>>),
        Fail(ChatError),
    }

    struct ScriptedTransport {
        replies: Mutex<VecDeque<Reply>>,
        requests: Mutex<Vec<(RelayRequest, String)>>,
    }

    impl ScriptedTransport {
        fn new(replies: Vec<Reply>) -> Arc<Self> {
            Arc::new(Self {
                replies: Mutex::new(replies.into()),
                requests: Mutex::new(Vec::new()),
            })
        }

        fn requests(&self) -> Vec<(RelayRequest, String)> {
            self.requests.lock().expect("lock requests").clone()
        }
    }

    #[async_trait]
    impl RelayTransport for ScriptedTransport {
        async fn open(
            &self,
            request: &RelayRequest,
            session_token: &str,
        ) -> Result<ByteStream, ChatError> {
            self.requests
                .lock()
                .expect("lock requests")
                .push((request.clone(), session_token.to_string()));
            let reply = self
                .replies
                .lock()
                .expect("lock replies")
                .pop_front()
                .expect("unexpected relay call");
            match reply {
                Reply::Chunks(chunks) => Ok(Box::pin(futures_util::stream::iter(
                    chunks.into_iter().map(|c| Ok(Bytes::from(c))),
                ))),
                Reply::Channel(rx) => Ok(Box::pin(UnboundedReceiverStream::new(rx))),
                Reply::Fail(err) => Err(err),
            }
        }
    }

    struct Harness {
        session: ChatSession,
        store: Arc<MemoryStore>,
        transport: Arc<ScriptedTransport>,
        events: UnboundedReceiver<SessionEvent>,
    }

    fn harness_with(
        store: Arc<MemoryStore>,
        replies: Vec<Reply>,
        token: Option<&str>,
    ) -> Harness {
        let transport = ScriptedTransport::new(replies);
        let (tx, events) = mpsc::unbounded_channel();
        let session = ChatSession::restore(
            SessionDeps {
                store: store.clone(),
                transport: transport.clone(),
                auth: Arc::new(StaticSession::new(token.map(str::to_string))),
                credentials: Arc::new(SessionCredentials::default()),
            },
            SessionOptions::default(),
            Some(tx),
        );
        Harness {
            session,
            store,
            transport,
            events,
        }
    }

    fn harness(replies: Vec<Reply>) -> Harness {
        harness_with(Arc::new(MemoryStore::new()), replies, Some("session-token"))
    }

    fn count_user(messages: &[Message], text: &str) -> usize {
        messages
            .iter()
            .filter(|m| m.role == Role::User && m.content == text)
            .count()
    }

    async fn next_delta(events: &mut UnboundedReceiver<SessionEvent>) -> String {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                match events.recv().await {
                    Some(SessionEvent::Delta { delta, .. }) => return delta,
                    Some(_) => continue,
                    None => panic!("event channel closed"),
                }
            }
        })
        .await
        .expect("timed out waiting for delta")
    }

    async fn wait_for_phase(events: &mut UnboundedReceiver<SessionEvent>, phase: Phase) {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                match events.recv().await {
                    Some(SessionEvent::Phase(p)) if p == phase => return,
                    Some(_) => continue,
                    None => panic!("event channel closed"),
                }
            }
        })
        .await
        .expect("timed out waiting for phase");
    }

    #[tokio::test]
    async fn test_deltas_build_one_assistant_message() {
        let mut h = harness(vec![Reply::Chunks(hello_chunks())]);
        let outcome = h.session.send_message(QUESTION).await.expect("send");
        assert_eq!(outcome, SendOutcome::Completed);

        let messages = h.session.messages();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].role, Role::User);
        assert_eq!(messages[0].content, QUESTION);
        assert_eq!(messages[1].role, Role::Assistant);
        assert_eq!(messages[1].content, "Hello");
        assert!(!h.session.is_loading());
        assert_eq!(h.session.error(), None);

        // 恰好两次增量更新，且指向同一条消息
        let mut delta_ids = Vec::new();
        while let Ok(event) = h.events.try_recv() {
            if let SessionEvent::Delta { message_id, .. } = event {
                delta_ids.push(message_id);
            }
        }
        assert_eq!(delta_ids.len(), 2);
        assert!(delta_ids.iter().all(|id| *id == messages[1].id));

        // 每次变更后都已持久化：用户消息 1 次 + 助手更新 2 次
        let snapshots = h.store.snapshots();
        assert_eq!(snapshots.len(), 3);
        let assistant_snapshots: Vec<&Message> = snapshots
            .iter()
            .filter_map(|s| s.iter().find(|m| m.role == Role::Assistant))
            .collect();
        assert_eq!(assistant_snapshots.len(), 2);
        assert_eq!(assistant_snapshots[0].content, "Hel");
        assert_eq!(assistant_snapshots[1].content, "Hello");
        assert_eq!(assistant_snapshots[0].id, assistant_snapshots[1].id);
        assert_eq!(h.store.load().expect("load"), messages);
    }

    #[tokio::test]
    async fn test_payload_split_across_reads_matches_whole() {
        let whole = hello_chunks().concat();
        let cut = whole.find("\"lo\"").expect("second payload") - 7;
        let chunks = vec![whole[..cut].to_string(), whole[cut..].to_string()];

        let h = harness(vec![Reply::Chunks(chunks)]);
        let outcome = h.session.send_message(QUESTION).await.expect("send");
        assert_eq!(outcome, SendOutcome::Completed);
        assert_eq!(h.session.messages()[1].content, "Hello");
    }

    #[tokio::test]
    async fn test_cancel_mid_stream_keeps_partial_content() {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut h = harness(vec![Reply::Channel(rx)]);

        let session = h.session.clone();
        let task = tokio::spawn(async move { session.send_message(QUESTION).await });

        tx.send(Ok(Bytes::from(delta_line("Hel")))).expect("send chunk");
        assert_eq!(next_delta(&mut h.events).await, "Hel");

        assert!(h.session.cancel_request());
        assert!(!h.session.is_loading());

        let outcome = task.await.expect("join").expect("send");
        assert_eq!(outcome, SendOutcome::Cancelled);
        // 取消后到达的字节不再生效
        let _ = tx.send(Ok(Bytes::from(delta_line("lo"))));

        let messages = h.session.messages();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[1].content, "Hel");
        assert_eq!(h.session.error(), None);
        assert!(!h.session.is_loading());
        assert_eq!(h.store.load().expect("load")[1].content, "Hel");
        assert!(!h.session.cancel_request());
    }

    #[tokio::test]
    async fn test_network_failure_removes_unanswered_user_turn() {
        let prior = vec![
            Message::new(Role::User, "Hi"),
            Message::new(Role::Assistant, "Hello! How can I help?"),
        ];
        let store = Arc::new(MemoryStore::with_messages(prior.clone()));
        let h = harness_with(
            store,
            vec![Reply::Fail(ChatError::Network("connection reset".to_string()))],
            Some("session-token"),
        );

        let outcome = h.session.send_message(QUESTION).await.expect("send");
        assert!(matches!(outcome, SendOutcome::Failed(ChatError::Network(_))));
        assert_eq!(h.session.messages(), prior);
        assert_eq!(h.store.load().expect("load"), prior);
        assert_eq!(
            h.session.error().as_deref(),
            Some("Network error: connection reset")
        );
        assert!(!h.session.is_loading());
    }

    #[tokio::test]
    async fn test_mid_stream_failure_discards_partial_exchange() {
        let (tx, rx) = mpsc::unbounded_channel();
        tx.send(Ok(Bytes::from(delta_line("Hel")))).expect("chunk");
        tx.send(Err(ChatError::Stream("reset by peer".to_string())))
            .expect("error");
        let h = harness(vec![Reply::Channel(rx)]);

        let outcome = h.session.send_message(QUESTION).await.expect("send");
        assert!(matches!(outcome, SendOutcome::Failed(ChatError::Stream(_))));
        assert!(h.session.messages().is_empty());
        assert!(h.store.load().expect("load").is_empty());
    }

    #[tokio::test]
    async fn test_relay_rejection_surfaces_its_reason() {
        let h = harness(vec![Reply::Fail(ChatError::Relay {
            status: 429,
            message: "Rate limit exceeded. Please try again in a moment.".to_string(),
        })]);
        let outcome = h.session.send_message(QUESTION).await.expect("send");
        assert!(matches!(outcome, SendOutcome::Failed(ChatError::Relay { status: 429, .. })));
        assert_eq!(
            h.session.error().as_deref(),
            Some("Rate limit exceeded. Please try again in a moment.")
        );
    }

    #[tokio::test]
    async fn test_missing_session_fails_without_calling_relay() {
        let h = harness_with(Arc::new(MemoryStore::new()), vec![], None);
        let outcome = h.session.send_message(QUESTION).await.expect("send");
        assert_eq!(outcome, SendOutcome::Failed(ChatError::NotSignedIn));
        assert!(h.transport.requests().is_empty());
        assert!(h.session.messages().is_empty());
        assert_eq!(
            h.session.error().as_deref(),
            Some("Please sign in to use the chat")
        );
    }

    #[tokio::test]
    async fn test_retry_after_failure_resends_without_duplicating() {
        let h = harness(vec![
            Reply::Fail(ChatError::Network("offline".to_string())),
            Reply::Chunks(hello_chunks()),
        ]);
        let first = h.session.send_message(QUESTION).await.expect("send");
        assert!(matches!(first, SendOutcome::Failed(_)));
        assert_eq!(count_user(&h.session.messages(), QUESTION), 0);

        let retried = h.session.retry_last_message().await.expect("retry");
        assert_eq!(retried, Some(SendOutcome::Completed));
        let messages = h.session.messages();
        assert_eq!(count_user(&messages, QUESTION), 1);
        assert_eq!(messages.len(), 2);
        assert_eq!(h.session.error(), None);

        let requests = h.transport.requests();
        assert_eq!(requests.len(), 2);
        let (second, token) = &requests[1];
        assert_eq!(token, "session-token");
        assert_eq!(second.messages.len(), 1);
        assert_eq!(second.messages[0].content, QUESTION);
    }

    #[tokio::test]
    async fn test_retry_replaces_partial_answer() {
        let prior = vec![
            Message::new(Role::User, QUESTION),
            Message::new(Role::Assistant, "Direct Ben"),
        ];
        let store = Arc::new(MemoryStore::with_messages(prior));
        let h = harness_with(
            store,
            vec![Reply::Chunks(hello_chunks())],
            Some("session-token"),
        );

        let retried = h.session.retry_last_message().await.expect("retry");
        assert_eq!(retried, Some(SendOutcome::Completed));
        let messages = h.session.messages();
        assert_eq!(messages.len(), 2);
        assert_eq!(count_user(&messages, QUESTION), 1);
        assert_eq!(messages[1].content, "Hello");

        let (request, _) = &h.transport.requests()[0];
        assert_eq!(request.messages.len(), 1);
    }

    #[tokio::test]
    async fn test_retry_with_empty_conversation_is_noop() {
        let h = harness(vec![]);
        assert_eq!(h.session.retry_last_message().await.expect("retry"), None);
        assert!(h.transport.requests().is_empty());
    }

    #[tokio::test]
    async fn test_second_send_while_active_is_rejected() {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut h = harness(vec![Reply::Channel(rx)]);

        let session = h.session.clone();
        let task = tokio::spawn(async move { session.send_message(QUESTION).await });
        wait_for_phase(&mut h.events, Phase::Streaming).await;

        assert_eq!(
            h.session.send_message("another").await,
            Err(ChatError::Busy)
        );
        assert_eq!(h.session.retry_last_message().await, Err(ChatError::Busy));
        assert_eq!(count_user(&h.session.messages(), "another"), 0);

        tx.send(Ok(Bytes::from(delta_line("ok")))).expect("chunk");
        drop(tx);
        let outcome = task.await.expect("join").expect("send");
        assert_eq!(outcome, SendOutcome::Completed);
        assert_eq!(h.session.messages().len(), 2);
    }

    #[tokio::test]
    async fn test_request_carries_history_and_custom_key() {
        let prior = vec![
            Message::new(Role::User, "Hi"),
            Message::new(Role::Assistant, "Hello!"),
        ];
        let store = Arc::new(MemoryStore::with_messages(prior));
        let h = harness_with(
            store,
            vec![Reply::Chunks(hello_chunks())],
            Some("session-token"),
        );
        h.session.credentials().set(" sk-custom ");

        h.session.send_message(QUESTION).await.expect("send");
        let (request, token) = &h.transport.requests()[0];
        assert_eq!(token, "session-token");
        assert_eq!(request.custom_api_key.as_deref(), Some("sk-custom"));
        let roles: Vec<&str> = request.messages.iter().map(|m| m.role.as_str()).collect();
        assert_eq!(roles, vec!["user", "assistant", "user"]);
        assert_eq!(request.messages[2].content, QUESTION);
    }

    #[tokio::test]
    async fn test_history_window_is_bounded() {
        let prior: Vec<Message> = (0..60)
            .map(|i| {
                let role = if i % 2 == 0 { Role::User } else { Role::Assistant };
                Message::new(role, format!("m{}", i))
            })
            .collect();
        let store = Arc::new(MemoryStore::with_messages(prior));
        let h = harness_with(
            store,
            vec![Reply::Chunks(hello_chunks())],
            Some("session-token"),
        );
        h.session.send_message(QUESTION).await.expect("send");
        let (request, _) = &h.transport.requests()[0];
        assert_eq!(request.messages.len(), MAX_MESSAGES);
        assert_eq!(
            request.messages.last().map(|m| m.content.as_str()),
            Some(QUESTION)
        );
        assert_eq!(h.session.messages().len(), 62);
    }

    #[tokio::test]
    async fn test_clear_then_restore_is_empty() {
        let h = harness(vec![Reply::Chunks(hello_chunks())]);
        h.session.send_message(QUESTION).await.expect("send");
        assert_eq!(h.session.messages().len(), 2);

        h.session.clear_chat().expect("clear");
        assert!(h.session.messages().is_empty());
        assert!(h.store.is_cleared());

        let restored = harness_with(h.store.clone(), vec![], Some("session-token"));
        assert!(restored.session.messages().is_empty());
    }

    #[tokio::test]
    async fn test_sqlite_backed_session_survives_restart() {
        let conn = rusqlite::Connection::open_in_memory().expect("open db");
        let store: Arc<dyn ConversationStore> =
            Arc::new(SqliteStore::from_connection(conn).expect("store"));
        let deps = |replies: Vec<Reply>| SessionDeps {
            store: store.clone(),
            transport: ScriptedTransport::new(replies),
            auth: Arc::new(StaticSession::new(Some("tok".to_string()))),
            credentials: Arc::new(SessionCredentials::default()),
        };

        let first = ChatSession::restore(
            deps(vec![Reply::Chunks(hello_chunks())]),
            SessionOptions::default(),
            None,
        );
        first.send_message(QUESTION).await.expect("send");

        let second = ChatSession::restore(deps(vec![]), SessionOptions::default(), None);
        assert_eq!(second.messages(), first.messages());

        second.clear_chat().expect("clear");
        let third = ChatSession::restore(deps(vec![]), SessionOptions::default(), None);
        assert!(third.messages().is_empty());
    }

    #[tokio::test]
    async fn test_retry_after_failure_then_cancel_targets_latest_question() {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut h = harness(vec![
            Reply::Fail(ChatError::Network("offline".to_string())),
            Reply::Channel(rx),
            Reply::Chunks(hello_chunks()),
        ]);

        let failed = h.session.send_message("B").await.expect("send B");
        assert!(matches!(failed, SendOutcome::Failed(_)));

        let session = h.session.clone();
        let task = tokio::spawn(async move { session.send_message("C").await });
        tx.send(Ok(Bytes::from(delta_line("partial")))).expect("chunk");
        assert_eq!(next_delta(&mut h.events).await, "partial");
        assert!(h.session.cancel_request());
        assert_eq!(task.await.expect("join").expect("send C"), SendOutcome::Cancelled);

        let retried = h.session.retry_last_message().await.expect("retry");
        assert_eq!(retried, Some(SendOutcome::Completed));

        let requests = h.transport.requests();
        let (last, _) = requests.last().expect("retry request");
        assert_eq!(last.messages.last().map(|m| m.content.as_str()), Some("C"));

        let messages = h.session.messages();
        let summary: Vec<(Role, &str)> = messages
            .iter()
            .map(|m| (m.role, m.content.as_str()))
            .collect();
        assert_eq!(summary, vec![(Role::User, "C"), (Role::Assistant, "Hello")]);
    }

    #[tokio::test]
    async fn test_failed_text_is_retried_after_restore() {
        let prior = vec![
            Message::new(Role::User, "Hi"),
            Message::new(Role::Assistant, "Hello!"),
        ];
        let store = Arc::new(MemoryStore::with_messages(prior.clone()));
        let first = harness_with(
            store.clone(),
            vec![Reply::Fail(ChatError::Network("offline".to_string()))],
            Some("session-token"),
        );
        first.session.send_message(QUESTION).await.expect("send");
        assert_eq!(
            store.load_pending_retry().expect("pending").as_deref(),
            Some(QUESTION)
        );

        let second = harness_with(
            store.clone(),
            vec![Reply::Chunks(hello_chunks())],
            Some("session-token"),
        );
        let retried = second.session.retry_last_message().await.expect("retry");
        assert_eq!(retried, Some(SendOutcome::Completed));

        let messages = second.session.messages();
        assert_eq!(&messages[..2], &prior[..]);
        assert_eq!(count_user(&messages, QUESTION), 1);
        assert_eq!(messages.len(), 4);
        assert_eq!(store.load_pending_retry().expect("pending"), None);
    }

    struct ClearFailsStore(MemoryStore);

    impl ConversationStore for ClearFailsStore {
        fn load(&self) -> anyhow::Result<Vec<Message>> {
            self.0.load()
        }

        fn save(&self, messages: &[Message]) -> anyhow::Result<()> {
            self.0.save(messages)
        }

        fn clear(&self) -> anyhow::Result<()> {
            anyhow::bail!("disk is read-only")
        }
    }

    #[tokio::test]
    async fn test_clear_failure_keeps_memory_and_storage_in_step() {
        let prior = vec![
            Message::new(Role::User, "Hi"),
            Message::new(Role::Assistant, "Hello!"),
        ];
        let store = Arc::new(ClearFailsStore(MemoryStore::with_messages(prior.clone())));
        let session = ChatSession::restore(
            SessionDeps {
                store: store.clone(),
                transport: ScriptedTransport::new(vec![]),
                auth: Arc::new(StaticSession::new(Some("tok".to_string()))),
                credentials: Arc::new(SessionCredentials::default()),
            },
            SessionOptions::default(),
            None,
        );

        let err = session.clear_chat().expect_err("clear should fail");
        assert!(matches!(err, ChatError::Storage(_)));
        assert_eq!(session.messages(), prior);
        assert_eq!(store.load().expect("load"), prior);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_sqlite_writes_on_multi_thread_runtime() {
        let conn = rusqlite::Connection::open_in_memory().expect("open db");
        let store: Arc<dyn ConversationStore> =
            Arc::new(SqliteStore::from_connection(conn).expect("store"));
        let session = ChatSession::restore(
            SessionDeps {
                store: store.clone(),
                transport: ScriptedTransport::new(vec![
                    Reply::Fail(ChatError::Network("offline".to_string())),
                    Reply::Chunks(hello_chunks()),
                ]),
                auth: Arc::new(StaticSession::new(Some("tok".to_string()))),
                credentials: Arc::new(SessionCredentials::default()),
            },
            SessionOptions::default(),
            None,
        );

        let worker = session.clone();
        let outcome = tokio::spawn(async move { worker.send_message(QUESTION).await })
            .await
            .expect("join")
            .expect("send");
        assert!(matches!(outcome, SendOutcome::Failed(_)));
        assert_eq!(
            store.load_pending_retry().expect("pending").as_deref(),
            Some(QUESTION)
        );

        let retried = session.retry_last_message().await.expect("retry");
        assert_eq!(retried, Some(SendOutcome::Completed));
        assert_eq!(store.load().expect("load"), session.messages());
        assert_eq!(store.load_pending_retry().expect("pending"), None);
    }
}
