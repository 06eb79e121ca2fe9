use serde_json::Value;

use crate::config::DEFAULT_MAX_REBUFFER;

const DATA_PREFIX: &str = "data: ";
const DONE_SENTINEL: &str = "[DONE]";

/**
 * \brief 事件流增量解码器：字节 → UTF-8 文本 → 行 → 文本增量。
 *
 * 每次 `feed` 对应一次读取周期。解析失败的行会放回缓冲区等待更多字节，
 * 同一行失败次数超过 `max_rebuffer_attempts` 后丢弃并记录警告。
 */
#[derive(Debug)]
pub struct SseDecoder {
    /** \brief 尚未凑成完整 UTF-8 序列的尾部字节 */
    pending: Vec<u8>,
    /** \brief 已解码、尚未按行消费的文本 */
    text: String,
    /** \brief 当前被放回的行及其失败次数 */
    stalled: Option<(String, u32)>,
    max_rebuffer_attempts: u32,
    saw_done: bool,
}

impl Default for SseDecoder {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_REBUFFER)
    }
}

impl SseDecoder {
    pub fn new(max_rebuffer_attempts: u32) -> Self {
        Self {
            pending: Vec::new(),
            text: String::new(),
            stalled: None,
            max_rebuffer_attempts,
            saw_done: false,
        }
    }

    /**
     * \brief 处理一个读取周期的字节，返回本周期解析出的增量（按到达顺序）。
     */
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<String> {
        self.decode(chunk);
        self.drain_lines(false)
    }

    /**
     * \brief 响应体结束：冲刷残留字节，末尾未换行的文本按最后一行处理。
     */
    pub fn finish(&mut self) -> Vec<String> {
        if !self.pending.is_empty() {
            let rest = std::mem::take(&mut self.pending);
            self.text.push_str(&String::from_utf8_lossy(&rest));
        }
        if !self.text.is_empty() && !self.text.ends_with('\n') {
            self.text.push('\n');
        }
        self.drain_lines(true)
    }

    pub fn saw_done(&self) -> bool {
        self.saw_done
    }

    /** \brief 已缓冲但尚未消费的文本（含被放回的行）。 */
    pub fn buffered(&self) -> &str {
        &self.text
    }

    fn decode(&mut self, chunk: &[u8]) {
        self.pending.extend_from_slice(chunk);
        loop {
            match std::str::from_utf8(&self.pending) {
                Ok(s) => {
                    self.text.push_str(s);
                    self.pending.clear();
                    return;
                }
                Err(e) => {
                    let valid = e.valid_up_to();
                    self.text
                        .push_str(std::str::from_utf8(&self.pending[..valid]).unwrap_or_default());
                    match e.error_len() {
                        Some(bad) => {
                            self.text.push(char::REPLACEMENT_CHARACTER);
                            self.pending.drain(..valid + bad);
                        }
                        None => {
                            // 多字节序列被截断在块边界，留待下一块
                            self.pending.drain(..valid);
                            return;
                        }
                    }
                }
            }
        }
    }

    fn drain_lines(&mut self, at_end: bool) -> Vec<String> {
        let mut deltas = Vec::new();
        while let Some(newline) = self.text.find('\n') {
            let mut line: String = self.text.drain(..=newline).collect();
            line.pop();
            if line.ends_with('\r') {
                line.pop();
            }

            if line.starts_with(':') || line.trim().is_empty() {
                continue;
            }
            let Some(payload) = line.strip_prefix(DATA_PREFIX) else {
                continue;
            };
            let payload = payload.trim();
            if payload == DONE_SENTINEL {
                self.saw_done = true;
                break;
            }

            match serde_json::from_str::<Value>(payload) {
                Ok(value) => {
                    self.stalled = None;
                    if let Some(delta) = extract_delta(&value) {
                        deltas.push(delta.to_string());
                    }
                }
                Err(err) => {
                    if at_end {
                        tracing::warn!("dropping unparsable stream line at end of body: {}", err);
                        continue;
                    }
                    let attempts = match &self.stalled {
                        Some((stalled, n)) if *stalled == line => n + 1,
                        _ => 1,
                    };
                    if attempts > self.max_rebuffer_attempts {
                        tracing::warn!(
                            attempts,
                            "dropping stream line that never parsed: {}",
                            err
                        );
                        self.stalled = None;
                        continue;
                    }
                    self.text.insert(0, '\n');
                    self.text.insert_str(0, &line);
                    self.stalled = Some((line, attempts));
                    break;
                }
            }
        }
        deltas
    }
}

/**
 * \brief 提取第一个 choice 的增量文本；空串视为无增量。
 */
pub fn extract_delta(value: &Value) -> Option<&str> {
    value
        .get("choices")?
        .get(0)?
        .get("delta")?
        .get("content")?
        .as_str()
        .filter(|s| !s.is_empty())
}
