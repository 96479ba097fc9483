use chrono::{DateTime, Utc};
use relay_core::types::ChatMessage;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::debug;

/// Message history between one user and one agent.
#[derive(Debug, Clone)]
pub struct Conversation {
    pub user_id: i64,
    pub agent_token: String,
    messages: Vec<ChatMessage>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Conversation {
    pub fn new(user_id: i64, agent_token: &str) -> Self {
        let now = Utc::now();
        Self {
            user_id,
            agent_token: agent_token.to_string(),
            messages: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn push(&mut self, msg: ChatMessage) {
        self.messages.push(msg);
        self.updated_at = Utc::now();
    }

    pub fn messages(&self) -> &[ChatMessage] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn clear(&mut self) {
        self.messages.clear();
        self.updated_at = Utc::now();
    }

    /// Keep at most the last `n` messages. The cut moves forward past any
    /// tool results whose call was dropped, so the kept history never opens
    /// mid-exchange.
    pub fn trim_to_last_n(&mut self, n: usize) {
        if self.messages.len() <= n {
            return;
        }
        let start = self.messages.len() - n;
        let tail = &self.messages[start..];
        let safe = start + find_safe_history_start(tail);
        self.messages = validate_and_clean(&self.messages[safe..]);
        self.updated_at = Utc::now();
        debug!(kept = self.messages.len(), "Conversation trimmed");
    }

    /// History ready to send to the model.
    pub fn cleaned(&self) -> Vec<ChatMessage> {
        validate_and_clean(&self.messages)
    }
}

/// Index of the first message a truncated history can safely start from.
///
/// Leading tool results whose assistant message was cut off are skipped, as
/// is an opening assistant message whose tool results are incomplete.
fn find_safe_history_start(history: &[ChatMessage]) -> usize {
    let mut i = 0;
    while i < history.len() && history[i].is_tool_result() {
        i += 1;
    }

    while i < history.len() && history[i].has_tool_calls() {
        let end = tool_block_end(history, i + 1);
        if answers_all_calls(&history[i], &history[i + 1..end]) {
            break;
        }
        i = end;
    }
    i
}

fn tool_block_end(history: &[ChatMessage], from: usize) -> usize {
    let mut j = from;
    while j < history.len() && history[j].is_tool_result() {
        j += 1;
    }
    j
}

fn answers_all_calls(assistant: &ChatMessage, results: &[ChatMessage]) -> bool {
    let found: HashSet<&str> = results
        .iter()
        .filter_map(|m| m.tool_call_id.as_deref())
        .collect();
    assistant
        .tool_calls
        .iter()
        .flatten()
        .all(|tc| found.contains(tc.id.as_str()))
}

/// Drop every broken tool exchange: assistant tool calls without all of
/// their results directly after, and tool results that answer nothing.
/// Applying it to its own output changes nothing.
pub fn validate_and_clean(messages: &[ChatMessage]) -> Vec<ChatMessage> {
    let mut out = Vec::with_capacity(messages.len());
    let mut i = 0;
    while i < messages.len() {
        let msg = &messages[i];
        if msg.has_tool_calls() {
            let end = tool_block_end(messages, i + 1);
            let results = &messages[i + 1..end];
            if answers_all_calls(msg, results) {
                let ids: HashSet<&str> = msg
                    .tool_calls
                    .iter()
                    .flatten()
                    .map(|tc| tc.id.as_str())
                    .collect();
                out.push(msg.clone());
                out.extend(
                    results
                        .iter()
                        .filter(|r| r.tool_call_id.as_deref().map_or(false, |id| ids.contains(id)))
                        .cloned(),
                );
            } else {
                debug!(index = i, "Dropping tool calls without results");
            }
            i = end;
        } else if msg.is_tool_result() {
            debug!(index = i, "Dropping orphaned tool result");
            i += 1;
        } else {
            out.push(msg.clone());
            i += 1;
        }
    }
    out
}

type ConversationKey = (i64, String);

/// Conversations keyed by (user, agent). Each sits behind its own async
/// mutex; holding it for a whole chat turn serializes turns for that pair
/// while other pairs proceed independently.
#[derive(Default)]
pub struct ConversationManager {
    conversations: Mutex<HashMap<ConversationKey, Arc<tokio::sync::Mutex<Conversation>>>>,
}

impl ConversationManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_or_create(&self, user_id: i64, agent_token: &str) -> Arc<tokio::sync::Mutex<Conversation>> {
        let mut map = self.conversations.lock().unwrap_or_else(PoisonError::into_inner);
        map.entry((user_id, agent_token.to_string()))
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(Conversation::new(user_id, agent_token))))
            .clone()
    }

    pub fn get(&self, user_id: i64, agent_token: &str) -> Option<Arc<tokio::sync::Mutex<Conversation>>> {
        let map = self.conversations.lock().unwrap_or_else(PoisonError::into_inner);
        map.get(&(user_id, agent_token.to_string())).cloned()
    }

    pub fn len(&self) -> usize {
        self.conversations.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_core::types::ToolCallRequest;
    use serde_json::json;

    fn call(id: &str) -> ToolCallRequest {
        ToolCallRequest {
            id: id.into(),
            name: "click".into(),
            arguments: json!({"x": 1, "y": 2, "description": "btn"}),
        }
    }

    fn assistant_calls(ids: &[&str]) -> ChatMessage {
        ChatMessage::assistant_with_tool_calls("", ids.iter().map(|id| call(id)).collect())
    }

    /// Every assistant tool-call message is followed by exactly its results,
    /// and every tool result follows its call.
    fn assert_pairs_intact(messages: &[ChatMessage]) {
        let mut i = 0;
        while i < messages.len() {
            if messages[i].has_tool_calls() {
                let end = tool_block_end(messages, i + 1);
                assert!(answers_all_calls(&messages[i], &messages[i + 1..end]), "unanswered at {}", i);
                i = end;
            } else {
                assert!(!messages[i].is_tool_result(), "orphan tool result at {}", i);
                i += 1;
            }
        }
    }

    /// A history with a tool exchange roughly every third message.
    fn sample_history() -> Vec<ChatMessage> {
        let mut history = Vec::new();
        for turn in 0..6 {
            history.push(ChatMessage::user(&format!("turn {}", turn)));
            let a = format!("call_{}_a", turn);
            let b = format!("call_{}_b", turn);
            history.push(assistant_calls(&[&a, &b]));
            history.push(ChatMessage::tool_result(&a, "ok"));
            history.push(ChatMessage::tool_result(&b, "ok"));
            history.push(ChatMessage::user_with_image("這是執行操作後的截圖", "AAA"));
            history.push(ChatMessage::assistant("done"));
        }
        history
    }

    #[test]
    fn test_trim_never_splits_pairs() {
        let history = sample_history();
        for n in 0..=history.len() + 2 {
            let mut conv = Conversation::new(1, "agent_a");
            for m in history.clone() {
                conv.push(m);
            }
            conv.trim_to_last_n(n);
            assert!(conv.len() <= n.min(history.len()), "n={} len={}", n, conv.len());
            assert_pairs_intact(conv.messages());
        }
    }

    /// Trim `history` at every cut point shorter than itself. The result must
    /// keep pairs intact and be a suffix of the input.
    fn assert_trims_cleanly(history: &[ChatMessage]) {
        for n in 0..history.len() {
            let mut conv = Conversation::new(1, "agent_a");
            for m in history.iter().cloned() {
                conv.push(m);
            }
            conv.trim_to_last_n(n);
            let kept = conv.messages();
            assert!(kept.len() <= n, "n={} len={}", n, kept.len());
            assert_pairs_intact(kept);
            assert_eq!(kept, &history[history.len() - kept.len()..], "n={}", n);
        }
    }

    #[test]
    fn test_trim_history_opening_with_tool_results() {
        let history = vec![
            ChatMessage::tool_result("c0", "ok"),
            ChatMessage::tool_result("c0b", "ok"),
            ChatMessage::user("go"),
            assistant_calls(&["c1"]),
            ChatMessage::tool_result("c1", "ok"),
            ChatMessage::assistant("done"),
            ChatMessage::user("again"),
            assistant_calls(&["c2"]),
            ChatMessage::tool_result("c2", "ok"),
        ];
        assert_trims_cleanly(&history);
    }

    #[test]
    fn test_trim_through_parallel_calls() {
        let history = vec![
            ChatMessage::user("fill the form"),
            assistant_calls(&["p1", "p2", "p3"]),
            ChatMessage::tool_result("p1", "ok"),
            ChatMessage::tool_result("p2", "ok"),
            ChatMessage::tool_result("p3", "ok"),
            ChatMessage::user_with_image("這是執行操作後的截圖", "AAA"),
            assistant_calls(&["q1", "q2"]),
            ChatMessage::tool_result("q1", "ok"),
            ChatMessage::tool_result("q2", "ok"),
            ChatMessage::assistant("done"),
        ];
        assert_trims_cleanly(&history);

        // Cutting between p1 and p2 drops the whole p-block.
        let mut conv = Conversation::new(1, "agent_a");
        for m in history.iter().cloned() {
            conv.push(m);
        }
        conv.trim_to_last_n(7);
        assert_eq!(conv.len(), 5);
        assert!(conv.messages()[0].has_image());
    }

    #[test]
    fn test_trim_consecutive_tool_rounds() {
        let history = vec![
            ChatMessage::user("log in"),
            assistant_calls(&["a"]),
            ChatMessage::tool_result("a", "ok"),
            assistant_calls(&["b"]),
            ChatMessage::tool_result("b", "ok"),
            assistant_calls(&["c", "d"]),
            ChatMessage::tool_result("c", "ok"),
            ChatMessage::tool_result("d", "ok"),
            assistant_calls(&["e"]),
            ChatMessage::tool_result("e", "ok"),
            ChatMessage::assistant("logged in"),
        ];
        assert_trims_cleanly(&history);

        // A cut on a complete round keeps it whole.
        let mut conv = Conversation::new(1, "agent_a");
        for m in history.iter().cloned() {
            conv.push(m);
        }
        conv.trim_to_last_n(6);
        assert!(conv.messages()[0].has_tool_calls());
        assert_eq!(conv.len(), 6);
    }

    #[test]
    fn test_trim_noop_when_short() {
        let mut conv = Conversation::new(1, "agent_a");
        conv.push(ChatMessage::user("hi"));
        conv.trim_to_last_n(20);
        assert_eq!(conv.len(), 1);
    }

    #[test]
    fn test_clean_removes_broken_pairs() {
        let messages = vec![
            ChatMessage::tool_result("orphan", "stale"),
            ChatMessage::user("go"),
            assistant_calls(&["c1", "c2"]),
            ChatMessage::tool_result("c1", "ok"),
            ChatMessage::user("interrupted"),
            assistant_calls(&["c3"]),
            ChatMessage::tool_result("c3", "ok"),
            ChatMessage::tool_result("stray", "??"),
            ChatMessage::assistant("finished"),
        ];
        let cleaned = validate_and_clean(&messages);
        assert_pairs_intact(&cleaned);

        let roles: Vec<_> = cleaned.iter().map(|m| m.role.as_str()).collect();
        assert_eq!(roles, vec!["user", "user", "assistant", "tool", "assistant"]);
        assert_eq!(cleaned[3].tool_call_id.as_deref(), Some("c3"));
    }

    #[test]
    fn test_clean_is_idempotent() {
        let mut messages = sample_history();
        messages.insert(3, ChatMessage::user("cut in"));
        messages.push(assistant_calls(&["dangling"]));
        let once = validate_and_clean(&messages);
        let twice = validate_and_clean(&once);
        assert_eq!(once, twice);

        let clean = sample_history();
        assert_eq!(validate_and_clean(&clean), clean);
    }

    #[test]
    fn test_safe_start_skips_incomplete_opening_exchange() {
        let history = vec![
            ChatMessage::tool_result("c0", "ok"),
            assistant_calls(&["c1", "c2"]),
            ChatMessage::tool_result("c1", "ok"),
            ChatMessage::user("next"),
        ];
        assert_eq!(find_safe_history_start(&history), 3);
    }

    #[tokio::test]
    async fn test_manager_keys_by_user_and_agent() {
        let manager = ConversationManager::new();
        let a = manager.get_or_create(1, "agent_a");
        let b = manager.get_or_create(1, "agent_b");
        a.lock().await.push(ChatMessage::user("hello a"));

        assert!(b.lock().await.is_empty());
        assert_eq!(manager.get_or_create(1, "agent_a").lock().await.len(), 1);
        assert!(manager.get(2, "agent_a").is_none());

        manager.get_or_create(2, "agent_a");
        assert_eq!(manager.len(), 3);
    }
}
