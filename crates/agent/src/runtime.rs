use relay_core::config::ChatConfig;
use relay_core::protocol::{ActionInfo, ChatResponse, UserEvent};
use relay_core::short_token;
use relay_core::types::ChatMessage;
use relay_hub::Hub;
use relay_providers::Provider;
use relay_tools::{error_text, BrowserControl, ToolContext, ToolExecutor, ToolRegistry};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::conversation::ConversationManager;
use crate::prompt::SYSTEM_PROMPT;
use crate::proxy::HubBrowserControl;

const AFTER_ACTION_CAPTION: &str = "這是執行操作後的截圖";

/// How a chat turn ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChatOutcome {
    /// The model answered without further tool calls.
    Done { iterations: u32 },
    /// The model was still calling tools when the iteration cap was hit.
    IterationCap,
    /// The turn was refused or aborted; the user has been told why.
    Failed,
}

/// Drives the model ↔ browser tool loop for chat messages.
pub struct ChatRuntime {
    hub: Arc<Hub>,
    provider: Arc<dyn Provider>,
    registry: Arc<ToolRegistry>,
    conversations: ConversationManager,
    config: ChatConfig,
}

impl ChatRuntime {
    pub fn new(hub: Arc<Hub>, provider: Arc<dyn Provider>, config: ChatConfig) -> Self {
        Self {
            hub,
            provider,
            registry: Arc::new(ToolRegistry::with_defaults()),
            conversations: ConversationManager::new(),
            config,
        }
    }

    pub fn conversations(&self) -> &ConversationManager {
        &self.conversations
    }

    fn emit(&self, user_id: i64, response: ChatResponse) {
        self.hub
            .send_user_event(user_id, &UserEvent::ChatResponse(response));
    }

    /// Entry point for a `chat_message` from a user connection.
    pub async fn handle_message(&self, user_id: i64, message: &str) -> ChatOutcome {
        let Some(agent_token) = self.hub.get_viewing(user_id) else {
            self.emit(user_id, ChatResponse::error("請先選擇一個 Agent"));
            return ChatOutcome::Failed;
        };
        if !self.hub.is_agent_online(&agent_token) {
            self.emit(user_id, ChatResponse::error("Agent 離線中"));
            return ChatOutcome::Failed;
        }
        self.run_chat(user_id, &agent_token, message).await
    }

    /// Empty the conversation with the agent the user is viewing. Waits for
    /// a running turn on that conversation to finish first.
    pub async fn clear_conversation(&self, user_id: i64) -> bool {
        let Some(agent_token) = self.hub.get_viewing(user_id) else {
            return false;
        };
        if let Some(conversation) = self.conversations.get(user_id, &agent_token) {
            conversation.lock().await.clear();
        }
        info!(user_id, agent = %short_token(&agent_token), "Conversation cleared");
        self.emit(user_id, ChatResponse::system("對話已清除"));
        true
    }

    pub async fn run_chat(&self, user_id: i64, agent_token: &str, message: &str) -> ChatOutcome {
        let conversation = self.conversations.get_or_create(user_id, agent_token);
        let mut conv = conversation.lock().await;
        info!(user_id, agent = %short_token(agent_token), "Chat message received");

        let browser = Arc::new(
            HubBrowserControl::new(self.hub.clone(), agent_token).with_timeouts(
                Duration::from_secs(self.config.screenshot_timeout_secs),
                Duration::from_secs(self.config.page_state_timeout_secs),
            ),
        );
        let executor = ToolExecutor::new(
            self.registry.clone(),
            ToolContext {
                browser: browser.clone(),
            },
        );

        let screenshot = match self.hub.get_cached(agent_token) {
            Some((image, _)) => Some(image),
            None => {
                let timeout = Duration::from_secs(self.config.initial_screenshot_timeout_secs);
                match self.hub.request_sync(agent_token, timeout).await {
                    Ok(image) => Some(image),
                    Err(e) => {
                        warn!(agent = %short_token(agent_token), error = %e, "No screenshot for chat turn");
                        None
                    }
                }
            }
        };
        match &screenshot {
            Some(image) => {
                conv.push(ChatMessage::user_with_image(message, image));
                self.emit(user_id, ChatResponse::screenshot(image));
            }
            None => conv.push(ChatMessage::user(message)),
        }

        conv.trim_to_last_n(self.config.history_limit);

        let tools = self.registry.get_tool_schemas();
        let max_iterations = self.config.max_tool_iterations;
        let settle = Duration::from_millis(self.config.action_settle_ms);

        for iteration in 0..max_iterations {
            debug!(iteration, "LLM call iteration");
            let mut messages = vec![ChatMessage::system(SYSTEM_PROMPT)];
            messages.extend(conv.cleaned());

            let response = match self.provider.chat(&messages, &tools).await {
                Ok(r) => r,
                Err(e) => {
                    warn!(error = %e, iteration, "LLM call failed");
                    self.emit(
                        user_id,
                        ChatResponse::error(&format!("AI 服務發生錯誤: {}", error_text(&e))),
                    );
                    return ChatOutcome::Failed;
                }
            };

            let text = response.text().to_string();
            info!(
                iteration,
                content_len = text.len(),
                tool_calls_count = response.tool_calls.len(),
                "LLM response received"
            );
            if !text.is_empty() {
                self.emit(user_id, ChatResponse::assistant(&text));
            }

            if response.tool_calls.is_empty() {
                if !text.is_empty() {
                    conv.push(ChatMessage::assistant(&text));
                }
                info!(user_id, iterations = iteration + 1, "Chat completed");
                return ChatOutcome::Done {
                    iterations: iteration + 1,
                };
            }

            conv.push(ChatMessage::assistant_with_tool_calls(
                &text,
                response.tool_calls.clone(),
            ));

            let report = executor.execute_tool_calls(&response.tool_calls).await;
            if !report.actions.is_empty() {
                let actions = report
                    .actions
                    .iter()
                    .map(|d| ActionInfo::succeeded(d))
                    .collect();
                self.emit(user_id, ChatResponse::actions(actions));
            }
            for (call, result) in response.tool_calls.iter().zip(&report.results) {
                let mut msg = ChatMessage::tool_result(&result.tool_call_id, &result.content);
                msg.name = Some(call.name.clone());
                conv.push(msg);
            }

            if let Some(image) = &report.screenshot {
                self.emit(user_id, ChatResponse::screenshot(image));
            }

            let acted = response
                .tool_calls
                .iter()
                .any(|tc| tc.name != "take_screenshot");
            if !acted {
                if let Some(image) = report.screenshot {
                    conv.push(ChatMessage::user_with_image(AFTER_ACTION_CAPTION, &image));
                }
                continue;
            }

            // Only frames from the agent enter the cache; a stale fallback
            // here keeps its original age.
            tokio::time::sleep(settle).await;
            match browser.screenshot().await {
                Ok(image) => {
                    self.emit(user_id, ChatResponse::screenshot(&image));
                    conv.push(ChatMessage::user_with_image(AFTER_ACTION_CAPTION, &image));
                }
                Err(e) => warn!(error = %e, "Screenshot after actions failed"),
            }
        }

        warn!(user_id, max_iterations, "Reached max tool iterations");
        ChatOutcome::IterationCap
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use relay_core::config::HubConfig;
    use relay_core::types::{LLMResponse, ToolCallRequest};
    use relay_core::{Error, Result};
    use relay_storage::AgentDirectory;
    use serde_json::{json, Value};
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use tokio::sync::mpsc;

    struct NoOwners;

    impl AgentDirectory for NoOwners {
        fn owner_of(&self, _token: &str) -> Result<Option<i64>> {
            Ok(None)
        }

        fn touch_last_seen(&self, _token: &str) -> Result<()> {
            Ok(())
        }
    }

    /// Replays scripted responses; repeats the last one when the script
    /// runs out.
    struct ScriptedProvider {
        script: Mutex<VecDeque<Result<LLMResponse>>>,
        last: Mutex<Option<LLMResponse>>,
        calls: Mutex<Vec<Vec<ChatMessage>>>,
    }

    impl ScriptedProvider {
        fn new(script: Vec<Result<LLMResponse>>) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(script.into()),
                last: Mutex::new(None),
                calls: Mutex::new(Vec::new()),
            })
        }

        fn call_count(&self) -> usize {
            self.calls.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl Provider for ScriptedProvider {
        async fn chat(&self, messages: &[ChatMessage], _tools: &[Value]) -> Result<LLMResponse> {
            self.calls.lock().unwrap().push(messages.to_vec());
            let next = self.script.lock().unwrap().pop_front();
            match next {
                Some(Ok(r)) => {
                    *self.last.lock().unwrap() = Some(r.clone());
                    Ok(r)
                }
                Some(Err(e)) => Err(e),
                None => self
                    .last
                    .lock()
                    .unwrap()
                    .clone()
                    .ok_or_else(|| Error::Provider("script exhausted".into())),
            }
        }
    }

    fn text(content: &str) -> Result<LLMResponse> {
        Ok(LLMResponse {
            content: Some(content.into()),
            finish_reason: "stop".into(),
            ..Default::default()
        })
    }

    fn tool_call(id: &str, name: &str, arguments: Value) -> Result<LLMResponse> {
        Ok(LLMResponse {
            tool_calls: vec![ToolCallRequest {
                id: id.into(),
                name: name.into(),
                arguments,
            }],
            finish_reason: "tool_calls".into(),
            ..Default::default()
        })
    }

    fn drain(rx: &mut mpsc::Receiver<String>) -> Vec<Value> {
        let mut out = Vec::new();
        while let Ok(msg) = rx.try_recv() {
            out.push(serde_json::from_str(&msg).unwrap());
        }
        out
    }

    fn setup(provider: Arc<ScriptedProvider>) -> (Arc<Hub>, ChatRuntime) {
        let hub = Arc::new(Hub::new(Arc::new(NoOwners), HubConfig::default()));
        let runtime = ChatRuntime::new(hub.clone(), provider, ChatConfig::default());
        (hub, runtime)
    }

    #[tokio::test(start_paused = true)]
    async fn test_screenshot_streamed_before_llm_reply() {
        let provider = ScriptedProvider::new(vec![text("我會點擊登入按鈕")]);
        let (hub, runtime) = setup(provider.clone());
        let _agent = hub.register_agent("agent_a");
        let mut user = hub.register_user(7);
        hub.set_viewing(7, "agent_a");
        hub.update_cache("agent_a", "AAA");

        let outcome = runtime.handle_message(7, "點擊登入按鈕").await;
        assert_eq!(outcome, ChatOutcome::Done { iterations: 1 });

        let events = drain(&mut user.outbound);
        assert_eq!(events[0]["type"], "chat_response");
        assert_eq!(events[0]["role"], "system");
        assert_eq!(events[0]["screenshot"], "AAA");
        assert_eq!(events[1]["role"], "assistant");
        assert_eq!(events[1]["content"], "我會點擊登入按鈕");

        // The model saw the system prompt and the screenshot with the request.
        let sent = &provider.calls.lock().unwrap()[0];
        assert_eq!(sent[0].role, "system");
        assert!(sent[1].has_image());
    }

    #[tokio::test(start_paused = true)]
    async fn test_iteration_cap_is_soft() {
        let provider = ScriptedProvider::new(vec![tool_call("c1", "take_screenshot", json!({}))]);
        let (hub, runtime) = setup(provider.clone());
        let _agent = hub.register_agent("agent_a");
        let mut user = hub.register_user(7);
        hub.set_viewing(7, "agent_a");
        hub.update_cache("agent_a", "AAA");

        let outcome = runtime.handle_message(7, "一直截圖").await;
        assert_eq!(outcome, ChatOutcome::IterationCap);
        assert_eq!(provider.call_count(), 10);

        let events = drain(&mut user.outbound);
        assert!(events.iter().all(|e| e["is_error"].is_null()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_llm_failure_aborts_with_message() {
        let provider = ScriptedProvider::new(vec![Err(Error::Provider("OPENAI_API_KEY not set".into()))]);
        let (hub, runtime) = setup(provider.clone());
        let _agent = hub.register_agent("agent_a");
        let mut user = hub.register_user(7);
        hub.set_viewing(7, "agent_a");
        hub.update_cache("agent_a", "AAA");

        assert_eq!(runtime.handle_message(7, "hi").await, ChatOutcome::Failed);
        let events = drain(&mut user.outbound);
        let last = events.last().unwrap();
        assert_eq!(last["content"], "AI 服務發生錯誤: OPENAI_API_KEY not set");
        assert_eq!(last["is_error"], true);
        assert_eq!(provider.call_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_action_round_trip() {
        let provider = ScriptedProvider::new(vec![
            tool_call("c1", "type_text", json!({"text": "Enter"})),
            text("完成"),
        ]);
        let (hub, runtime) = setup(provider.clone());
        let mut agent = hub.register_agent("agent_a");
        let mut user = hub.register_user(7);
        hub.set_viewing(7, "agent_a");
        hub.update_cache("agent_a", "AAA");

        let outcome = runtime.handle_message(7, "送出").await;
        assert_eq!(outcome, ChatOutcome::Done { iterations: 2 });

        let cmd: Value = serde_json::from_str(&agent.outbound.try_recv().unwrap()).unwrap();
        assert_eq!(cmd, json!({"type": "key", "key": "Enter"}));

        let events = drain(&mut user.outbound);
        let actions: Vec<_> = events.iter().filter(|e| e["actions"].is_array()).collect();
        assert_eq!(actions.len(), 1);
        assert_eq!(actions[0]["actions"][0]["description"], "已按下按鍵: Enter (自動轉換)");
        assert_eq!(actions[0]["actions"][0]["success"], true);

        let conv = runtime.conversations().get(7, "agent_a").unwrap();
        let conv = conv.lock().await;
        let roles: Vec<_> = conv.messages().iter().map(|m| m.role.as_str()).collect();
        assert_eq!(roles, vec!["user", "assistant", "tool", "user", "assistant"]);
        assert!(conv.messages()[3].has_image());
    }

    #[tokio::test]
    async fn test_requires_viewed_online_agent() {
        let provider = ScriptedProvider::new(vec![text("unused")]);
        let (hub, runtime) = setup(provider.clone());
        let mut user = hub.register_user(7);

        assert_eq!(runtime.handle_message(7, "hi").await, ChatOutcome::Failed);
        hub.set_viewing(7, "agent_a");
        assert_eq!(runtime.handle_message(7, "hi").await, ChatOutcome::Failed);

        let events = drain(&mut user.outbound);
        assert_eq!(events[0]["content"], "請先選擇一個 Agent");
        assert_eq!(events[1]["content"], "Agent 離線中");
        assert_eq!(provider.call_count(), 0);
    }

    #[tokio::test]
    async fn test_clear_conversation() {
        let provider = ScriptedProvider::new(vec![text("ok")]);
        let (hub, runtime) = setup(provider);
        let mut user = hub.register_user(7);
        assert!(!runtime.clear_conversation(7).await);

        hub.set_viewing(7, "agent_a");
        let conversation = runtime.conversations().get_or_create(7, "agent_a");
        conversation.lock().await.push(ChatMessage::user("hello"));
        assert!(runtime.clear_conversation(7).await);

        assert!(conversation.lock().await.is_empty());
        let kept = runtime.conversations().get(7, "agent_a").unwrap();
        assert!(Arc::ptr_eq(&conversation, &kept));
        let events = drain(&mut user.outbound);
        assert_eq!(events[0]["content"], "對話已清除");
    }

    #[tokio::test(start_paused = true)]
    async fn test_clear_waits_for_running_turn() {
        let provider = ScriptedProvider::new(vec![text("ok")]);
        let (hub, runtime) = setup(provider.clone());
        let _agent = hub.register_agent("agent_a");
        let mut user = hub.register_user(7);
        hub.set_viewing(7, "agent_a");
        hub.update_cache("agent_a", "AAA");

        let conversation = runtime.conversations().get_or_create(7, "agent_a");
        let running = conversation.lock().await;
        let wait = Duration::from_secs(5);
        assert!(tokio::time::timeout(wait, runtime.clear_conversation(7)).await.is_err());
        assert!(tokio::time::timeout(wait, runtime.handle_message(7, "second")).await.is_err());
        assert_eq!(provider.call_count(), 0);
        assert!(drain(&mut user.outbound).is_empty());
        drop(running);

        assert!(runtime.clear_conversation(7).await);
        assert_eq!(runtime.handle_message(7, "second").await, ChatOutcome::Done { iterations: 1 });
        assert_eq!(provider.call_count(), 1);
        let conv = runtime.conversations().get(7, "agent_a").unwrap();
        assert!(Arc::ptr_eq(&conversation, &conv));
        assert_eq!(conv.lock().await.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_fallback_keeps_cache_age() {
        let provider = ScriptedProvider::new(vec![
            tool_call("c1", "click", json!({"x": 10, "y": 20, "description": "登入"})),
            text("完成"),
        ]);
        let (hub, runtime) = setup(provider);
        let mut agent = hub.register_agent("agent_a");
        let _user = hub.register_user(7);
        hub.set_viewing(7, "agent_a");
        hub.update_cache("agent_a", "OLD");
        tokio::time::advance(Duration::from_secs(60)).await;

        // The agent never answers, so the after-action screenshot times out
        // onto the cached frame.
        let outcome = runtime.handle_message(7, "點擊登入").await;
        assert_eq!(outcome, ChatOutcome::Done { iterations: 2 });
        let (image, updated_at) = hub.get_cached("agent_a").unwrap();
        assert_eq!(image, "OLD");
        assert!(updated_at.elapsed() >= Duration::from_secs(60));

        while agent.outbound.try_recv().is_ok() {}
        let served = hub.request_sync("agent_a", Duration::from_secs(1)).await.unwrap();
        assert_eq!(served, "OLD");
        let asked = drain(&mut agent.outbound);
        assert!(asked.iter().any(|c| c["type"] == "request_screenshot"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_mixed_batch_streams_both_screenshots() {
        let provider = ScriptedProvider::new(vec![
            Ok(LLMResponse {
                tool_calls: vec![
                    ToolCallRequest {
                        id: "c1".into(),
                        name: "take_screenshot".into(),
                        arguments: json!({}),
                    },
                    ToolCallRequest {
                        id: "c2".into(),
                        name: "scroll".into(),
                        arguments: json!({"direction": "down"}),
                    },
                ],
                finish_reason: "tool_calls".into(),
                ..Default::default()
            }),
            text("已捲動"),
        ]);
        let (hub, runtime) = setup(provider);
        let _agent = hub.register_agent("agent_a");
        let mut user = hub.register_user(7);
        hub.set_viewing(7, "agent_a");
        hub.update_cache("agent_a", "AAA");

        let outcome = runtime.handle_message(7, "往下捲").await;
        assert_eq!(outcome, ChatOutcome::Done { iterations: 2 });

        // Opening frame, the take_screenshot result, then the after-action frame.
        let events = drain(&mut user.outbound);
        let screenshots = events.iter().filter(|e| e["screenshot"].is_string()).count();
        assert_eq!(screenshots, 3);
    }
}
