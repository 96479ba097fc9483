//! WebSocket wire protocol shared by the server, the desktop agent and the
//! phone client.
//!
//! Every frame is a JSON text message with a `type` discriminator. Control
//! messages carry their payload under `data`; browser commands and agent
//! state updates are flat, with their fields next to `type`.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};

/// User commands relayed to the viewed agent without re-encoding.
pub const FORWARDED_USER_COMMANDS: &[&str] = &[
    "navigate",
    "click",
    "click_xy",
    "input",
    "key",
    "request_screenshot",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScrollDirection {
    Up,
    Down,
}

impl ScrollDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScrollDirection::Up => "up",
            ScrollDirection::Down => "down",
        }
    }
}

fn default_scroll_amount() -> u32 {
    500
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PairingCodeData {
    pub code: String,
    pub expires_in: u64,
}

/// Server → agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentCommand {
    PairingCode { data: PairingCodeData },
    Paired { user_id: i64 },
    Navigate { url: String },
    /// Click by CSS selector; only issued by the phone client directly.
    Click { selector: String },
    ClickXy { x: i64, y: i64 },
    Input {
        value: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        selector: Option<String>,
    },
    Key { key: String },
    Scroll {
        direction: ScrollDirection,
        #[serde(default = "default_scroll_amount")]
        amount: u32,
    },
    SelectAll,
    RequestScreenshot,
    GetPageState,
}

impl AgentCommand {
    pub fn parse(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Wire `type` of this command.
    pub fn kind(&self) -> &'static str {
        match self {
            AgentCommand::PairingCode { .. } => "pairing_code",
            AgentCommand::Paired { .. } => "paired",
            AgentCommand::Navigate { .. } => "navigate",
            AgentCommand::Click { .. } => "click",
            AgentCommand::ClickXy { .. } => "click_xy",
            AgentCommand::Input { .. } => "input",
            AgentCommand::Key { .. } => "key",
            AgentCommand::Scroll { .. } => "scroll",
            AgentCommand::SelectAll => "select_all",
            AgentCommand::RequestScreenshot => "request_screenshot",
            AgentCommand::GetPageState => "get_page_state",
        }
    }

    /// Whether the agent answers this command with a fresh screenshot.
    pub fn changes_page(&self) -> bool {
        matches!(
            self,
            AgentCommand::Navigate { .. }
                | AgentCommand::Click { .. }
                | AgentCommand::ClickXy { .. }
                | AgentCommand::Input { .. }
                | AgentCommand::Key { .. }
                | AgentCommand::Scroll { .. }
                | AgentCommand::SelectAll
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthData {
    pub token: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScreenshotFrame {
    #[serde(default)]
    pub url: String,
    pub image: String,
    #[serde(default)]
    pub width: u32,
    #[serde(default)]
    pub height: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DomSnapshot {
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub html: String,
}

/// Agent → server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentMessage {
    Auth { data: AuthData },
    RequestPairingCode,
    Screenshot(ScreenshotFrame),
    DomUpdate(DomSnapshot),
    PageState { state: Value },
}

impl AgentMessage {
    pub fn parse(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Generic `{type, data?}` frame.
#[derive(Debug, Clone, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub data: Option<Value>,
}

/// User → server, after classification.
#[derive(Debug, Clone, PartialEq)]
pub enum UserRequest {
    ConnectAgent { agent_token: String },
    Chat { message: String },
    ClearConversation,
    /// A browser command to relay verbatim to the viewed agent.
    Forward { kind: String },
    Unknown { kind: String },
}

impl UserRequest {
    pub fn parse(text: &str) -> Result<Self> {
        let envelope: Envelope = serde_json::from_str(text)?;
        let data_str = |field: &str| -> Option<String> {
            envelope
                .data
                .as_ref()
                .and_then(|d| d.get(field))
                .and_then(|v| v.as_str())
                .map(|s| s.to_string())
        };

        match envelope.kind.as_str() {
            "connect_agent" => data_str("agent_token")
                .map(|agent_token| UserRequest::ConnectAgent { agent_token })
                .ok_or_else(|| Error::Validation("connect_agent requires data.agent_token".to_string())),
            "chat_message" => data_str("message")
                .map(|message| UserRequest::Chat { message })
                .ok_or_else(|| Error::Validation("Invalid chat message format".to_string())),
            "clear_conversation" => Ok(UserRequest::ClearConversation),
            kind if FORWARDED_USER_COMMANDS.contains(&kind) => Ok(UserRequest::Forward {
                kind: kind.to_string(),
            }),
            kind => Ok(UserRequest::Unknown { kind: kind.to_string() }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionInfo {
    #[serde(rename = "type")]
    pub kind: String,
    pub description: String,
    pub success: bool,
}

impl ActionInfo {
    pub fn succeeded(description: &str) -> Self {
        Self {
            kind: "action".to_string(),
            description: description.to_string(),
            success: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ChatResponse {
    pub role: String,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub screenshot: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub actions: Vec<ActionInfo>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub is_error: bool,
}

impl ChatResponse {
    pub fn assistant(content: &str) -> Self {
        Self {
            role: "assistant".to_string(),
            content: content.to_string(),
            ..Default::default()
        }
    }

    pub fn system(content: &str) -> Self {
        Self {
            role: "system".to_string(),
            content: content.to_string(),
            ..Default::default()
        }
    }

    pub fn screenshot(image: &str) -> Self {
        Self {
            role: "system".to_string(),
            screenshot: Some(image.to_string()),
            ..Default::default()
        }
    }

    pub fn actions(actions: Vec<ActionInfo>) -> Self {
        Self {
            role: "system".to_string(),
            actions,
            ..Default::default()
        }
    }

    pub fn error(content: &str) -> Self {
        Self {
            role: "system".to_string(),
            content: content.to_string(),
            is_error: true,
            ..Default::default()
        }
    }
}

/// Server → user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum UserEvent {
    AgentStatus { online: bool },
    ChatResponse(ChatResponse),
    Error { error: String },
}

impl UserEvent {
    pub fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}
