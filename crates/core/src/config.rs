use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::Result;
use crate::paths::Paths;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerConfig {
    #[serde(default = "default_server_host")]
    pub host: String,
    #[serde(default = "default_server_port")]
    pub port: u16,
    /// Directory with the phone web client, served at `/` when set.
    #[serde(default)]
    pub web_dir: Option<String>,
    #[serde(default)]
    pub allowed_origins: Vec<String>,
    /// Mark the session cookie `Secure`. Disable for plain-HTTP development.
    #[serde(default = "default_true")]
    pub secure_cookies: bool,
}

fn default_server_host() -> String {
    "0.0.0.0".to_string()
}

fn default_server_port() -> u16 {
    8080
}

fn default_true() -> bool {
    true
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_server_host(),
            port: default_server_port(),
            web_dir: None,
            allowed_origins: vec![],
            secure_cookies: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LlmConfig {
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_api_base")]
    pub api_base: String,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_llm_timeout_secs")]
    pub timeout_secs: u64,
    /// `None` follows `HTTPS_PROXY`, `Some("")` forces a direct connection.
    #[serde(default)]
    pub proxy: Option<String>,
    /// Hosts that bypass `proxy` (`host`, `*.domain`, `.domain`).
    #[serde(default)]
    pub no_proxy: Vec<String>,
}

fn default_api_base() -> String {
    "https://api.openai.com/v1".to_string()
}

fn default_model() -> String {
    "gpt-4o".to_string()
}

fn default_max_tokens() -> u32 {
    4096
}

fn default_temperature() -> f32 {
    0.2
}

fn default_llm_timeout_secs() -> u64 {
    120
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            api_base: default_api_base(),
            model: default_model(),
            max_tokens: default_max_tokens(),
            temperature: default_temperature(),
            timeout_secs: default_llm_timeout_secs(),
            proxy: None,
            no_proxy: vec![],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HubConfig {
    /// Outbound queue depth per connection.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    #[serde(default = "default_heartbeat_secs")]
    pub heartbeat_secs: u64,
    /// Cached screenshots younger than this are served without a round trip.
    #[serde(default = "default_screenshot_fresh_ms")]
    pub screenshot_fresh_ms: u64,
    #[serde(default = "default_pairing_code_ttl_secs")]
    pub pairing_code_ttl_secs: u64,
    #[serde(default = "default_pairing_cleanup_secs")]
    pub pairing_cleanup_secs: u64,
}

fn default_queue_capacity() -> usize {
    256
}

fn default_heartbeat_secs() -> u64 {
    30
}

fn default_screenshot_fresh_ms() -> u64 {
    3000
}

fn default_pairing_code_ttl_secs() -> u64 {
    300
}

fn default_pairing_cleanup_secs() -> u64 {
    60
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            queue_capacity: default_queue_capacity(),
            heartbeat_secs: default_heartbeat_secs(),
            screenshot_fresh_ms: default_screenshot_fresh_ms(),
            pairing_code_ttl_secs: default_pairing_code_ttl_secs(),
            pairing_cleanup_secs: default_pairing_cleanup_secs(),
        }
    }
}

impl HubConfig {
    pub fn freshness(&self) -> Duration {
        Duration::from_millis(self.screenshot_fresh_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatConfig {
    #[serde(default = "default_max_tool_iterations")]
    pub max_tool_iterations: u32,
    /// Conversation length kept after each chat turn.
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,
    #[serde(default = "default_initial_screenshot_timeout_secs")]
    pub initial_screenshot_timeout_secs: u64,
    #[serde(default = "default_screenshot_timeout_secs")]
    pub screenshot_timeout_secs: u64,
    #[serde(default = "default_page_state_timeout_secs")]
    pub page_state_timeout_secs: u64,
    /// Pause after an action before observing its effect.
    #[serde(default = "default_action_settle_ms")]
    pub action_settle_ms: u64,
}

fn default_max_tool_iterations() -> u32 {
    10
}

fn default_history_limit() -> usize {
    20
}

fn default_initial_screenshot_timeout_secs() -> u64 {
    5
}

fn default_screenshot_timeout_secs() -> u64 {
    15
}

fn default_page_state_timeout_secs() -> u64 {
    10
}

fn default_action_settle_ms() -> u64 {
    1000
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            max_tool_iterations: default_max_tool_iterations(),
            history_limit: default_history_limit(),
            initial_screenshot_timeout_secs: default_initial_screenshot_timeout_secs(),
            screenshot_timeout_secs: default_screenshot_timeout_secs(),
            page_state_timeout_secs: default_page_state_timeout_secs(),
            action_settle_ms: default_action_settle_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthConfig {
    #[serde(default = "default_session_ttl_days")]
    pub session_ttl_days: u64,
    /// Account created at startup when it does not exist yet.
    #[serde(default)]
    pub default_username: Option<String>,
    #[serde(default)]
    pub default_password: Option<String>,
}

fn default_session_ttl_days() -> u64 {
    7
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            session_ttl_days: default_session_ttl_days(),
            default_username: None,
            default_password: None,
        }
    }
}

/// Settings for the desktop side (`relay agent`).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentClientConfig {
    #[serde(default = "default_server_url")]
    pub server_url: String,
    #[serde(default)]
    pub agent_token: String,
    #[serde(default = "default_agent_name")]
    pub agent_name: String,
    #[serde(default)]
    pub paired: bool,
    #[serde(default)]
    pub headed: bool,
    #[serde(default = "default_dom_poll_secs")]
    pub dom_poll_secs: u64,
    #[serde(default = "default_reconnect_secs")]
    pub reconnect_secs: u64,
}

fn default_server_url() -> String {
    "ws://127.0.0.1:8080/ws/agent".to_string()
}

fn default_agent_name() -> String {
    "My Computer".to_string()
}

fn default_dom_poll_secs() -> u64 {
    2
}

fn default_reconnect_secs() -> u64 {
    5
}

impl Default for AgentClientConfig {
    fn default() -> Self {
        Self {
            server_url: default_server_url(),
            agent_token: String::new(),
            agent_name: default_agent_name(),
            paired: false,
            headed: false,
            dom_poll_secs: default_dom_poll_secs(),
            reconnect_secs: default_reconnect_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub hub: HubConfig,
    #[serde(default)]
    pub chat: ChatConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub agent: AgentClientConfig,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = serde_json::from_str(&content)?;
        Ok(config)
    }

    pub fn load_or_default(paths: &Paths) -> Result<Self> {
        let config_path = paths.config_file();
        if config_path.exists() {
            Self::load(&config_path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Apply `OPENAI_API_KEY`, `OPENAI_MODEL`, `OPENAI_API_BASE` and `PORT`.
    pub fn apply_env(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(key) = lookup("OPENAI_API_KEY").filter(|v| !v.trim().is_empty()) {
            self.llm.api_key = key;
        }
        if let Some(model) = lookup("OPENAI_MODEL").filter(|v| !v.trim().is_empty()) {
            self.llm.model = model;
        }
        if let Some(base) = lookup("OPENAI_API_BASE").filter(|v| !v.trim().is_empty()) {
            self.llm.api_base = base;
        }
        if let Some(port) = lookup("PORT").and_then(|v| v.trim().parse::<u16>().ok()) {
            self.server.port = port;
        }
    }
}
