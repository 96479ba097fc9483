use async_trait::async_trait;
use relay_core::{Error, Result};
use relay_hub::Hub;
use relay_tools::{BrowserAction, BrowserControl};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

/// [`BrowserControl`] for one agent, routed through the hub.
pub struct HubBrowserControl {
    hub: Arc<Hub>,
    agent_token: String,
    screenshot_timeout: Duration,
    page_state_timeout: Duration,
}

impl HubBrowserControl {
    pub fn new(hub: Arc<Hub>, agent_token: &str) -> Self {
        Self {
            hub,
            agent_token: agent_token.to_string(),
            screenshot_timeout: Duration::from_secs(15),
            page_state_timeout: Duration::from_secs(10),
        }
    }

    pub fn with_timeouts(mut self, screenshot: Duration, page_state: Duration) -> Self {
        self.screenshot_timeout = screenshot;
        self.page_state_timeout = page_state;
        self
    }
}

#[async_trait]
impl BrowserControl for HubBrowserControl {
    async fn send_action(&self, action: BrowserAction) -> Result<()> {
        if self.hub.send_command(&self.agent_token, &action.into_command()) {
            Ok(())
        } else {
            Err(Error::NotConnected)
        }
    }

    async fn screenshot(&self) -> Result<String> {
        self.hub
            .request_sync(&self.agent_token, self.screenshot_timeout)
            .await
    }

    async fn page_state(&self) -> Result<Value> {
        self.hub
            .request_page_state_sync(&self.agent_token, self.page_state_timeout)
            .await
    }
}
