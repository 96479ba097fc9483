//! Applying server commands to the local browser.

use relay_core::protocol::AgentCommand;
use std::time::Duration;
use tracing::{info, warn};

use crate::driver::BrowserDriver;

/// What the agent should report back after a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Followup {
    Nothing,
    Screenshot,
    PageState,
}

/// How long the page is given to react before the follow-up screenshot.
fn settle_delay(cmd: &AgentCommand) -> Duration {
    match cmd {
        AgentCommand::Click { .. } | AgentCommand::ClickXy { .. } => Duration::from_millis(500),
        AgentCommand::Key { .. } | AgentCommand::Scroll { .. } => Duration::from_millis(300),
        AgentCommand::SelectAll => Duration::from_millis(200),
        _ => Duration::ZERO,
    }
}

/// Run one browser command. Failures are logged and, except for
/// navigation, still followed by a screenshot so the user sees the page.
pub async fn execute_command(driver: &dyn BrowserDriver, cmd: &AgentCommand) -> Followup {
    let outcome = match cmd {
        AgentCommand::Navigate { url } => {
            info!(url = %url, "Navigating");
            if url.is_empty() {
                warn!("Navigation skipped: empty URL");
                return Followup::Nothing;
            }
            if let Err(e) = driver.navigate(url).await {
                warn!(url = %url, error = %e, "Navigation failed");
                return Followup::Nothing;
            }
            Ok(())
        }
        AgentCommand::Click { selector } => {
            info!(selector = %selector, "Click");
            driver.click_selector(selector).await
        }
        AgentCommand::ClickXy { x, y } => {
            info!(x, y, "Click at coordinates");
            driver.click_xy(*x, *y).await
        }
        AgentCommand::Input { value, selector } => {
            info!(chars = value.chars().count(), "Input");
            driver.input(selector.as_deref(), value).await
        }
        AgentCommand::Key { key } => {
            info!(key = %key, "Key press");
            driver.press_key(key).await
        }
        AgentCommand::Scroll { direction, amount } => {
            info!(direction = direction.as_str(), amount, "Scroll");
            driver.scroll(*direction, *amount).await
        }
        AgentCommand::SelectAll => {
            info!("Select all");
            driver.select_all().await
        }
        AgentCommand::GetPageState => return Followup::PageState,
        AgentCommand::RequestScreenshot => return Followup::Screenshot,
        AgentCommand::PairingCode { .. } | AgentCommand::Paired { .. } => return Followup::Nothing,
    };

    if let Err(e) = outcome {
        warn!(command = cmd.kind(), error = %e, "Browser command failed");
    }
    let delay = settle_delay(cmd);
    if !delay.is_zero() {
        tokio::time::sleep(delay).await;
    }
    Followup::Screenshot
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use relay_core::protocol::{DomSnapshot, ScreenshotFrame, ScrollDirection};
    use relay_core::{Error, Result};
    use serde_json::{json, Value};
    use std::sync::Mutex;
    use tokio::time::Instant;

    #[derive(Default)]
    struct RecordingDriver {
        calls: Mutex<Vec<String>>,
        fail: bool,
    }

    impl RecordingDriver {
        fn record(&self, call: String) -> Result<()> {
            self.calls.lock().unwrap().push(call);
            if self.fail {
                Err(Error::Browser("boom".to_string()))
            } else {
                Ok(())
            }
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl BrowserDriver for RecordingDriver {
        async fn navigate(&self, url: &str) -> Result<()> {
            self.record(format!("navigate {}", url))
        }
        async fn click_selector(&self, selector: &str) -> Result<()> {
            self.record(format!("click {}", selector))
        }
        async fn click_xy(&self, x: i64, y: i64) -> Result<()> {
            self.record(format!("click_xy {} {}", x, y))
        }
        async fn input(&self, selector: Option<&str>, value: &str) -> Result<()> {
            self.record(format!("input {:?} {}", selector, value))
        }
        async fn press_key(&self, key: &str) -> Result<()> {
            self.record(format!("key {}", key))
        }
        async fn scroll(&self, direction: ScrollDirection, amount: u32) -> Result<()> {
            self.record(format!("scroll {} {}", direction.as_str(), amount))
        }
        async fn select_all(&self) -> Result<()> {
            self.record("select_all".to_string())
        }
        async fn page_state(&self) -> Result<Value> {
            Ok(json!({}))
        }
        async fn screenshot(&self) -> Result<ScreenshotFrame> {
            Err(Error::Browser("unused".to_string()))
        }
        async fn dom_snapshot(&self) -> Result<DomSnapshot> {
            Err(Error::Browser("unused".to_string()))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_click_waits_before_screenshot() {
        let driver = RecordingDriver::default();
        let start = Instant::now();
        let followup = execute_command(&driver, &AgentCommand::ClickXy { x: 10, y: 20 }).await;
        assert_eq!(followup, Followup::Screenshot);
        assert!(start.elapsed() >= Duration::from_millis(500));
        assert_eq!(driver.calls(), vec!["click_xy 10 20"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_action_still_reports_screenshot() {
        let driver = RecordingDriver { fail: true, ..Default::default() };
        let cmd = AgentCommand::Scroll { direction: ScrollDirection::Up, amount: 250 };
        assert_eq!(execute_command(&driver, &cmd).await, Followup::Screenshot);
        assert_eq!(driver.calls(), vec!["scroll up 250"]);
    }

    #[tokio::test]
    async fn test_failed_navigation_reports_nothing() {
        let driver = RecordingDriver { fail: true, ..Default::default() };
        let cmd = AgentCommand::Navigate { url: "https://example.com".into() };
        assert_eq!(execute_command(&driver, &cmd).await, Followup::Nothing);

        let empty = AgentCommand::Navigate { url: String::new() };
        assert_eq!(execute_command(&driver, &empty).await, Followup::Nothing);
        assert_eq!(driver.calls().len(), 1);
    }

    #[tokio::test]
    async fn test_queries_do_not_touch_the_page() {
        let driver = RecordingDriver::default();
        assert_eq!(execute_command(&driver, &AgentCommand::GetPageState).await, Followup::PageState);
        assert_eq!(execute_command(&driver, &AgentCommand::RequestScreenshot).await, Followup::Screenshot);
        assert_eq!(
            execute_command(&driver, &AgentCommand::Paired { user_id: 1 }).await,
            Followup::Nothing
        );
        assert!(driver.calls().is_empty());
    }

    #[tokio::test]
    async fn test_input_passes_selector() {
        let driver = RecordingDriver::default();
        let cmd = AgentCommand::Input { value: "alice".into(), selector: Some("#user".into()) };
        execute_command(&driver, &cmd).await;
        assert_eq!(driver.calls(), vec![r##"input Some("#user") alice"##]);
    }
}
