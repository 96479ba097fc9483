use async_trait::async_trait;
use relay_core::protocol::{DomSnapshot, ScreenshotFrame, ScrollDirection};
use relay_core::{Error, Result};
use serde_json::{json, Value};
use std::path::Path;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::cdp::CdpClient;
use crate::launch::{ChromeProcess, VIEWPORT_HEIGHT, VIEWPORT_WIDTH};
use crate::scripts;

const NAVIGATION_WAIT: Duration = Duration::from_secs(30);
const SCREENSHOT_QUALITY: u8 = 80;

/// The desktop browser as the agent drives it.
#[async_trait]
pub trait BrowserDriver: Send + Sync {
    async fn navigate(&self, url: &str) -> Result<()>;
    async fn click_selector(&self, selector: &str) -> Result<()>;
    async fn click_xy(&self, x: i64, y: i64) -> Result<()>;
    /// Type into `selector` after clearing it, or into the focused element.
    async fn input(&self, selector: Option<&str>, value: &str) -> Result<()>;
    async fn press_key(&self, key: &str) -> Result<()>;
    async fn scroll(&self, direction: ScrollDirection, amount: u32) -> Result<()>;
    async fn select_all(&self) -> Result<()>;
    async fn page_state(&self) -> Result<Value>;
    async fn screenshot(&self) -> Result<ScreenshotFrame>;
    async fn dom_snapshot(&self) -> Result<DomSnapshot>;
}

/// `Input.dispatchKeyEvent` fields for a named key.
#[derive(Debug, Clone, PartialEq)]
pub struct KeyDefinition {
    pub key: String,
    pub code: String,
    pub key_code: i64,
    pub text: Option<String>,
}

pub fn key_definition(name: &str) -> KeyDefinition {
    let named = |key: &str, code: &str, key_code: i64, text: Option<&str>| KeyDefinition {
        key: key.to_string(),
        code: code.to_string(),
        key_code,
        text: text.map(str::to_string),
    };
    match name.to_ascii_lowercase().as_str() {
        "enter" => named("Enter", "Enter", 13, Some("\r")),
        "tab" => named("Tab", "Tab", 9, None),
        "backspace" => named("Backspace", "Backspace", 8, None),
        "delete" | "del" => named("Delete", "Delete", 46, None),
        "escape" | "esc" => named("Escape", "Escape", 27, None),
        "arrowup" => named("ArrowUp", "ArrowUp", 38, None),
        "arrowdown" => named("ArrowDown", "ArrowDown", 40, None),
        "arrowleft" => named("ArrowLeft", "ArrowLeft", 37, None),
        "arrowright" => named("ArrowRight", "ArrowRight", 39, None),
        "home" => named("Home", "Home", 36, None),
        "end" => named("End", "End", 35, None),
        "pageup" => named("PageUp", "PageUp", 33, None),
        "pagedown" => named("PageDown", "PageDown", 34, None),
        "space" | " " => named(" ", "Space", 32, Some(" ")),
        _ => {
            let mut chars = name.chars();
            match (chars.next(), chars.next()) {
                (Some(c), None) => {
                    let upper = c.to_ascii_uppercase();
                    let code = if upper.is_ascii_alphabetic() {
                        format!("Key{}", upper)
                    } else if upper.is_ascii_digit() {
                        format!("Digit{}", upper)
                    } else {
                        String::new()
                    };
                    let key_code = if upper.is_ascii_alphanumeric() { upper as i64 } else { 0 };
                    KeyDefinition {
                        key: c.to_string(),
                        code,
                        key_code,
                        text: Some(c.to_string()),
                    }
                }
                _ => named(name, "", 0, None),
            }
        }
    }
}

/// [`BrowserDriver`] over a locally launched Chrome.
pub struct CdpBrowser {
    cdp: CdpClient,
    process: Mutex<ChromeProcess>,
    /// Serializes page interactions so actions never interleave.
    op_lock: Mutex<()>,
}

impl CdpBrowser {
    pub async fn launch(user_data_dir: &Path, headed: bool) -> Result<Self> {
        let process = ChromeProcess::launch(user_data_dir, headed).await?;
        let ws_url = process.page_ws_url().await?;
        let cdp = CdpClient::connect(&ws_url).await?;

        cdp.enable_domain("Page").await?;
        cdp.enable_domain("Runtime").await?;
        cdp.set_viewport(VIEWPORT_WIDTH, VIEWPORT_HEIGHT).await?;

        info!(port = process.debug_port, "Browser ready");
        Ok(Self {
            cdp,
            process: Mutex::new(process),
            op_lock: Mutex::new(()),
        })
    }

    pub async fn close(&self) {
        if let Err(e) = self.cdp.send_command("Browser.close", json!({})).await {
            debug!(error = %e, "Browser.close failed (may already be closed)");
        }
        self.process.lock().await.kill().await;
    }

    async fn click_at(&self, x: f64, y: f64) -> Result<()> {
        self.cdp.dispatch_mouse_event("mouseMoved", x, y, "none", 0).await?;
        self.cdp.dispatch_mouse_event("mousePressed", x, y, "left", 1).await?;
        self.cdp.dispatch_mouse_event("mouseReleased", x, y, "left", 1).await
    }
}

#[async_trait]
impl BrowserDriver for CdpBrowser {
    async fn navigate(&self, url: &str) -> Result<()> {
        if url.trim().is_empty() {
            return Err(Error::Validation("URL is empty".to_string()));
        }
        let _guard = self.op_lock.lock().await;
        self.cdp.navigate(url, NAVIGATION_WAIT).await
    }

    async fn click_selector(&self, selector: &str) -> Result<()> {
        let _guard = self.op_lock.lock().await;
        let point = self.cdp.evaluate(&scripts::element_center(selector)).await?;
        let (Some(x), Some(y)) = (
            point.get("x").and_then(|v| v.as_f64()),
            point.get("y").and_then(|v| v.as_f64()),
        ) else {
            return Err(Error::NotFound(format!("No visible element matches {}", selector)));
        };
        self.click_at(x, y).await
    }

    async fn click_xy(&self, x: i64, y: i64) -> Result<()> {
        let _guard = self.op_lock.lock().await;
        self.click_at(x as f64, y as f64).await
    }

    async fn input(&self, selector: Option<&str>, value: &str) -> Result<()> {
        let _guard = self.op_lock.lock().await;
        if let Some(selector) = selector.filter(|s| !s.is_empty()) {
            let found = self.cdp.evaluate(&scripts::focus_and_clear(selector)).await?;
            if found != Value::Bool(true) {
                return Err(Error::NotFound(format!("No element matches {}", selector)));
            }
        }
        self.cdp.insert_text(value).await
    }

    async fn press_key(&self, key: &str) -> Result<()> {
        let _guard = self.op_lock.lock().await;
        let def = key_definition(key);
        let mut down = json!({
            "key": def.key,
            "code": def.code,
            "windowsVirtualKeyCode": def.key_code,
            "nativeVirtualKeyCode": def.key_code,
        });
        if let Some(text) = &def.text {
            down["text"] = json!(text);
        }
        let up = json!({
            "key": def.key,
            "code": def.code,
            "windowsVirtualKeyCode": def.key_code,
            "nativeVirtualKeyCode": def.key_code,
        });
        let down_type = if def.text.is_some() { "keyDown" } else { "rawKeyDown" };
        self.cdp.dispatch_key_event(down_type, down).await?;
        self.cdp.dispatch_key_event("keyUp", up).await
    }

    async fn scroll(&self, direction: ScrollDirection, amount: u32) -> Result<()> {
        let _guard = self.op_lock.lock().await;
        let delta = match direction {
            ScrollDirection::Up => -(amount as i64),
            ScrollDirection::Down => amount as i64,
        };
        self.cdp.evaluate(&scripts::scroll_by(delta)).await?;
        Ok(())
    }

    async fn select_all(&self) -> Result<()> {
        let _guard = self.op_lock.lock().await;
        let outcome = self.cdp.evaluate(scripts::SELECT_ALL).await?;
        debug!(outcome = %outcome, "Select all");
        Ok(())
    }

    async fn page_state(&self) -> Result<Value> {
        let _guard = self.op_lock.lock().await;
        self.cdp.evaluate(scripts::PAGE_STATE).await
    }

    async fn screenshot(&self) -> Result<ScreenshotFrame> {
        let _guard = self.op_lock.lock().await;
        let url = self
            .cdp
            .evaluate(scripts::LOCATION)
            .await?
            .as_str()
            .unwrap_or_default()
            .to_string();
        let data = self.cdp.screenshot_jpeg(SCREENSHOT_QUALITY).await?;
        Ok(ScreenshotFrame {
            url,
            image: format!("data:image/jpeg;base64,{}", data),
            width: VIEWPORT_WIDTH,
            height: VIEWPORT_HEIGHT,
        })
    }

    async fn dom_snapshot(&self) -> Result<DomSnapshot> {
        let _guard = self.op_lock.lock().await;
        let value = self.cdp.evaluate(scripts::DOM_SNAPSHOT).await?;
        Ok(serde_json::from_value(value)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_named_keys() {
        let enter = key_definition("enter");
        assert_eq!(enter.key, "Enter");
        assert_eq!(enter.key_code, 13);
        assert_eq!(enter.text.as_deref(), Some("\r"));

        let tab = key_definition("Tab");
        assert_eq!((tab.key.as_str(), tab.key_code, tab.text), ("Tab", 9, None));

        assert_eq!(key_definition("ESC").key, "Escape");
        assert_eq!(key_definition("ArrowDown").key_code, 40);
    }

    #[test]
    fn test_single_characters() {
        let a = key_definition("a");
        assert_eq!(a.code, "KeyA");
        assert_eq!(a.key_code, 65);
        assert_eq!(a.text.as_deref(), Some("a"));

        let seven = key_definition("7");
        assert_eq!(seven.code, "Digit7");

        let unknown = key_definition("F13");
        assert_eq!(unknown.key, "F13");
        assert!(unknown.text.is_none());
    }
}
