use async_trait::async_trait;
use relay_core::protocol::ScrollDirection;
use relay_core::{Error, Result};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::action::{normalize_key_name, BrowserAction, DEFAULT_SCROLL_AMOUNT};
use crate::{Tool, ToolContext, ToolOutput, ToolSchema};

/// Decode tool arguments, reporting failures in the model's language.
fn parse_args<T: DeserializeOwned>(label: &str, params: Value) -> Result<T> {
    serde_json::from_value(params)
        .map_err(|e| Error::Validation(format!("解析{}參數失敗: {}", label, e)))
}

async fn send(ctx: &ToolContext, action: BrowserAction, failure: &str) -> Result<()> {
    ctx.browser
        .send_action(action)
        .await
        .map_err(|e| Error::Tool(format!("{}: {}", failure, crate::error_text(&e))))
}

fn no_params() -> Value {
    json!({ "type": "object", "properties": {} })
}

pub struct TakeScreenshotTool;

#[async_trait]
impl Tool for TakeScreenshotTool {
    fn schema(&self) -> ToolSchema {
        ToolSchema {
            name: "take_screenshot",
            description: "截取當前瀏覽器畫面",
            parameters: no_params(),
        }
    }

    async fn execute(&self, ctx: &ToolContext, _params: Value) -> Result<ToolOutput> {
        let image = ctx
            .browser
            .screenshot()
            .await
            .map_err(|e| Error::Tool(format!("截圖失敗: {}", crate::error_text(&e))))?;
        Ok(ToolOutput {
            content: "截圖成功".to_string(),
            summary: None,
            screenshot: Some(image),
        })
    }
}

#[derive(Deserialize)]
struct ClickArgs {
    x: f64,
    y: f64,
    #[serde(default)]
    description: String,
}

pub struct ClickTool;

#[async_trait]
impl Tool for ClickTool {
    fn schema(&self) -> ToolSchema {
        ToolSchema {
            name: "click",
            description: "點擊螢幕上的指定位置",
            parameters: json!({
                "type": "object",
                "properties": {
                    "x": { "type": "integer", "description": "X 座標 (0-1920)" },
                    "y": { "type": "integer", "description": "Y 座標 (0-1080)" },
                    "description": { "type": "string", "description": "要點擊的元素描述" }
                },
                "required": ["x", "y", "description"]
            }),
        }
    }

    async fn execute(&self, ctx: &ToolContext, params: Value) -> Result<ToolOutput> {
        let args: ClickArgs = parse_args("點擊", params)?;
        let (x, y) = (args.x.round() as i64, args.y.round() as i64);
        send(ctx, BrowserAction::Click { x, y }, "點擊失敗").await?;
        Ok(ToolOutput::text(format!("已點擊位置 ({}, {}): {}", x, y, args.description)))
    }
}

#[derive(Deserialize)]
struct TypeTextArgs {
    text: String,
}

pub struct TypeTextTool;

#[async_trait]
impl Tool for TypeTextTool {
    fn schema(&self) -> ToolSchema {
        ToolSchema {
            name: "type_text",
            description: "在當前焦點位置輸入文字",
            parameters: json!({
                "type": "object",
                "properties": {
                    "text": { "type": "string", "description": "要輸入的文字" }
                },
                "required": ["text"]
            }),
        }
    }

    async fn execute(&self, ctx: &ToolContext, params: Value) -> Result<ToolOutput> {
        let args: TypeTextArgs = parse_args("輸入", params)?;
        match normalize_key_name(&args.text) {
            Some(key) => {
                send(ctx, BrowserAction::PressKey { key: key.to_string() }, "按鍵失敗").await?;
                Ok(ToolOutput::text(format!("已按下按鍵: {} (自動轉換)", key)))
            }
            None => {
                send(ctx, BrowserAction::TypeText { text: args.text.clone() }, "輸入失敗").await?;
                Ok(ToolOutput::text(format!("已輸入文字: {}", args.text)))
            }
        }
    }
}

#[derive(Deserialize)]
struct PressKeyArgs {
    key: String,
}

pub struct PressKeyTool;

#[async_trait]
impl Tool for PressKeyTool {
    fn schema(&self) -> ToolSchema {
        ToolSchema {
            name: "press_key",
            description: "按下鍵盤按鍵",
            parameters: json!({
                "type": "object",
                "properties": {
                    "key": { "type": "string", "description": "按鍵名稱 (Enter, Tab, Escape 等)" }
                },
                "required": ["key"]
            }),
        }
    }

    async fn execute(&self, ctx: &ToolContext, params: Value) -> Result<ToolOutput> {
        let args: PressKeyArgs = parse_args("按鍵", params)?;
        send(ctx, BrowserAction::PressKey { key: args.key.clone() }, "按鍵失敗").await?;
        Ok(ToolOutput::text(format!("已按下按鍵: {}", args.key)))
    }
}

#[derive(Deserialize)]
struct NavigateArgs {
    url: String,
}

pub struct NavigateTool;

#[async_trait]
impl Tool for NavigateTool {
    fn schema(&self) -> ToolSchema {
        ToolSchema {
            name: "navigate",
            description: "導航到指定網址",
            parameters: json!({
                "type": "object",
                "properties": {
                    "url": { "type": "string", "description": "目標網址" }
                },
                "required": ["url"]
            }),
        }
    }

    async fn execute(&self, ctx: &ToolContext, params: Value) -> Result<ToolOutput> {
        let args: NavigateArgs = parse_args("導航", params)?;
        send(ctx, BrowserAction::Navigate { url: args.url.clone() }, "導航失敗").await?;
        Ok(ToolOutput::text(format!("已導航到: {}", args.url)))
    }
}

#[derive(Deserialize)]
struct ScrollArgs {
    direction: ScrollDirection,
    #[serde(default)]
    amount: Option<u32>,
}

pub struct ScrollTool;

#[async_trait]
impl Tool for ScrollTool {
    fn schema(&self) -> ToolSchema {
        ToolSchema {
            name: "scroll",
            description: "滾動頁面",
            parameters: json!({
                "type": "object",
                "properties": {
                    "direction": { "type": "string", "enum": ["up", "down"], "description": "滾動方向" },
                    "amount": { "type": "integer", "description": "滾動像素數 (預設 500)" }
                },
                "required": ["direction"]
            }),
        }
    }

    async fn execute(&self, ctx: &ToolContext, params: Value) -> Result<ToolOutput> {
        let args: ScrollArgs = parse_args("滾動", params)?;
        let amount = args.amount.filter(|a| *a > 0).unwrap_or(DEFAULT_SCROLL_AMOUNT);
        send(ctx, BrowserAction::Scroll { direction: args.direction, amount }, "滾動失敗").await?;
        Ok(ToolOutput::text(format!("已向{}滾動 {} 像素", args.direction.as_str(), amount)))
    }
}

pub struct SelectAllTool;

#[async_trait]
impl Tool for SelectAllTool {
    fn schema(&self) -> ToolSchema {
        ToolSchema {
            name: "select_all",
            description: "全選當前焦點輸入框的內容 (Ctrl+A)，常用於清除輸入框：先 select_all 再 press_key Backspace",
            parameters: no_params(),
        }
    }

    async fn execute(&self, ctx: &ToolContext, _params: Value) -> Result<ToolOutput> {
        send(ctx, BrowserAction::SelectAll, "全選失敗").await?;
        Ok(ToolOutput::text("已全選輸入框內容"))
    }
}

pub struct GetPageStateTool;

#[async_trait]
impl Tool for GetPageStateTool {
    fn schema(&self) -> ToolSchema {
        ToolSchema {
            name: "get_page_state",
            description: "取得頁面狀態（表單欄位、按鈕、連結等），比截圖更快更準確。會返回所有輸入框的目前值、座標、focus狀態",
            parameters: no_params(),
        }
    }

    async fn execute(&self, ctx: &ToolContext, _params: Value) -> Result<ToolOutput> {
        let state = ctx
            .browser
            .page_state()
            .await
            .map_err(|e| Error::Tool(format!("取得頁面狀態失敗: {}", crate::error_text(&e))))?;
        let content = match state {
            Value::String(s) => s,
            other => serde_json::to_string(&other)?,
        };
        Ok(ToolOutput {
            content,
            summary: Some("取得頁面狀態".to_string()),
            screenshot: None,
        })
    }
}
