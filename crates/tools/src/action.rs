use relay_core::protocol::{AgentCommand, ScrollDirection};

pub const DEFAULT_SCROLL_AMOUNT: u32 = 500;

/// A browser operation requested by the model, before wire encoding.
#[derive(Debug, Clone, PartialEq)]
pub enum BrowserAction {
    Navigate { url: String },
    Click { x: i64, y: i64 },
    TypeText { text: String },
    PressKey { key: String },
    Scroll { direction: ScrollDirection, amount: u32 },
    SelectAll,
}

/// Canonical key name for text that is really a key press, such as
/// `"enter"` or `"ESC"`.
pub fn normalize_key_name(text: &str) -> Option<&'static str> {
    let key = match text.to_ascii_lowercase().as_str() {
        "tab" => "Tab",
        "enter" => "Enter",
        "backspace" => "Backspace",
        "escape" | "esc" => "Escape",
        "delete" | "del" => "Delete",
        "arrowup" => "ArrowUp",
        "arrowdown" => "ArrowDown",
        "arrowleft" => "ArrowLeft",
        "arrowright" => "ArrowRight",
        _ => return None,
    };
    Some(key)
}

impl BrowserAction {
    /// Rewrite typed key names as key presses and canonicalize key names.
    pub fn normalized(self) -> Self {
        match self {
            BrowserAction::TypeText { text } => match normalize_key_name(&text) {
                Some(key) => BrowserAction::PressKey { key: key.to_string() },
                None => BrowserAction::TypeText { text },
            },
            BrowserAction::PressKey { key } => BrowserAction::PressKey {
                key: normalize_key_name(&key).map(str::to_string).unwrap_or(key),
            },
            other => other,
        }
    }

    pub fn into_command(self) -> AgentCommand {
        match self.normalized() {
            BrowserAction::Navigate { url } => AgentCommand::Navigate { url },
            BrowserAction::Click { x, y } => AgentCommand::ClickXy { x, y },
            BrowserAction::TypeText { text } => AgentCommand::Input { value: text, selector: None },
            BrowserAction::PressKey { key } => AgentCommand::Key { key },
            BrowserAction::Scroll { direction, amount } => AgentCommand::Scroll { direction, amount },
            BrowserAction::SelectAll => AgentCommand::SelectAll,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_typed_key_name_becomes_key_press() {
        let cmd = BrowserAction::TypeText { text: "Enter".into() }.into_command();
        assert_eq!(cmd, AgentCommand::Key { key: "Enter".into() });
        assert_eq!(serde_json::to_value(&cmd).unwrap(), json!({"type": "key", "key": "Enter"}));
    }

    #[test]
    fn test_key_names_are_case_insensitive() {
        for (text, key) in [
            ("tab", "Tab"),
            ("TAB", "Tab"),
            ("esc", "Escape"),
            ("Del", "Delete"),
            ("arrowDown", "ArrowDown"),
            ("BACKSPACE", "Backspace"),
        ] {
            let cmd = BrowserAction::TypeText { text: text.into() }.into_command();
            assert_eq!(cmd, AgentCommand::Key { key: key.into() }, "text {:?}", text);
        }
    }

    #[test]
    fn test_ordinary_text_is_input() {
        let cmd = BrowserAction::TypeText { text: "Enter the dragon".into() }.into_command();
        assert_eq!(
            serde_json::to_value(&cmd).unwrap(),
            json!({"type": "input", "value": "Enter the dragon"})
        );
    }

    #[test]
    fn test_press_key_passes_unknown_names_through() {
        let cmd = BrowserAction::PressKey { key: "PageDown".into() }.into_command();
        assert_eq!(cmd, AgentCommand::Key { key: "PageDown".into() });
        let cmd = BrowserAction::PressKey { key: "enter".into() }.into_command();
        assert_eq!(cmd, AgentCommand::Key { key: "Enter".into() });
    }

    #[test]
    fn test_click_and_scroll_shapes() {
        let cmd = BrowserAction::Click { x: 960, y: 540 }.into_command();
        assert_eq!(serde_json::to_value(&cmd).unwrap(), json!({"type": "click_xy", "x": 960, "y": 540}));

        let cmd = BrowserAction::Scroll { direction: ScrollDirection::Up, amount: 300 }.into_command();
        assert_eq!(
            serde_json::to_value(&cmd).unwrap(),
            json!({"type": "scroll", "direction": "up", "amount": 300})
        );
    }
}
