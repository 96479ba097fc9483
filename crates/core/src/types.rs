use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::warn;

/// A tool call request that serializes to the OpenAI-compatible format:
/// `{id, type: "function", function: {name, arguments}}`
#[derive(Debug, Clone, PartialEq)]
pub struct ToolCallRequest {
    pub id: String,
    pub name: String,
    pub arguments: Value,
}

impl Serialize for ToolCallRequest {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        use serde::ser::SerializeMap;
        let mut map = serializer.serialize_map(Some(3))?;
        map.serialize_entry("id", &self.id)?;
        map.serialize_entry("type", "function")?;
        map.serialize_entry("function", &json!({
            "name": self.name,
            "arguments": self.arguments.to_string()
        }))?;
        map.end()
    }
}

impl<'de> Deserialize<'de> for ToolCallRequest {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        let obj = value.as_object().ok_or_else(|| serde::de::Error::custom("expected object"))?;

        let id = obj.get("id")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();

        let func = obj.get("function")
            .and_then(|v| v.as_object())
            .ok_or_else(|| serde::de::Error::custom("missing function"))?;
        let name = func.get("name")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();
        let arguments = match func.get("arguments") {
            Some(Value::String(s)) => parse_arguments(s),
            Some(v) => v.clone(),
            None => Value::Object(serde_json::Map::new()),
        };
        Ok(ToolCallRequest { id, name, arguments })
    }
}

/// Parse the string-encoded arguments of a tool call. Malformed JSON is kept
/// as a string so the executor can report the parse failure to the model.
pub fn parse_arguments(raw: &str) -> Value {
    if raw.trim().is_empty() {
        return Value::Object(serde_json::Map::new());
    }
    serde_json::from_str(raw).unwrap_or_else(|e| {
        warn!(error = %e, raw = %raw, "Tool call arguments are not valid JSON");
        Value::String(raw.to_string())
    })
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LLMResponse {
    pub content: Option<String>,
    pub tool_calls: Vec<ToolCallRequest>,
    pub finish_reason: String,
    pub usage: Value,
}

impl Default for LLMResponse {
    fn default() -> Self {
        Self {
            content: None,
            tool_calls: Vec::new(),
            finish_reason: String::new(),
            usage: Value::Null,
        }
    }
}

impl LLMResponse {
    /// `(prompt_tokens, completion_tokens)` as reported by the API.
    pub fn token_usage(&self) -> (u64, u64) {
        let input = self.usage.get("prompt_tokens").and_then(|v| v.as_u64()).unwrap_or(0);
        let output = self.usage.get("completion_tokens").and_then(|v| v.as_u64()).unwrap_or(0);
        (input, output)
    }

    pub fn text(&self) -> &str {
        self.content.as_deref().unwrap_or("")
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCallRequest>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl ChatMessage {
    fn with_role(role: &str, content: Value) -> Self {
        Self {
            role: role.to_string(),
            content,
            tool_calls: None,
            tool_call_id: None,
            name: None,
        }
    }

    pub fn system(content: &str) -> Self {
        Self::with_role("system", Value::String(content.to_string()))
    }

    pub fn user(content: &str) -> Self {
        Self::with_role("user", Value::String(content.to_string()))
    }

    /// A user turn carrying a screenshot followed by text, in the multimodal
    /// content-part format.
    pub fn user_with_image(text: &str, image: &str) -> Self {
        let mut parts = vec![json!({
            "type": "image_url",
            "image_url": { "url": image_data_uri(image) }
        })];
        if !text.is_empty() {
            parts.push(json!({ "type": "text", "text": text }));
        }
        Self::with_role("user", Value::Array(parts))
    }

    pub fn assistant(content: &str) -> Self {
        Self::with_role("assistant", Value::String(content.to_string()))
    }

    pub fn assistant_with_tool_calls(content: &str, tool_calls: Vec<ToolCallRequest>) -> Self {
        let mut msg = Self::with_role(
            "assistant",
            if content.is_empty() { Value::Null } else { Value::String(content.to_string()) },
        );
        msg.tool_calls = Some(tool_calls);
        msg
    }

    pub fn tool_result(tool_call_id: &str, content: &str) -> Self {
        let mut msg = Self::with_role("tool", Value::String(content.to_string()));
        msg.tool_call_id = Some(tool_call_id.to_string());
        msg
    }

    pub fn has_tool_calls(&self) -> bool {
        self.tool_calls.as_ref().map(|c| !c.is_empty()).unwrap_or(false)
    }

    pub fn is_tool_result(&self) -> bool {
        self.role == "tool"
    }

    pub fn has_image(&self) -> bool {
        self.content
            .as_array()
            .map(|parts| parts.iter().any(|p| p.get("type").and_then(|t| t.as_str()) == Some("image_url")))
            .unwrap_or(false)
    }
}

/// Normalize an encoded screenshot into a `data:` URI. Bare base64 is
/// assumed to be PNG.
pub fn image_data_uri(image: &str) -> String {
    if image.starts_with("data:") {
        image.to_string()
    } else {
        format!("data:image/png;base64,{}", image)
    }
}
