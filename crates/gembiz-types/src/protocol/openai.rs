//! OpenAI chat-completions request shapes, doubling as the canonical form.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One conversation turn. `content` is either a plain string or a list of
/// content parts; it is kept as raw JSON and interpreted by the pipeline.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Message {
    pub role: String,
    #[serde(default)]
    pub content: Value,
    /// Function name (tool role).
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    /// Tool invocations carried by an assistant turn.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    /// Id of the call a tool turn answers.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub tool_call_id: String,
}

impl Message {
    pub fn text(role: impl Into<String>, content: impl Into<String>) -> Self {
        Self { role: role.into(), content: Value::String(content.into()), ..Self::default() }
    }
}

/// OpenAI-format tool definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDef {
    /// Always "function".
    #[serde(rename = "type")]
    pub kind: String,
    pub function: FunctionDef,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionDef {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub parameters: Value,
}

/// A tool call emitted by the assistant.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub function: FunctionCall,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionCall {
    pub name: String,
    /// JSON-encoded argument object.
    pub arguments: String,
}

/// Canonical chat request. OpenAI requests deserialize into this directly;
/// the Claude and Gemini adapters build it by hand.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ChatRequest {
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub messages: Vec<Message>,
    #[serde(default)]
    pub stream: bool,
    #[serde(default)]
    pub temperature: Option<f64>,
    #[serde(default)]
    pub top_p: Option<f64>,
    #[serde(default)]
    pub tools: Vec<ToolDef>,
    #[serde(default)]
    pub tool_choice: Option<Value>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deserializes_string_and_part_content() {
        let req: ChatRequest = serde_json::from_str(
            r#"{
                "model": "gemini-2.5-flash",
                "messages": [
                    {"role": "user", "content": "hi"},
                    {"role": "user", "content": [{"type": "text", "text": "look"},
                        {"type": "image_url", "image_url": {"url": "https://x/y.png"}}]}
                ],
                "stream": true
            }"#,
        )
        .unwrap();
        assert_eq!(req.messages.len(), 2);
        assert!(req.stream);
        assert!(req.messages[0].content.is_string());
        assert!(req.messages[1].content.is_array());
    }

    #[test]
    fn tool_calls_survive_round_trip() {
        let msg = Message {
            role: "assistant".to_string(),
            tool_calls: vec![ToolCall {
                id: "call_1".to_string(),
                kind: "function".to_string(),
                function: FunctionCall {
                    name: "lookup".to_string(),
                    arguments: r#"{"q":"rust"}"#.to_string(),
                },
            }],
            ..Message::default()
        };
        let raw = serde_json::to_string(&msg).unwrap();
        let back: Message = serde_json::from_str(&raw).unwrap();
        assert_eq!(back.tool_calls.len(), 1);
        assert_eq!(back.tool_calls[0].function.name, "lookup");
    }
}
