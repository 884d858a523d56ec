//! Claude Messages API request shape.

use super::openai::{Message, ToolDef};
use serde::Deserialize;
use serde_json::Value;

/// Claude Messages request. `system` may be a plain string or a list of
/// content blocks; both are accepted.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ClaudeRequest {
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub messages: Vec<Message>,
    #[serde(default)]
    pub system: Value,
    #[serde(default)]
    pub max_tokens: Option<u32>,
    #[serde(default)]
    pub stream: bool,
    #[serde(default)]
    pub temperature: Option<f64>,
    #[serde(default)]
    pub tools: Vec<ToolDef>,
}

impl ClaudeRequest {
    /// Flatten the top-level `system` field into plain text.
    pub fn system_text(&self) -> String {
        match &self.system {
            Value::String(s) => s.clone(),
            Value::Array(blocks) => blocks
                .iter()
                .filter_map(|b| b.get("text").and_then(Value::as_str))
                .collect::<Vec<_>>()
                .join("\n"),
            _ => String::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn system_accepts_string_and_blocks() {
        let req: ClaudeRequest =
            serde_json::from_str(r#"{"model":"m","system":"be terse","messages":[]}"#).unwrap();
        assert_eq!(req.system_text(), "be terse");

        let req: ClaudeRequest = serde_json::from_str(
            r#"{"model":"m","system":[{"type":"text","text":"a"},{"type":"text","text":"b"}],"messages":[]}"#,
        )
        .unwrap();
        assert_eq!(req.system_text(), "a\nb");
    }
}
