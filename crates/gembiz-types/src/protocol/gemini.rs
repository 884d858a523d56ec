//! Gemini generateContent API request shape.

use serde::Deserialize;
use serde_json::Value;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct GeminiRequest {
    #[serde(default)]
    pub contents: Vec<GeminiContent>,
    #[serde(default, rename = "systemInstruction")]
    pub system_instruction: Option<GeminiContent>,
    #[serde(default, rename = "generationConfig")]
    pub generation_config: Option<Value>,
    #[serde(default)]
    pub tools: Vec<Value>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct GeminiContent {
    #[serde(default)]
    pub role: String,
    #[serde(default)]
    pub parts: Vec<GeminiPart>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct GeminiPart {
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default, rename = "inlineData")]
    pub inline_data: Option<GeminiInlineData>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GeminiInlineData {
    #[serde(rename = "mimeType")]
    pub mime_type: String,
    pub data: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_contents_and_system_instruction() {
        let req: GeminiRequest = serde_json::from_str(
            r#"{
                "systemInstruction": {"parts": [{"text": "sys"}]},
                "contents": [
                    {"role": "user", "parts": [{"text": "hello"},
                        {"inlineData": {"mimeType": "image/png", "data": "QUJD"}}]},
                    {"role": "model", "parts": [{"text": "hi"}]}
                ]
            }"#,
        )
        .unwrap();
        assert_eq!(req.contents.len(), 2);
        let sys = req.system_instruction.unwrap();
        assert_eq!(sys.parts[0].text.as_deref(), Some("sys"));
        assert_eq!(
            req.contents[0].parts[1].inline_data.as_ref().unwrap().mime_type,
            "image/png"
        );
    }
}
