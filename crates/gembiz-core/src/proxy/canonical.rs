//! Translation from the three inbound dialects to the canonical request,
//! and prompt assembly for the upstream.

use super::media::{parse_media_url, MediaKind, MediaPart};
use gembiz_types::protocol::{ChatRequest, ClaudeRequest, GeminiRequest, Message, ToolDef};
use serde_json::{json, Value};

/// Extract plain text and media parts from one message. String content is
/// returned verbatim; part lists are walked for `text`, `image_url`,
/// `video_url`, and `file` entries.
pub fn parse_message_content(msg: &Message) -> (String, Vec<MediaPart>) {
    let mut text = String::new();
    let mut media = Vec::new();
    match &msg.content {
        Value::String(s) => text.push_str(s),
        Value::Array(parts) => {
            for part in parts {
                match part.get("type").and_then(Value::as_str).unwrap_or_default() {
                    "text" => {
                        if let Some(t) = part.get("text").and_then(Value::as_str) {
                            text.push_str(t);
                        }
                    }
                    "image_url" => {
                        if let Some(url) = part.pointer("/image_url/url").and_then(Value::as_str) {
                            media.extend(parse_media_url(url, MediaKind::Image));
                        }
                    }
                    "video_url" => {
                        if let Some(url) = part.pointer("/video_url/url").and_then(Value::as_str) {
                            media.extend(parse_media_url(url, MediaKind::Video));
                        }
                    }
                    "file" => {
                        if let Some(url) = part.pointer("/file/url").and_then(Value::as_str) {
                            let kind = part
                                .pointer("/file/mime_type")
                                .and_then(Value::as_str)
                                .filter(|m| m.starts_with("video/"))
                                .map_or(MediaKind::Image, |_| MediaKind::Video);
                            media.extend(parse_media_url(url, kind));
                        }
                    }
                    _ => {}
                }
            }
        }
        _ => {}
    }
    (text, media)
}

/// First system turn's text, if any.
pub fn extract_system_prompt(messages: &[Message]) -> String {
    messages
        .iter()
        .find(|m| m.role == "system")
        .map(|m| parse_message_content(m).0)
        .unwrap_or_default()
}

/// Multi-turn conversations (any assistant/tool turn) flatten into one
/// tagged dialog string.
pub fn needs_conversation_context(messages: &[Message]) -> bool {
    messages
        .iter()
        .any(|m| matches!(m.role.as_str(), "assistant" | "tool" | "tool_result"))
}

/// Flatten all turns into a single dialog with explicit speaker tags and a
/// trailing `Assistant:` cue. System turns merge into one `<system>` block.
pub fn convert_messages_to_prompt(messages: &[Message]) -> String {
    let mut system_prompt = String::new();
    let mut dialog: Vec<String> = Vec::new();

    for msg in messages {
        let (text, _) = parse_message_content(msg);
        if text.is_empty() && msg.role != "assistant" {
            continue;
        }
        match msg.role.as_str() {
            "system" => {
                if !system_prompt.is_empty() {
                    system_prompt.push('\n');
                }
                system_prompt.push_str(&text);
            }
            "user" | "human" => dialog.push(format!("Human: {}", text)),
            "assistant" => {
                if !msg.tool_calls.is_empty() {
                    for tc in &msg.tool_calls {
                        dialog.push(format!(
                            "Assistant: [tool call {}({})]",
                            tc.function.name, tc.function.arguments
                        ));
                    }
                } else if !text.is_empty() {
                    dialog.push(format!("Assistant: {}", text));
                }
            }
            "tool" | "tool_result" => {
                dialog.push(format!("Tool Result [{}]: {}", msg.name, text));
            }
            _ => {}
        }
    }

    let mut result = String::new();
    if !system_prompt.is_empty() {
        result.push_str("<system>\n");
        result.push_str(&system_prompt);
        result.push_str("\n</system>\n\n");
    }
    result.push_str(&dialog.join("\n\n"));
    result.push_str("\n\nAssistant:");
    result
}

/// Assemble the upstream prompt and collect the media parts to upload.
/// Single-turn requests keep the raw user text (with an optional `<system>`
/// wrapper); multi-turn requests flatten, taking media only from the last
/// user turn.
pub fn assemble_prompt(req: &ChatRequest) -> (String, Vec<MediaPart>) {
    let system_prompt = extract_system_prompt(&req.messages);
    if needs_conversation_context(&req.messages) {
        let text = convert_messages_to_prompt(&req.messages);
        let media = req
            .messages
            .iter()
            .rev()
            .find(|m| m.role == "user" || m.role == "human")
            .map(|m| parse_message_content(m).1)
            .unwrap_or_default();
        return (text, media);
    }

    let Some(last) = req.messages.last() else {
        return (String::new(), Vec::new());
    };
    let (user_text, media) = parse_message_content(last);
    let text = if system_prompt.is_empty() {
        user_text
    } else {
        format!("<system>\n{}\n</system>\n\nHuman: {}\n\nAssistant:", system_prompt, user_text)
    };
    (text, media)
}

/// Build the upstream toolsSpec from the model-name capability flags. With
/// no suffix, all three generators plus the default tool registry are
/// enabled.
pub fn build_tools_spec(flags: super::models::ModelFlags) -> Value {
    if !flags.any() {
        return json!({
            "webGroundingSpec": {},
            "toolRegistry": "default_tool_registry",
            "imageGenerationSpec": {},
            "videoGenerationSpec": {},
        });
    }
    let mut spec = serde_json::Map::new();
    if flags.image {
        spec.insert("imageGenerationSpec".to_string(), json!({}));
    }
    if flags.video {
        spec.insert("videoGenerationSpec".to_string(), json!({}));
    }
    if flags.search {
        spec.insert("webGroundingSpec".to_string(), json!({}));
    }
    Value::Object(spec)
}

/// Claude Messages request → canonical form. The top-level `system` becomes
/// a leading system turn.
pub fn claude_to_chat(req: ClaudeRequest) -> ChatRequest {
    let mut messages = Vec::with_capacity(req.messages.len() + 1);
    let system = req.system_text();
    if !system.is_empty() {
        messages.push(Message::text("system", system));
    }
    messages.extend(req.messages.iter().cloned());
    ChatRequest {
        model: req.model.clone(),
        messages,
        stream: req.stream,
        temperature: req.temperature,
        top_p: None,
        tools: req.tools,
        tool_choice: None,
    }
}

/// Gemini generateContent request → canonical form. `systemInstruction`
/// becomes a leading system turn, the `model` role maps to `assistant`, and
/// inline data becomes `image_url` data URIs.
pub fn gemini_to_chat(req: &GeminiRequest, model: &str, stream: bool) -> ChatRequest {
    let mut messages = Vec::new();

    if let Some(sys) = &req.system_instruction {
        let text: String = sys.parts.iter().filter_map(|p| p.text.clone()).collect();
        if !text.is_empty() {
            messages.push(Message::text("system", text));
        }
    }

    for content in &req.contents {
        let role = if content.role == "model" { "assistant" } else { content.role.as_str() };
        let mut texts: Vec<String> = Vec::new();
        let mut parts: Vec<Value> = Vec::new();
        for part in &content.parts {
            if let Some(text) = &part.text {
                if !text.is_empty() {
                    texts.push(text.clone());
                }
            }
            if let Some(inline) = &part.inline_data {
                parts.push(json!({
                    "type": "image_url",
                    "image_url": {
                        "url": format!("data:{};base64,{}", inline.mime_type, inline.data)
                    }
                }));
            }
        }
        if !parts.is_empty() {
            if !texts.is_empty() {
                parts.insert(0, json!({"type": "text", "text": texts.join("\n")}));
            }
            messages.push(Message {
                role: role.to_string(),
                content: Value::Array(parts),
                ..Message::default()
            });
        } else if !texts.is_empty() {
            messages.push(Message::text(role, texts.join("\n")));
        }
    }

    let tools = gemini_tools_to_defs(&req.tools);
    ChatRequest {
        model: model.to_string(),
        messages,
        stream,
        temperature: None,
        top_p: None,
        tools,
        tool_choice: None,
    }
}

fn gemini_tools_to_defs(tools: &[Value]) -> Vec<ToolDef> {
    let mut defs = Vec::new();
    for tool in tools {
        let Some(decls) = tool.get("functionDeclarations").and_then(Value::as_array) else {
            continue;
        };
        for decl in decls {
            defs.push(ToolDef {
                kind: "function".to_string(),
                function: gembiz_types::protocol::FunctionDef {
                    name: decl.get("name").and_then(Value::as_str).unwrap_or_default().to_string(),
                    description: decl
                        .get("description")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string(),
                    parameters: decl.get("parameters").cloned().unwrap_or(Value::Null),
                },
            });
        }
    }
    defs
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user(text: &str) -> Message {
        Message::text("user", text)
    }

    #[test]
    fn single_turn_without_system_is_raw_text() {
        let req = ChatRequest { messages: vec![user("hello")], ..ChatRequest::default() };
        let (text, media) = assemble_prompt(&req);
        assert_eq!(text, "hello");
        assert!(media.is_empty());
    }

    #[test]
    fn single_turn_with_system_gets_wrapper_and_cue() {
        let req = ChatRequest {
            messages: vec![Message::text("system", "be brief"), user("hello")],
            ..ChatRequest::default()
        };
        let (text, _) = assemble_prompt(&req);
        assert_eq!(text, "<system>\nbe brief\n</system>\n\nHuman: hello\n\nAssistant:");
    }

    #[test]
    fn multi_turn_flattens_with_speaker_tags() {
        let req = ChatRequest {
            messages: vec![
                Message::text("system", "sys"),
                user("q1"),
                Message::text("assistant", "a1"),
                Message {
                    role: "tool".to_string(),
                    name: "search".to_string(),
                    content: Value::String("result".to_string()),
                    ..Message::default()
                },
                user("q2"),
            ],
            ..ChatRequest::default()
        };
        let (text, _) = assemble_prompt(&req);
        assert!(text.starts_with("<system>\nsys\n</system>\n\n"));
        assert!(text.contains("Human: q1"));
        assert!(text.contains("Assistant: a1"));
        assert!(text.contains("Tool Result [search]: result"));
        assert!(text.ends_with("\n\nAssistant:"));
    }

    #[test]
    fn multi_turn_takes_media_from_last_user_turn() {
        let with_image = Message {
            role: "user".to_string(),
            content: serde_json::json!([
                {"type": "text", "text": "see this"},
                {"type": "image_url", "image_url": {"url": "data:image/png;base64,QUJD"}}
            ]),
            ..Message::default()
        };
        let req = ChatRequest {
            messages: vec![user("old"), Message::text("assistant", "ok"), with_image],
            ..ChatRequest::default()
        };
        let (_, media) = assemble_prompt(&req);
        assert_eq!(media.len(), 1);
        assert_eq!(media[0].mime_type, "image/png");
    }

    #[test]
    fn tools_spec_defaults_to_all_generators() {
        let spec = build_tools_spec(super::super::models::ModelFlags::default());
        assert!(spec.get("webGroundingSpec").is_some());
        assert!(spec.get("imageGenerationSpec").is_some());
        assert!(spec.get("videoGenerationSpec").is_some());
        assert_eq!(spec.get("toolRegistry").and_then(Value::as_str), Some("default_tool_registry"));
    }

    #[test]
    fn tools_spec_honours_suffix_flags() {
        let spec = build_tools_spec(super::super::models::ModelFlags {
            image: true,
            video: false,
            search: true,
        });
        assert!(spec.get("imageGenerationSpec").is_some());
        assert!(spec.get("webGroundingSpec").is_some());
        assert!(spec.get("videoGenerationSpec").is_none());
        assert!(spec.get("toolRegistry").is_none());
    }

    #[test]
    fn claude_system_becomes_leading_turn() {
        let req: ClaudeRequest = serde_json::from_str(
            r#"{"model":"gemini-2.5-flash","system":"sys","messages":[{"role":"user","content":"hi"}],"stream":true}"#,
        )
        .unwrap();
        let chat = claude_to_chat(req);
        assert_eq!(chat.messages[0].role, "system");
        assert_eq!(chat.messages[1].role, "user");
        assert!(chat.stream);
    }

    #[test]
    fn gemini_model_role_maps_to_assistant() {
        let req: GeminiRequest = serde_json::from_str(
            r#"{"contents":[{"role":"user","parts":[{"text":"q"}]},{"role":"model","parts":[{"text":"a"}]}]}"#,
        )
        .unwrap();
        let chat = gemini_to_chat(&req, "gemini-2.5-flash", false);
        assert_eq!(chat.messages[1].role, "assistant");
        assert!(needs_conversation_context(&chat.messages));
    }

    #[test]
    fn gemini_inline_data_becomes_data_uri_part() {
        let req: GeminiRequest = serde_json::from_str(
            r#"{"contents":[{"role":"user","parts":[{"text":"look"},{"inlineData":{"mimeType":"image/png","data":"QUJD"}}]}]}"#,
        )
        .unwrap();
        let chat = gemini_to_chat(&req, "m", false);
        let (text, media) = parse_message_content(&chat.messages[0]);
        assert_eq!(text, "look");
        assert_eq!(media.len(), 1);
        assert_eq!(media[0].mime_type, "image/png");
    }
}
