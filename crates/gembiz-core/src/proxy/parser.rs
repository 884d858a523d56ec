//! Tolerant parsing of the upstream streaming event list.
//!
//! The body is nominally a JSON array of events, but long generations get
//! truncated mid-array and some deployments emit newline-delimited JSON.
//! Decoding order: strict array, then prefix recovery from a truncated
//! array, then NDJSON.

use serde_json::Value;

/// Decode the upstream body into an event list, or `None` when nothing
/// parseable is found.
pub fn parse_event_list(body: &[u8]) -> Option<Vec<Value>> {
    if let Ok(Value::Array(events)) = serde_json::from_slice::<Value>(body) {
        return Some(events);
    }
    let recovered = parse_incomplete_json_array(body);
    if !recovered.is_empty() {
        tracing::info!("Recovered {} event(s) from truncated array", recovered.len());
        return Some(recovered);
    }
    let ndjson = parse_ndjson(body);
    if !ndjson.is_empty() {
        tracing::info!("Parsed {} event(s) as NDJSON", ndjson.len());
        return Some(ndjson);
    }
    None
}

/// Recover the prefix of complete top-level objects from a truncated JSON
/// array. Scans brace depth outside string literals; every object that
/// closes at depth zero parses individually.
pub fn parse_incomplete_json_array(body: &[u8]) -> Vec<Value> {
    let text = String::from_utf8_lossy(body);
    let trimmed = text.trim_start();
    let Some(rest) = trimmed.strip_prefix('[') else {
        return Vec::new();
    };

    let mut events = Vec::new();
    let mut depth = 0usize;
    let mut start: Option<usize> = None;
    let mut in_string = false;
    let mut escaped = false;

    for (i, ch) in rest.char_indices() {
        if in_string {
            if escaped {
                escaped = false;
            } else if ch == '\\' {
                escaped = true;
            } else if ch == '"' {
                in_string = false;
            }
            continue;
        }
        match ch {
            '"' => in_string = true,
            '{' => {
                if depth == 0 {
                    start = Some(i);
                }
                depth += 1;
            }
            '}' => {
                depth = depth.saturating_sub(1);
                if depth == 0 {
                    if let Some(s) = start.take() {
                        if let Ok(value) = serde_json::from_str::<Value>(&rest[s..=i]) {
                            events.push(value);
                        }
                    }
                }
            }
            _ => {}
        }
    }
    events
}

/// Decode newline-delimited JSON objects, skipping unparseable lines.
pub fn parse_ndjson(body: &[u8]) -> Vec<Value> {
    String::from_utf8_lossy(body)
        .lines()
        .filter_map(|line| {
            let line = line.trim().trim_end_matches(',');
            if line.is_empty() || !line.starts_with('{') {
                return None;
            }
            serde_json::from_str::<Value>(line).ok()
        })
        .collect()
}

/// Walk every `groundedContent.content` object in the event list, in order.
pub fn for_each_reply_content<'a>(events: &'a [Value]) -> impl Iterator<Item = &'a Value> {
    events
        .iter()
        .filter_map(|e| e.pointer("/streamAssistResponse/answer/replies"))
        .filter_map(Value::as_array)
        .flatten()
        .filter_map(|reply| reply.pointer("/groundedContent/content"))
}

/// Session name carried in the response, used for generated-file downloads.
pub fn extract_session(events: &[Value]) -> Option<String> {
    events
        .iter()
        .filter_map(|e| e.pointer("/streamAssistResponse/sessionInfo/session"))
        .filter_map(Value::as_str)
        .find(|s| !s.is_empty())
        .map(str::to_string)
}

/// True when at least one event is a `streamAssistResponse`.
pub fn has_stream_response(events: &[Value]) -> bool {
    events.iter().any(|e| e.get("streamAssistResponse").is_some())
}

/// Byte-level sniffs used to classify a 200 body before full processing.
pub mod sniff {
    fn contains(haystack: &[u8], needle: &str) -> bool {
        haystack.windows(needle.len()).any(|w| w == needle.as_bytes())
    }

    /// 200 body that is an authentication envelope rather than content.
    pub fn is_auth_envelope(body: &[u8]) -> bool {
        contains(body, "uToken") && !contains(body, "streamAssistResponse")
    }

    pub fn has_text(body: &[u8]) -> bool {
        contains(body, "\"text\"")
    }

    pub fn has_file(body: &[u8]) -> bool {
        contains(body, "\"file\"")
    }

    pub fn has_inline_data(body: &[u8]) -> bool {
        contains(body, "\"inlineData\"")
    }

    pub fn has_thought(body: &[u8]) -> bool {
        contains(body, "\"thought\"")
    }

    pub fn has_function_call(body: &[u8]) -> bool {
        contains(body, "\"functionCall\"")
    }

    pub fn has_error(body: &[u8]) -> bool {
        contains(body, "\"error\"") || contains(body, "\"errorMessage\"")
    }

    pub fn has_quota_token(body: &[u8]) -> bool {
        contains(body, "RESOURCE_EXHAUSTED") || contains(body, "quota")
    }

    pub fn has_content(body: &[u8]) -> bool {
        has_text(body) || has_file(body) || has_inline_data(body) || has_function_call(body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn event(n: u64) -> Value {
        json!({
            "streamAssistResponse": {
                "answer": {
                    "replies": [
                        {"groundedContent": {"content": {"text": format!("chunk {}", n)}}}
                    ]
                }
            }
        })
    }

    #[test]
    fn strict_array_decodes() {
        let body = serde_json::to_vec(&json!([event(1), event(2)])).unwrap();
        let events = parse_event_list(&body).unwrap();
        assert_eq!(events.len(), 2);
        assert!(has_stream_response(&events));
    }

    #[test]
    fn truncated_array_yields_complete_prefix_at_any_cut() {
        let full = serde_json::to_vec(&json!([event(1), event(2), event(3)])).unwrap();
        let one = serde_json::to_vec(&event(1)).unwrap();
        let two = serde_json::to_vec(&json!([event(1), event(2)])).unwrap();
        // Any cut strictly between the end of object 2 and the end of
        // object 3 must still yield the first two objects.
        for cut in two.len()..full.len() - 1 {
            let events = parse_incomplete_json_array(&full[..cut]);
            assert!(
                events.len() >= 2,
                "cut at {} lost complete objects ({} found)",
                cut,
                events.len()
            );
            assert_eq!(serde_json::to_vec(&events[0]).unwrap().len(), one.len());
        }
    }

    #[test]
    fn truncation_mid_string_with_braces_does_not_confuse_scanner() {
        let tricky = json!([{"a": "brace } inside"}, {"b": "x"}]);
        let body = serde_json::to_vec(&tricky).unwrap();
        let cut = &body[..body.len() - 6];
        let events = parse_incomplete_json_array(cut);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0]["a"], "brace } inside");
    }

    #[test]
    fn ndjson_fallback() {
        let body = b"{\"a\":1}\n{\"b\":2}\nnot json\n{\"c\":3}";
        let events = parse_ndjson(body);
        assert_eq!(events.len(), 3);
    }

    #[test]
    fn event_walk_and_session_extraction() {
        let events = vec![
            json!({"streamAssistResponse": {"sessionInfo": {"session": "projects/1/sessions/9"}}}),
            event(1),
        ];
        assert_eq!(extract_session(&events).as_deref(), Some("projects/1/sessions/9"));
        let texts: Vec<_> = for_each_reply_content(&events)
            .filter_map(|c| c.get("text"))
            .collect();
        assert_eq!(texts.len(), 1);
    }

    #[test]
    fn auth_envelope_sniff() {
        assert!(sniff::is_auth_envelope(br#"{"uToken": {"value": "x"}}"#));
        assert!(!sniff::is_auth_envelope(
            br#"[{"streamAssistResponse": {}, "uToken": "y"}]"#
        ));
    }

    #[test]
    fn content_sniffs() {
        assert!(sniff::has_content(br#"{"text": "hi"}"#));
        assert!(!sniff::has_content(br#"{"thought": true}"#));
        assert!(sniff::has_thought(br#"{"thought": true}"#));
        assert!(sniff::has_quota_token(br#"{"error": "RESOURCE_EXHAUSTED"}"#));
    }
}
