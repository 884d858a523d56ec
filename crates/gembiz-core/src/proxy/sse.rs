//! OpenAI-shape chunk and completion builders.

use serde_json::{json, Value};

/// Format one SSE data line.
#[inline]
pub fn sse_data(value: &Value) -> String {
    format!("data: {}\n\n", value)
}

/// The literal stream terminator.
pub const SSE_DONE: &str = "data: [DONE]\n\n";

/// Build a `chat.completion.chunk` with the given delta and finish reason.
pub fn chunk(
    id: &str,
    created: i64,
    model: &str,
    delta: Value,
    finish_reason: Option<&str>,
) -> Value {
    let delta = if delta.is_null() { json!({}) } else { delta };
    json!({
        "id": id,
        "object": "chat.completion.chunk",
        "created": created,
        "model": model,
        "choices": [{
            "index": 0,
            "delta": delta,
            "finish_reason": finish_reason,
            "logprobs": Value::Null,
        }]
    })
}

pub fn role_chunk(id: &str, created: i64, model: &str) -> Value {
    chunk(id, created, model, json!({"role": "assistant"}), None)
}

pub fn content_chunk(id: &str, created: i64, model: &str, content: &str) -> Value {
    chunk(id, created, model, json!({"content": content}), None)
}

pub fn reasoning_chunk(id: &str, created: i64, model: &str, reasoning: &str) -> Value {
    chunk(id, created, model, json!({"reasoning_content": reasoning}), None)
}

pub fn tool_call_chunk(
    id: &str,
    created: i64,
    model: &str,
    call_id: &str,
    name: &str,
    arguments: &str,
) -> Value {
    chunk(
        id,
        created,
        model,
        json!({
            "tool_calls": [{
                "index": 0,
                "id": call_id,
                "type": "function",
                "function": {"name": name, "arguments": arguments}
            }]
        }),
        None,
    )
}

pub fn finish_chunk(id: &str, created: i64, model: &str, finish_reason: &str) -> Value {
    chunk(id, created, model, Value::Null, Some(finish_reason))
}

/// Non-streaming `chat.completion` envelope.
pub fn completion_response(
    id: &str,
    created: i64,
    model: &str,
    message: Value,
    finish_reason: &str,
) -> Value {
    json!({
        "id": id,
        "object": "chat.completion",
        "created": created,
        "model": model,
        "system_fingerprint": format!("fp_gemini_{}", model),
        "choices": [{
            "index": 0,
            "message": message,
            "logprobs": Value::Null,
            "finish_reason": finish_reason,
        }],
        "usage": {
            "prompt_tokens": 0,
            "completion_tokens": 0,
            "total_tokens": 0,
        }
    })
}
