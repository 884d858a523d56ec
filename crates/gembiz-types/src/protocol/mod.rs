//! Wire-protocol request shapes for the three accepted dialects.
//!
//! Every dialect normalizes into [`ChatRequest`], the canonical form the
//! pipeline consumes.

mod claude;
mod gemini;
mod openai;

pub use claude::ClaudeRequest;
pub use gemini::{GeminiContent, GeminiInlineData, GeminiPart, GeminiRequest};
pub use openai::{
    ChatRequest, FunctionCall, FunctionDef, Message, ToolCall, ToolDef,
};
