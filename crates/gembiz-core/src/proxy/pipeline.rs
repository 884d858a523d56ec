//! The request pipeline: account selection, session creation, media
//! upload, the streamAssist call, response classification, and emission
//! toward the client in streaming and non-streaming shapes.

use super::canonical::{assemble_prompt, build_tools_spec};
use super::media::{download_media, format_image_as_markdown, MediaPart};
use super::models::{is_flow_model, split_model, upstream_model_id};
use super::parser::{self, sniff};
use super::server::GatewayState;
use super::sse::{
    completion_response, content_chunk, finish_chunk, reasoning_chunk, role_chunk, sse_data,
    tool_call_chunk, SSE_DONE,
};
use axum::body::Body;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use base64::Engine;
use chrono::Utc;
use futures::future::join_all;
use gembiz_types::error::UpstreamError;
use gembiz_types::protocol::ChatRequest;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;
use uuid::Uuid;

use crate::stats::{estimate_input_tokens, estimate_output_tokens, RequestSample};

const MAX_ATTEMPTS: usize = 3;
const HEARTBEAT_INTERVAL: std::time::Duration = std::time::Duration::from_secs(15);

/// What one successful upstream round yields.
struct AttemptSuccess {
    events: Vec<Value>,
    email: String,
    jwt: String,
    orig_auth: String,
    config_id: String,
    session: String,
}

enum AttemptFailure {
    /// Selection came up empty for the whole request.
    NoAccount,
    /// A user-supplied media URL answered 401/403; surfaced immediately.
    MediaDownload { status: u16 },
    /// A 200 body that defeated all three decoders.
    ParseFailed,
    /// All attempts consumed; carry the last upstream status+body for
    /// passthrough.
    Exhausted { status: Option<u16>, body: Option<String>, message: String },
}

/// Entry point shared by every dialect handler.
pub async fn handle_chat(
    state: GatewayState,
    req: ChatRequest,
    client_ip: String,
    user_agent: String,
) -> Response {
    let chat_id = format!("chatcmpl-{}", Uuid::new_v4());
    let created = Utc::now().timestamp();

    tracing::info!("[{}] request: model={}", client_ip, req.model);

    if is_flow_model(&req.model)
        || state.flow.as_ref().is_some_and(|f| f.models().iter().any(|m| m == &req.model))
    {
        return handle_flow(state, req, chat_id, created, client_ip, user_agent).await;
    }

    let (text, media) = assemble_prompt(&req);
    let mut sample = RequestSample {
        model: req.model.clone(),
        input_tokens: estimate_input_tokens(text.len(), media.len()),
        ..RequestSample::default()
    };

    let long_running = !req.stream
        && (req.model.contains("video") || req.model.contains("image") || req.model.contains("imagen"));

    if req.stream {
        return stream_response(state, req, chat_id, created, text, media, sample, client_ip, user_agent);
    }

    if long_running {
        return long_running_response(
            state, req, chat_id, created, text, media, sample, client_ip, user_agent,
        );
    }

    let result = run_attempts(&state, &req.model, &text, &media).await;
    let response = match result {
        Ok(success) => {
            let (value, out_len, images, videos) =
                assemble_completion(&state, &req, &chat_id, created, &success).await;
            sample.success = true;
            sample.output_tokens = estimate_output_tokens(out_len);
            sample.images = images;
            sample.videos = videos;
            (StatusCode::OK, axum::Json(value)).into_response()
        }
        Err(failure) => failure_response(failure),
    };
    state.record_request(&client_ip, &user_agent, &sample);
    response
}

/// Map a terminal failure to the client-visible response, preferring
/// passthrough of the upstream status and body.
fn failure_response(failure: AttemptFailure) -> Response {
    match failure {
        AttemptFailure::NoAccount => (
            StatusCode::INTERNAL_SERVER_ERROR,
            axum::Json(json!({"error": "no account available"})),
        )
            .into_response(),
        AttemptFailure::MediaDownload { status } => (
            StatusCode::INTERNAL_SERVER_ERROR,
            axum::Json(json!({
                "error": {
                    "message": format!("UPSTREAM_{}: media download failed", status),
                    "type": "upstream_error",
                    "code": "media_download_failed",
                }
            })),
        )
            .into_response(),
        AttemptFailure::ParseFailed => (
            StatusCode::INTERNAL_SERVER_ERROR,
            axum::Json(json!({"error": "JSON Parse Error"})),
        )
            .into_response(),
        AttemptFailure::Exhausted { status, body, message } => match (status, body) {
            (Some(status), Some(body)) if !body.is_empty() => {
                let status =
                    StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
                (status, [(header::CONTENT_TYPE, "application/json")], body).into_response()
            }
            _ => (
                StatusCode::INTERNAL_SERVER_ERROR,
                axum::Json(json!({"error": message})),
            )
                .into_response(),
        },
    }
}

/// The account rotation loop.
async fn run_attempts(
    state: &GatewayState,
    model: &str,
    text: &str,
    media: &[MediaPart],
) -> Result<AttemptSuccess, AttemptFailure> {
    let pool = &state.pool;
    let upstream = &state.upstream;
    let mut attempt = 0usize;
    let mut last_status: Option<u16> = None;
    let mut last_body: Option<String> = None;
    let mut last_message = String::new();

    while attempt < MAX_ATTEMPTS {
        let Some(creds) = pool.next() else {
            if last_message.is_empty() {
                return Err(AttemptFailure::NoAccount);
            }
            return Err(AttemptFailure::Exhausted {
                status: last_status,
                body: last_body,
                message: last_message,
            });
        };
        let email = creds.email.clone();
        let orig_auth = creds.authorization.clone();
        tracing::info!("Using account: {} (attempt {}/{})", email, attempt + 1, MAX_ATTEMPTS);

        let (jwt, config_id) = match pool.ensure_jwt(&email, upstream).await {
            Ok(pair) => pair,
            Err(err) => {
                tracing::error!("[{}] JWT mint failed: {}", email, err);
                if err.flags_account_refresh() {
                    pool.mark_needs_refresh(&email);
                }
                last_message = err.to_string();
                attempt += 1;
                continue;
            }
        };

        let session = match upstream.create_session(&jwt, &config_id, &orig_auth).await {
            Ok(session) => session,
            Err(err) => {
                tracing::error!("[{}] createSession failed: {}", email, err);
                if err.flags_account_refresh() {
                    pool.mark_needs_refresh(&email);
                }
                last_message = err.to_string();
                attempt += 1;
                continue;
            }
        };

        match upload_media(state, &jwt, &config_id, &session, &orig_auth, media).await {
            Ok(file_ids) => {
                let request_body =
                    build_stream_assist_body(model, text, &config_id, &session, &file_ids);
                let (status, bytes) =
                    match upstream.stream_assist(&jwt, &orig_auth, &request_body).await {
                        Ok(pair) => pair,
                        Err(err) => {
                            tracing::error!("[{}] streamAssist failed: {}", email, err);
                            last_message = err.to_string();
                            attempt += 1;
                            continue;
                        }
                    };

                if status != 200 {
                    let body_text = String::from_utf8_lossy(&bytes).into_owned();
                    tracing::error!(
                        "[{}] upstream error {} (attempt {}/{}): {}",
                        email,
                        status,
                        attempt + 1,
                        MAX_ATTEMPTS,
                        body_text
                    );
                    last_status = Some(status);
                    last_body = Some(body_text.clone());
                    last_message = format!("HTTP {}: {}", status, body_text);
                    match status {
                        401 | 403 => {
                            pool.mark_needs_refresh(&email);
                            attempt += 1;
                        }
                        429 => {
                            // Rate limit: triple cooldown, rotate without
                            // consuming an attempt.
                            pool.extend_cooldown(&email, 3);
                            pool.mark_used(&email, false);
                            tokio::time::sleep(std::time::Duration::from_secs(1)).await;
                        }
                        400 => {
                            pool.mark_used(&email, false);
                            tokio::time::sleep(std::time::Duration::from_millis(500)).await;
                            attempt += 1;
                        }
                        _ => {
                            pool.mark_used(&email, false);
                            attempt += 1;
                        }
                    }
                    continue;
                }

                if sniff::is_auth_envelope(&bytes) {
                    tracing::warn!("[{}] auth envelope in 200 body, rotating", email);
                    pool.mark_needs_refresh(&email);
                    last_message = UpstreamError::AuthEnvelope.to_string();
                    attempt += 1;
                    continue;
                }

                if sniff::has_error(&bytes) && !sniff::has_content(&bytes) {
                    if sniff::has_quota_token(&bytes) {
                        tracing::info!("[{}] quota exhausted, extended cooldown", email);
                        pool.extend_cooldown(&email, 5);
                        pool.mark_used(&email, false);
                        last_message = UpstreamError::QuotaExhausted.to_string();
                    } else {
                        last_message = UpstreamError::ErrorBody.to_string();
                    }
                    attempt += 1;
                    continue;
                }

                if !sniff::has_content(&bytes) {
                    if sniff::has_thought(&bytes) {
                        // Thought-only responses don't count against the
                        // account; the generation just stalled.
                        tracing::warn!("[{}] thought-only response, rotating", email);
                        last_message = UpstreamError::ThoughtOnly.to_string();
                        tokio::time::sleep(std::time::Duration::from_millis(500)).await;
                    } else {
                        tracing::warn!("[{}] empty response, rotating", email);
                        pool.mark_used(&email, false);
                        last_message = UpstreamError::EmptyResponse.to_string();
                    }
                    attempt += 1;
                    continue;
                }

                pool.mark_used(&email, true);
                let Some(events) = parser::parse_event_list(&bytes) else {
                    tracing::error!("All response decoders failed (len={})", bytes.len());
                    return Err(AttemptFailure::ParseFailed);
                };
                let response_session = parser::extract_session(&events).unwrap_or_else(|| {
                    tracing::warn!("Response carried no session, using request session");
                    session.clone()
                });
                return Ok(AttemptSuccess {
                    events,
                    email,
                    jwt,
                    orig_auth,
                    config_id,
                    session: response_session,
                });
            }
            Err(UploadFailure::MediaDownload { status }) => {
                return Err(AttemptFailure::MediaDownload { status });
            }
            Err(UploadFailure::Other(message)) => {
                tracing::warn!("[{}] media upload failed: {}", email, message);
                last_message = format!("media upload failed: {}", message);
                attempt += 1;
                continue;
            }
        }
    }

    Err(AttemptFailure::Exhausted { status: last_status, body: last_body, message: last_message })
}

enum UploadFailure {
    MediaDownload { status: u16 },
    Other(String),
}

/// Upload every media part into the session. URL parts try
/// upload-by-reference first, then fall back to download-and-upload;
/// 401/403 from the user's own URL aborts the whole request.
async fn upload_media(
    state: &GatewayState,
    jwt: &str,
    config_id: &str,
    session: &str,
    orig_auth: &str,
    media: &[MediaPart],
) -> Result<Vec<String>, UploadFailure> {
    let mut file_ids = Vec::with_capacity(media.len());
    for part in media {
        let file_id = if part.is_url {
            match state
                .upstream
                .upload_context_file_by_url(jwt, config_id, session, &part.url, orig_auth)
                .await
            {
                Ok(id) => id,
                Err(_) => {
                    let (data, mime) = download_media(&state.media_client, &part.url, part.kind)
                        .await
                        .map_err(|err| match err {
                            UpstreamError::MediaDownload { status }
                                if status == 401 || status == 403 =>
                            {
                                UploadFailure::MediaDownload { status }
                            }
                            other => UploadFailure::Other(other.to_string()),
                        })?;
                    state
                        .upstream
                        .upload_context_file(jwt, config_id, session, &mime, &data, orig_auth)
                        .await
                        .map_err(|e| UploadFailure::Other(e.to_string()))?
                }
            }
        } else {
            state
                .upstream
                .upload_context_file(jwt, config_id, session, &part.mime_type, &part.data, orig_auth)
                .await
                .map_err(|e| UploadFailure::Other(e.to_string()))?
        };
        file_ids.push(file_id);
    }
    Ok(file_ids)
}

fn build_stream_assist_body(
    model: &str,
    text: &str,
    config_id: &str,
    session: &str,
    file_ids: &[String],
) -> Value {
    let (base, flags) = split_model(model);
    let query_text = if text.is_empty() { " " } else { text };
    let mut request = json!({
        "session": session,
        "query": {"parts": [{"text": query_text}]},
        "filter": "",
        "fileIds": file_ids,
        "answerGenerationMode": "NORMAL",
        "toolsSpec": build_tools_spec(flags),
        "languageCode": "en-US",
        "userMetadata": {"timeZone": "UTC"},
        "assistSkippingMode": "REQUEST_ASSIST",
    });
    if let Some(model_id) = upstream_model_id(&base) {
        request["assistGenerationConfig"] = json!({"modelId": model_id});
    }
    json!({
        "configId": config_id,
        "additionalParams": {"token": "-"},
        "streamAssistRequest": request,
    })
}

/// Ordered reply content pulled from the event list.
enum ReplyItem {
    Text(String),
    Reasoning(String),
    Inline { mime: String, data: String },
    File { file_id: String, mime: String },
    ToolCall { id: String, name: String, arguments: String },
}

fn collect_reply_items(events: &[Value]) -> Vec<ReplyItem> {
    let mut items = Vec::new();
    for content in parser::for_each_reply_content(events) {
        if content.get("thought").and_then(Value::as_bool) == Some(true) {
            if let Some(text) = content.get("text").and_then(Value::as_str) {
                if !text.is_empty() {
                    items.push(ReplyItem::Reasoning(text.to_string()));
                }
            }
            continue;
        }
        if let Some(text) = content.get("text").and_then(Value::as_str) {
            if !text.is_empty() {
                items.push(ReplyItem::Text(text.to_string()));
            }
        }
        if let Some(inline) = content.get("inlineData") {
            let mime = inline.get("mimeType").and_then(Value::as_str).unwrap_or_default();
            let data = inline.get("data").and_then(Value::as_str).unwrap_or_default();
            if !mime.is_empty() && !data.is_empty() {
                items.push(ReplyItem::Inline { mime: mime.to_string(), data: data.to_string() });
            }
        }
        if let Some(file) = content.get("file") {
            let file_id = file.get("fileId").and_then(Value::as_str).unwrap_or_default();
            let mime = file.get("mimeType").and_then(Value::as_str).unwrap_or_default();
            if !file_id.is_empty() {
                items.push(ReplyItem::File {
                    file_id: file_id.to_string(),
                    mime: mime.to_string(),
                });
            }
        }
        if let Some(call) = content.get("functionCall") {
            let name = call.get("name").and_then(Value::as_str).unwrap_or_default();
            let args = call.get("args").cloned().unwrap_or(json!({}));
            items.push(ReplyItem::ToolCall {
                id: format!("call_{}", &Uuid::new_v4().to_string()[..8]),
                name: name.to_string(),
                arguments: args.to_string(),
            });
        }
    }
    items
}

/// Download every generated file in parallel; results come back in the
/// original reply order.
async fn download_generated_files(
    state: &GatewayState,
    success: &AttemptSuccess,
    files: &[(String, String)],
) -> Vec<Result<(String, String), UpstreamError>> {
    let futures = files.iter().map(|(file_id, mime)| {
        let mime = mime.clone();
        async move {
            state
                .upstream
                .download_generated_file(
                    &success.jwt,
                    file_id,
                    &success.session,
                    &success.config_id,
                    &success.orig_auth,
                )
                .await
                .map(|data| (data, mime))
        }
    });
    join_all(futures).await
}

const DOWNLOAD_RETRY_NOTICE: &str =
    "[notice] generated file download hit an auth failure; please resend the request (the gateway will switch accounts)";

/// Streaming response: SSE headers and the role chunk go out before the
/// upstream attempt loop starts, so the client sees life immediately.
#[allow(clippy::too_many_arguments)]
fn stream_response(
    state: GatewayState,
    req: ChatRequest,
    chat_id: String,
    created: i64,
    text: String,
    media: Vec<MediaPart>,
    mut sample: RequestSample,
    client_ip: String,
    user_agent: String,
) -> Response {
    let (tx, rx) = mpsc::channel::<String>(64);
    let model = req.model.clone();

    let _ = tx.try_send(sse_data(&role_chunk(&chat_id, created, &model)));

    tokio::spawn(async move {
        let send = |line: String| {
            let tx = tx.clone();
            async move { tx.send(line).await.is_ok() }
        };

        match run_attempts(&state, &model, &text, &media).await {
            Ok(success) => {
                let items = collect_reply_items(&success.events);
                let mut output_len = 0usize;
                let mut pending_files: Vec<(String, String)> = Vec::new();
                let mut has_tool_calls = false;

                for item in &items {
                    let line = match item {
                        ReplyItem::Text(t) => {
                            output_len += t.len();
                            Some(sse_data(&content_chunk(&chat_id, created, &model, t)))
                        }
                        ReplyItem::Reasoning(t) => {
                            output_len += t.len();
                            Some(sse_data(&reasoning_chunk(&chat_id, created, &model, t)))
                        }
                        ReplyItem::Inline { mime, data } => Some(sse_data(&content_chunk(
                            &chat_id,
                            created,
                            &model,
                            &format_image_as_markdown(mime, data),
                        ))),
                        ReplyItem::File { file_id, mime } => {
                            pending_files.push((file_id.clone(), mime.clone()));
                            None
                        }
                        ReplyItem::ToolCall { id, name, arguments } => {
                            has_tool_calls = true;
                            Some(sse_data(&tool_call_chunk(
                                &chat_id, created, &model, id, name, arguments,
                            )))
                        }
                    };
                    if let Some(line) = line {
                        if !send(line).await {
                            return;
                        }
                    }
                }

                if !pending_files.is_empty() {
                    tracing::info!("Downloading {} generated file(s)", pending_files.len());
                    let results =
                        download_generated_files(&state, &success, &pending_files).await;
                    let mut delivered = 0usize;
                    let mut needs_retry = false;
                    for result in &results {
                        match result {
                            Ok((data, mime)) => {
                                delivered += 1;
                                let markdown = format_image_as_markdown(mime, data);
                                if !send(sse_data(&content_chunk(
                                    &chat_id, created, &model, &markdown,
                                )))
                                .await
                                {
                                    return;
                                }
                            }
                            Err(UpstreamError::DownloadNeedsRetry) => needs_retry = true,
                            Err(e) => tracing::error!("Generated file download failed: {}", e),
                        }
                    }
                    if delivered == 0 {
                        let message = if needs_retry {
                            state.pool.mark_needs_refresh(&success.email);
                            DOWNLOAD_RETRY_NOTICE.to_string()
                        } else {
                            "generated file download failed".to_string()
                        };
                        if !send(sse_data(&content_chunk(&chat_id, created, &model, &message)))
                            .await
                        {
                            return;
                        }
                    }
                    for (_, mime) in &pending_files {
                        if mime.starts_with("video/") {
                            sample.videos += 1;
                        } else {
                            sample.images += 1;
                        }
                    }
                }

                let finish = if has_tool_calls { "tool_calls" } else { "stop" };
                let _ = send(sse_data(&finish_chunk(&chat_id, created, &model, finish))).await;
                let _ = send(SSE_DONE.to_string()).await;

                sample.success = true;
                sample.output_tokens = estimate_output_tokens(output_len);
            }
            Err(failure) => {
                let message = match &failure {
                    AttemptFailure::NoAccount => "[error] no account available".to_string(),
                    AttemptFailure::MediaDownload { status } => {
                        format!("[error] media download failed (UPSTREAM_{})", status)
                    }
                    AttemptFailure::ParseFailed => "[error] response parse failed".to_string(),
                    AttemptFailure::Exhausted { message, .. } => format!("[error] {}", message),
                };
                let _ =
                    send(sse_data(&content_chunk(&chat_id, created, &model, &message))).await;
                let _ = send(sse_data(&finish_chunk(&chat_id, created, &model, "stop"))).await;
                let _ = send(SSE_DONE.to_string()).await;
            }
        }
        state.record_request(&client_ip, &user_agent, &sample);
    });

    sse_response(rx)
}

fn sse_response(rx: mpsc::Receiver<String>) -> Response {
    let stream = ReceiverStream::new(rx).map(Ok::<_, std::convert::Infallible>);
    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "text/event-stream")
        .header(header::CACHE_CONTROL, "no-cache")
        .header(header::CONNECTION, "keep-alive")
        .header("x-accel-buffering", "no")
        .body(Body::from_stream(stream))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

/// Non-streaming image/video generation: chunked body with whitespace
/// heartbeats every 15 s until the completion object is ready.
#[allow(clippy::too_many_arguments)]
fn long_running_response(
    state: GatewayState,
    req: ChatRequest,
    chat_id: String,
    created: i64,
    text: String,
    media: Vec<MediaPart>,
    mut sample: RequestSample,
    client_ip: String,
    user_agent: String,
) -> Response {
    let (tx, rx) = mpsc::channel::<String>(8);

    tokio::spawn(async move {
        {
        let work = async {
            match run_attempts(&state, &req.model, &text, &media).await {
                Ok(success) => {
                    let (value, out_len, images, videos) =
                        assemble_completion(&state, &req, &chat_id, created, &success).await;
                    sample.success = true;
                    sample.output_tokens = estimate_output_tokens(out_len);
                    sample.images = images;
                    sample.videos = videos;
                    value.to_string()
                }
                Err(failure) => match failure {
                    AttemptFailure::NoAccount => json!({"error": "no account available"}).to_string(),
                    AttemptFailure::MediaDownload { status } => json!({
                        "error": {
                            "message": format!("UPSTREAM_{}: media download failed", status),
                            "type": "upstream_error",
                            "code": "media_download_failed",
                        }
                    })
                    .to_string(),
                    AttemptFailure::ParseFailed => {
                        json!({"error": "JSON Parse Error"}).to_string()
                    }
                    AttemptFailure::Exhausted { body, message, .. } => {
                        body.unwrap_or_else(|| json!({"error": message}).to_string())
                    }
                },
            }
        };
        tokio::pin!(work);

        let start = tokio::time::Instant::now() + HEARTBEAT_INTERVAL;
        let mut heartbeat = tokio::time::interval_at(start, HEARTBEAT_INTERVAL);
        loop {
            tokio::select! {
                body = &mut work => {
                    let _ = tx.send(body).await;
                    break;
                }
                _ = heartbeat.tick() => {
                    // Client gone: stop the upstream work too.
                    if tx.send(" ".to_string()).await.is_err() {
                        break;
                    }
                }
            }
        }
        }
        state.record_request(&client_ip, &user_agent, &sample);
    });

    let stream = ReceiverStream::new(rx).map(Ok::<_, std::convert::Infallible>);
    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from_stream(stream))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

/// Assemble the OpenAI-shape completion for non-streaming responses.
/// Returns `(completion, output_text_len, images, videos)`.
async fn assemble_completion(
    state: &GatewayState,
    req: &ChatRequest,
    chat_id: &str,
    created: i64,
    success: &AttemptSuccess,
) -> (Value, usize, u64, u64) {
    let items = collect_reply_items(&success.events);

    let pending_files: Vec<(String, String)> = items
        .iter()
        .filter_map(|item| match item {
            ReplyItem::File { file_id, mime } => Some((file_id.clone(), mime.clone())),
            _ => None,
        })
        .collect();
    let downloaded = if pending_files.is_empty() {
        Vec::new()
    } else {
        download_generated_files(state, success, &pending_files).await
    };
    let mut downloads = downloaded.into_iter();

    let mut content = String::new();
    let mut reasoning = String::new();
    let mut tool_calls: Vec<Value> = Vec::new();
    let mut images = 0u64;
    let mut videos = 0u64;
    let mut delivered_any_file = false;
    let mut needs_retry = false;

    for item in &items {
        match item {
            ReplyItem::Text(t) => content.push_str(t),
            ReplyItem::Reasoning(t) => reasoning.push_str(t),
            ReplyItem::Inline { mime, data } => {
                content.push_str(&format_image_as_markdown(mime, data));
            }
            ReplyItem::File { mime, .. } => {
                if mime.starts_with("video/") {
                    videos += 1;
                } else {
                    images += 1;
                }
                match downloads.next() {
                    Some(Ok((data, mime))) => {
                        delivered_any_file = true;
                        content.push_str(&format_image_as_markdown(&mime, &data));
                    }
                    Some(Err(UpstreamError::DownloadNeedsRetry)) => needs_retry = true,
                    Some(Err(e)) => {
                        tracing::error!("Generated file download failed: {}", e);
                    }
                    None => {}
                }
            }
            ReplyItem::ToolCall { id, name, arguments } => tool_calls.push(json!({
                "id": id,
                "type": "function",
                "function": {"name": name, "arguments": arguments},
            })),
        }
    }

    if needs_retry && !delivered_any_file {
        state.pool.mark_needs_refresh(&success.email);
        content.push_str("\n\n");
        content.push_str(DOWNLOAD_RETRY_NOTICE);
    }

    let output_len = content.len() + reasoning.len();
    let mut message = json!({"role": "assistant", "content": content});
    if !reasoning.is_empty() {
        message["reasoning_content"] = Value::String(reasoning);
    }
    let finish = if tool_calls.is_empty() {
        "stop"
    } else {
        message["tool_calls"] = Value::Array(tool_calls);
        message["content"] = Value::Null;
        "tool_calls"
    };

    (completion_response(chat_id, created, &req.model, message, finish), output_len, images, videos)
}

/// Flow models are served by the media-generation collaborator; without it
/// they fail with 503.
async fn handle_flow(
    state: GatewayState,
    req: ChatRequest,
    chat_id: String,
    created: i64,
    client_ip: String,
    user_agent: String,
) -> Response {
    let Some(flow) = state.flow.clone() else {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            axum::Json(json!({
                "error": {
                    "message": "Flow generation is not enabled",
                    "type": "service_unavailable",
                }
            })),
        )
            .into_response();
    };

    let mut prompt = String::new();
    let mut images: Vec<Vec<u8>> = Vec::new();
    for msg in &req.messages {
        if msg.role == "user" || msg.role == "human" {
            let (text, media) = super::canonical::parse_message_content(msg);
            if !text.is_empty() {
                prompt = text;
            }
            for part in media {
                if !part.data.is_empty() {
                    if let Ok(bytes) =
                        base64::engine::general_purpose::STANDARD.decode(&part.data)
                    {
                        images.push(bytes);
                    }
                }
            }
        }
    }
    if prompt.is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            axum::Json(json!({
                "error": {"message": "Prompt cannot be empty", "type": "invalid_request_error"}
            })),
        )
            .into_response();
    }

    let mut sample = RequestSample { model: req.model.clone(), ..RequestSample::default() };
    let result = flow.generate(&req.model, &prompt, images).await;
    let response = match result {
        Ok(generated) => {
            sample.success = true;
            if generated.kind == "video" {
                sample.videos = 1;
            } else {
                sample.images = 1;
            }
            let content = match generated.kind.as_str() {
                "image" => format!("![Generated Image]({})", generated.url),
                "video" => format!("<video src='{}' controls></video>", generated.url),
                _ => generated.url.clone(),
            };
            if req.stream {
                let (tx, rx) = mpsc::channel::<String>(8);
                let _ = tx.try_send(sse_data(&role_chunk(&chat_id, created, &req.model)));
                let _ =
                    tx.try_send(sse_data(&content_chunk(&chat_id, created, &req.model, &content)));
                let _ = tx.try_send(sse_data(&finish_chunk(&chat_id, created, &req.model, "stop")));
                let _ = tx.try_send(SSE_DONE.to_string());
                sse_response(rx)
            } else {
                let message = json!({"role": "assistant", "content": content});
                (
                    StatusCode::OK,
                    axum::Json(completion_response(&chat_id, created, &req.model, message, "stop")),
                )
                    .into_response()
            }
        }
        Err(message) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            axum::Json(json!({"error": {"message": message, "type": "generation_failed"}})),
        )
            .into_response(),
    };
    state.record_request(&client_ip, &user_agent, &sample);
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stream_assist_body_shape() {
        let body = build_stream_assist_body(
            "gemini-2.5-flash-image",
            "draw a cat",
            "cfg-1",
            "sessions/abc",
            &["file-1".to_string()],
        );
        assert_eq!(body["configId"], "cfg-1");
        let request = &body["streamAssistRequest"];
        assert_eq!(request["session"], "sessions/abc");
        assert_eq!(request["query"]["parts"][0]["text"], "draw a cat");
        assert_eq!(request["fileIds"][0], "file-1");
        assert!(request["toolsSpec"]["imageGenerationSpec"].is_object());
        assert!(request["toolsSpec"]["videoGenerationSpec"].is_null());
        // -image strips to a mapped base, so the modelId is pinned.
        assert_eq!(request["assistGenerationConfig"]["modelId"], "gemini-2.5-flash");
    }

    #[test]
    fn empty_prompt_becomes_single_space() {
        let body = build_stream_assist_body("gemini-3-flash", "", "cfg", "s", &[]);
        assert_eq!(body["streamAssistRequest"]["query"]["parts"][0]["text"], " ");
        assert!(body["streamAssistRequest"]["assistGenerationConfig"].is_null());
    }

    #[test]
    fn reply_items_preserve_order_and_split_thoughts() {
        let events = vec![json!({
            "streamAssistResponse": {
                "answer": {"replies": [
                    {"groundedContent": {"content": {"thought": true, "text": "thinking"}}},
                    {"groundedContent": {"content": {"text": "hello"}}},
                    {"groundedContent": {"content": {"file": {"fileId": "f1", "mimeType": "image/png"}}}},
                    {"groundedContent": {"content": {"functionCall": {"name": "look", "args": {"q": 1}}}}},
                ]}
            }
        })];
        let items = collect_reply_items(&events);
        assert_eq!(items.len(), 4);
        assert!(matches!(&items[0], ReplyItem::Reasoning(t) if t == "thinking"));
        assert!(matches!(&items[1], ReplyItem::Text(t) if t == "hello"));
        assert!(matches!(&items[2], ReplyItem::File { file_id, .. } if file_id == "f1"));
        match &items[3] {
            ReplyItem::ToolCall { id, name, arguments } => {
                assert!(id.starts_with("call_"));
                assert_eq!(name, "look");
                assert_eq!(arguments, "{\"q\":1}");
            }
            _ => panic!("expected tool call"),
        }
    }
}
