//! Registrar-facing endpoints: account upload, the lease-based refresh
//! task protocol, metrics, and the trigger-register proxy.

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};

use gembiz_core::pool::{process_account_upload, AccountUploadRequest};

use super::AdminContext;

pub async fn upload_account(
    State(ctx): State<AdminContext>,
    Json(req): Json<AccountUploadRequest>,
) -> Response {
    match process_account_upload(&ctx.state.pool, &ctx.data_dir, &req).await {
        Ok(()) => (
            StatusCode::OK,
            Json(json!({
                "success": true,
                "message": format!("account {} accepted into the pool", req.email),
            })),
        )
            .into_response(),
        Err(e) => {
            let status = StatusCode::from_u16(e.http_status_code())
                .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
            (status, Json(json!({"success": false, "error": e.to_string()}))).into_response()
        }
    }
}

#[derive(Deserialize, Default)]
pub struct RefreshTasksQuery {
    #[serde(default)]
    pub limit: Option<usize>,
}

/// Read-only task listing; never touches lease state.
pub async fn refresh_tasks(
    State(ctx): State<AdminContext>,
    Query(query): Query<RefreshTasksQuery>,
) -> Json<Value> {
    let limit = query.limit.unwrap_or(20).clamp(1, 200);
    let tasks = ctx.state.pool.external_refresh_tasks(limit);
    let count = tasks.len();
    Json(json!({"tasks": tasks, "count": count}))
}

#[derive(Deserialize)]
pub struct ClaimRequest {
    pub worker_id: String,
    #[serde(default)]
    pub limit: Option<usize>,
    #[serde(default)]
    pub lease_sec: Option<u64>,
}

pub async fn claim_refresh_tasks(
    State(ctx): State<AdminContext>,
    Json(req): Json<ClaimRequest>,
) -> Response {
    if req.worker_id.trim().is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({"error": "worker_id is required"})),
        )
            .into_response();
    }
    let limit = req.limit.unwrap_or(1).clamp(1, 200);
    let lease_sec = req.lease_sec.unwrap_or(120).clamp(10, 3600);
    let tasks = ctx.state.pool.claim_external_refresh_tasks(&req.worker_id, limit, lease_sec);
    let count = tasks.len();
    (
        StatusCode::OK,
        Json(json!({
            "tasks": tasks,
            "count": count,
            "worker_id": req.worker_id,
            "lease_sec": lease_sec,
        })),
    )
        .into_response()
}

#[derive(Deserialize)]
pub struct FailRequest {
    pub task_id: String,
    pub worker_id: String,
    #[serde(default)]
    pub reason: String,
}

pub async fn fail_refresh_task(
    State(ctx): State<AdminContext>,
    Json(req): Json<FailRequest>,
) -> Response {
    match ctx.state.pool.mark_external_refresh_failed(&req.task_id, &req.worker_id, &req.reason) {
        Ok(()) => (StatusCode::OK, Json(json!({"success": true}))).into_response(),
        Err(e) => {
            let status = StatusCode::from_u16(e.http_status_code())
                .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
            (status, Json(json!({"success": false, "error": e.to_string()}))).into_response()
        }
    }
}

pub async fn metrics(State(ctx): State<AdminContext>) -> Json<Value> {
    Json(ctx.state.pool.collect_external_refresh_metrics())
}

#[derive(Deserialize, Default)]
pub struct TriggerRegisterRequest {
    #[serde(default)]
    pub count: usize,
}

/// Forward a registration request to the external registrar process.
pub async fn trigger_register(
    State(ctx): State<AdminContext>,
    body: Option<Json<TriggerRegisterRequest>>,
) -> Response {
    let count = body.map(|Json(b)| b.count).unwrap_or(1).clamp(1, 20);
    let base_url = {
        let config = ctx.state.config.read();
        config.pool.registrar_base_url.trim_end_matches('/').to_string()
    };
    let target_url = format!("{}/trigger/register?count={}", base_url, count);

    let client = match reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(30))
        .build()
    {
        Ok(client) => client,
        Err(e) => {
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"error": format!("build registrar client: {}", e)})),
            )
                .into_response();
        }
    };

    let resp = match client.post(&target_url).send().await {
        Ok(resp) => resp,
        Err(e) => {
            return (
                StatusCode::BAD_GATEWAY,
                Json(json!({
                    "error": format!("registrar call failed: {}", e),
                    "registrar_url": target_url,
                    "source": "python_registrar",
                })),
            )
                .into_response();
        }
    };

    let status = resp.status().as_u16();
    let body_bytes = resp.bytes().await.unwrap_or_default();
    if !(200..300).contains(&status) {
        return (
            StatusCode::from_u16(status).unwrap_or(StatusCode::BAD_GATEWAY),
            Json(json!({
                "error": "registrar returned an error",
                "registrar_url": target_url,
                "registrar_status": status,
                "registrar_body": String::from_utf8_lossy(&body_bytes),
                "source": "python_registrar",
            })),
        )
            .into_response();
    }

    let mut response = json!({
        "accepted": true,
        "count": count,
        "source": "python_registrar",
        "registrar_url": target_url,
    });
    if let Ok(passthrough) = serde_json::from_slice::<Value>(&body_bytes) {
        response["registrar_response"] = passthrough;
    }
    (StatusCode::OK, Json(response)).into_response()
}
