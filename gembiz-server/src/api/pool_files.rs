//! Pool-file maintenance: listing, export/import, and invalid-file
//! cleanup with automatic backups.

use axum::extract::{Multipart, Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use gembiz_core::pool::{process_account_upload, AccountUploadRequest};
use gembiz_types::models::{AccountData, AccountStatus};

use super::admin::mask_email;
use super::AdminContext;

const DEFAULT_PAGE_SIZE: usize = 20;
const MAX_PAGE_SIZE: usize = 200;

#[derive(Debug, Clone, Serialize)]
pub struct PoolFileView {
    pub file_name: String,
    pub email_from_filename: String,
    pub parse_ok: bool,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub parse_error: String,
    pub exists_in_pool: bool,
    pub pool_status: String,
    pub has_config_id: bool,
    pub has_csesidx: bool,
    pub size_bytes: u64,
    pub modified_at: Option<DateTime<Utc>>,
}

struct PoolFileRecord {
    view: PoolFileView,
    file_path: PathBuf,
    account_email: String,
    invalid_reason: String,
}

fn is_pool_file(name: &str) -> bool {
    name.ends_with(".json")
        && name != "admin_panel_auth.json"
        && !name.starts_with("invalid-backup-")
        && !name.starts_with("pool-export-")
}

fn collect_records(ctx: &AdminContext) -> Result<Vec<PoolFileRecord>, String> {
    let mut names: Vec<String> = std::fs::read_dir(&ctx.data_dir)
        .map_err(|e| format!("read data dir: {}", e))?
        .flatten()
        .filter_map(|entry| entry.file_name().to_str().map(str::to_string))
        .filter(|name| is_pool_file(name))
        .collect();
    names.sort();

    let pool_index: std::collections::HashMap<String, AccountStatus> = ctx
        .state
        .pool
        .list_accounts()
        .into_iter()
        .map(|info| (info.email.to_ascii_lowercase(), info.status))
        .collect();

    let mut records = Vec::with_capacity(names.len());
    for name in names {
        let path = ctx.data_dir.join(&name);
        let stem = name.trim_end_matches(".json").to_string();
        let mut record = PoolFileRecord {
            view: PoolFileView {
                file_name: name.clone(),
                email_from_filename: stem.clone(),
                parse_ok: false,
                parse_error: String::new(),
                exists_in_pool: false,
                pool_status: "invalid".to_string(),
                has_config_id: false,
                has_csesidx: false,
                size_bytes: 0,
                modified_at: None,
            },
            file_path: path.clone(),
            account_email: stem,
            invalid_reason: String::new(),
        };

        match std::fs::metadata(&path) {
            Ok(meta) => {
                record.view.size_bytes = meta.len();
                record.view.modified_at =
                    meta.modified().ok().map(DateTime::<Utc>::from);
            }
            Err(e) => {
                record.view.parse_error = format!("stat failed: {}", e);
                record.invalid_reason = "stat_failed".to_string();
                records.push(record);
                continue;
            }
        }

        let raw = match std::fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(e) => {
                record.view.parse_error = format!("read failed: {}", e);
                record.invalid_reason = "read_failed".to_string();
                records.push(record);
                continue;
            }
        };
        let data: AccountData = match serde_json::from_str(&raw) {
            Ok(data) => data,
            Err(e) => {
                record.view.parse_error = format!("json parse failed: {}", e);
                record.invalid_reason = "json_parse_error".to_string();
                records.push(record);
                continue;
            }
        };

        record.view.parse_ok = true;
        if !data.email.trim().is_empty() {
            record.account_email = data.email.trim().to_string();
        }
        record.view.has_config_id = !data.config_id.trim().is_empty();
        record.view.has_csesidx = !data.csesidx.trim().is_empty();
        if let Err(reason) = data.validate() {
            record.view.parse_error = reason.clone();
            record.invalid_reason = reason;
        }

        match pool_index.get(&record.account_email.to_ascii_lowercase()) {
            Some(status) => {
                record.view.exists_in_pool = true;
                record.view.pool_status = status.to_string();
            }
            None if record.invalid_reason.is_empty() => {
                record.view.pool_status = "unknown".to_string();
            }
            None => {}
        }
        records.push(record);
    }

    records.sort_by(|a, b| {
        let rank = |r: &PoolFileRecord| {
            AccountStatus::normalize(&r.view.pool_status).map_or(6, AccountStatus::display_order)
        };
        rank(a)
            .cmp(&rank(b))
            .then_with(|| a.view.file_name.to_ascii_lowercase().cmp(&b.view.file_name.to_ascii_lowercase()))
    });
    Ok(records)
}

#[derive(Deserialize, Default)]
pub struct ListQuery {
    #[serde(default)]
    pub state: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub q: String,
    #[serde(default)]
    pub page: Option<usize>,
    #[serde(default)]
    pub page_size: Option<usize>,
}

fn filter_records<'a>(
    records: &'a [PoolFileRecord],
    query: &ListQuery,
) -> Vec<&'a PoolFileRecord> {
    let state = query.state.trim().to_ascii_lowercase();
    let status_filter: Vec<AccountStatus> =
        query.status.split(',').filter_map(AccountStatus::normalize).collect();
    let q = query.q.trim().to_ascii_lowercase();
    records
        .iter()
        .filter(|r| {
            let status = AccountStatus::normalize(&r.view.pool_status);
            match state.as_str() {
                "active" => status.is_some_and(AccountStatus::is_active),
                "invalid" => !status.is_some_and(AccountStatus::is_active),
                _ => true,
            }
        })
        .filter(|r| {
            status_filter.is_empty()
                || AccountStatus::normalize(&r.view.pool_status)
                    .is_some_and(|s| status_filter.contains(&s))
        })
        .filter(|r| {
            q.is_empty()
                || r.view.file_name.to_ascii_lowercase().contains(&q)
                || r.account_email.to_ascii_lowercase().contains(&q)
        })
        .collect()
}

pub async fn list(State(ctx): State<AdminContext>, Query(query): Query<ListQuery>) -> Response {
    let records = match collect_records(&ctx) {
        Ok(records) => records,
        Err(e) => {
            return (StatusCode::INTERNAL_SERVER_ERROR, Json(json!({"error": e}))).into_response()
        }
    };
    let filtered = filter_records(&records, &query);
    let total = filtered.len();
    let page = query.page.unwrap_or(1).max(1);
    let page_size = query.page_size.unwrap_or(DEFAULT_PAGE_SIZE).clamp(1, MAX_PAGE_SIZE);
    let items: Vec<&PoolFileView> = filtered
        .into_iter()
        .skip((page - 1) * page_size)
        .take(page_size)
        .map(|r| &r.view)
        .collect();

    Json(json!({
        "items": items,
        "total": total,
        "page": page,
        "page_size": page_size,
        "state": query.state,
        "status": query.status,
        "q": query.q,
        "total_page": total.div_ceil(page_size),
    }))
    .into_response()
}

pub async fn export(State(ctx): State<AdminContext>, Query(query): Query<ListQuery>) -> Response {
    let records = match collect_records(&ctx) {
        Ok(records) => records,
        Err(e) => {
            return (StatusCode::INTERNAL_SERVER_ERROR, Json(json!({"error": e}))).into_response()
        }
    };
    let filtered = filter_records(&records, &query);

    let mut errors: Vec<String> = Vec::new();
    let mut manifest_files: Vec<&PoolFileView> = Vec::new();
    let cursor = std::io::Cursor::new(Vec::new());
    let mut writer = zip::ZipWriter::new(cursor);
    let options = zip::write::SimpleFileOptions::default();

    for record in &filtered {
        manifest_files.push(&record.view);
        let raw = match std::fs::read(&record.file_path) {
            Ok(raw) => raw,
            Err(e) => {
                errors.push(format!("{}: {}", record.view.file_name, e));
                continue;
            }
        };
        if let Err(e) = writer
            .start_file(record.view.file_name.as_str(), options)
            .and_then(|()| writer.write_all(&raw).map_err(zip::result::ZipError::Io))
        {
            errors.push(format!("{}: {}", record.view.file_name, e));
        }
    }

    let manifest = json!({
        "generated_at": Utc::now().to_rfc3339(),
        "state": query.state,
        "status": query.status,
        "q": query.q,
        "total": filtered.len(),
        "exported_count": filtered.len() - errors.len(),
        "errors": errors,
        "files": manifest_files,
    });
    let manifest_raw = serde_json::to_vec_pretty(&manifest).unwrap_or_default();
    if let Err(e) = writer
        .start_file("manifest.json", options)
        .and_then(|()| writer.write_all(&manifest_raw).map_err(zip::result::ZipError::Io))
    {
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({"error": format!("write manifest: {}", e)})),
        )
            .into_response();
    }
    let cursor = match writer.finish() {
        Ok(cursor) => cursor,
        Err(e) => {
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"error": format!("finish zip: {}", e)})),
            )
                .into_response()
        }
    };

    let filename = format!("pool-export-{}.zip", Utc::now().format("%Y%m%d-%H%M%S"));
    (
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, "application/zip".to_string()),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"{}\"", filename),
            ),
            (header::HeaderName::from_static("x-export-count"), filtered.len().to_string()),
        ],
        cursor.into_inner(),
    )
        .into_response()
}

#[derive(Default, Serialize)]
struct ImportResult {
    total: usize,
    success: usize,
    failed: usize,
    skipped: usize,
    errors: Vec<String>,
    imported_emails: Vec<String>,
}

async fn import_single_payload(
    ctx: &AdminContext,
    name: &str,
    payload: &[u8],
    overwrite: bool,
    result: &mut ImportResult,
) {
    result.total += 1;
    let data: AccountData = match serde_json::from_slice(payload) {
        Ok(data) => data,
        Err(e) => {
            result.failed += 1;
            result.errors.push(format!("{}: json parse failed: {}", name, e));
            return;
        }
    };

    let email = data.email.trim().to_string();
    if !overwrite && !email.is_empty() {
        let existing = ctx.data_dir.join(format!("{}.json", email));
        if existing.exists() {
            result.skipped += 1;
            result.errors.push(format!("{}: {} already exists, skipped", name, email));
            return;
        }
    }

    let req = AccountUploadRequest {
        email,
        full_name: data.full_name.clone(),
        mail_provider: data.mail_provider.clone(),
        mail_password: data.mail_password.clone(),
        cookies: data.cookies.clone(),
        cookie_string: data.cookie_string.clone(),
        authorization: data.authorization.clone(),
        config_id: data.config_id.clone(),
        csesidx: data.csesidx.clone(),
        ..AccountUploadRequest::default()
    };
    match process_account_upload(&ctx.state.pool, &ctx.data_dir, &req).await {
        Ok(()) => {
            result.success += 1;
            result.imported_emails.push(req.email);
        }
        Err(e) => {
            result.failed += 1;
            result.errors.push(format!("{}: {}", name, e));
        }
    }
}

/// Multipart import of one `.json` account file or a `.zip` of them.
pub async fn import(State(ctx): State<AdminContext>, mut multipart: Multipart) -> Response {
    let mut payload: Option<(String, Vec<u8>)> = None;
    let mut overwrite = true;

    while let Ok(Some(field)) = multipart.next_field().await {
        match field.name().unwrap_or_default() {
            "file" => {
                let name = field.file_name().unwrap_or("upload").to_string();
                match field.bytes().await {
                    Ok(bytes) => payload = Some((name, bytes.to_vec())),
                    Err(e) => {
                        return (
                            StatusCode::BAD_REQUEST,
                            Json(json!({"error": format!("read upload: {}", e)})),
                        )
                            .into_response()
                    }
                }
            }
            "overwrite" => {
                if let Ok(text) = field.text().await {
                    let text = text.trim();
                    if !text.is_empty() {
                        overwrite = text.eq_ignore_ascii_case("true") || text == "1";
                    }
                }
            }
            _ => {}
        }
    }

    let Some((name, payload)) = payload else {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({"error": "missing multipart field 'file'"})),
        )
            .into_response();
    };

    let mut result = ImportResult::default();
    let lower = name.to_ascii_lowercase();
    if lower.ends_with(".json") {
        import_single_payload(&ctx, &name, &payload, overwrite, &mut result).await;
    } else if lower.ends_with(".zip") {
        let mut archive = match zip::ZipArchive::new(std::io::Cursor::new(&payload)) {
            Ok(archive) => archive,
            Err(e) => {
                return (
                    StatusCode::BAD_REQUEST,
                    Json(json!({"error": format!("zip parse failed: {}", e)})),
                )
                    .into_response()
            }
        };
        let mut found_json = false;
        for index in 0..archive.len() {
            let (entry_name, entry_payload) = {
                let mut entry = match archive.by_index(index) {
                    Ok(entry) => entry,
                    Err(e) => {
                        result.total += 1;
                        result.failed += 1;
                        result.errors.push(format!("entry {}: {}", index, e));
                        continue;
                    }
                };
                if entry.is_dir() || !entry.name().to_ascii_lowercase().ends_with(".json") {
                    continue;
                }
                let name = entry.name().to_string();
                let mut bytes = Vec::new();
                if let Err(e) = entry.read_to_end(&mut bytes) {
                    result.total += 1;
                    result.failed += 1;
                    result.errors.push(format!("{}: read failed: {}", name, e));
                    continue;
                }
                (name, bytes)
            };
            found_json = true;
            import_single_payload(&ctx, &entry_name, &entry_payload, overwrite, &mut result).await;
        }
        if !found_json && result.total == 0 {
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({"error": "no JSON files inside the zip"})),
            )
                .into_response();
        }
    } else {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({"error": "only .zip or .json uploads are supported"})),
        )
            .into_response();
    }

    if let Err(e) = ctx.state.pool.load(&ctx.data_dir) {
        tracing::warn!("Pool reload after import failed: {}", e);
    }

    let mut body = serde_json::to_value(&result).unwrap_or_else(|_| json!({}));
    if let Value::Object(map) = &mut body {
        map.insert("overwrite".to_string(), json!(overwrite));
    }
    (StatusCode::OK, Json(body)).into_response()
}

#[derive(Debug, Serialize)]
struct DeleteCandidate {
    file_name: String,
    email: String,
    email_masked: String,
    reason: String,
    status: String,
    size_bytes: u64,
    modified_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "String::is_empty")]
    parse_error: String,
    exists_in_pool: bool,
}

fn build_delete_candidates(records: &[PoolFileRecord]) -> Vec<DeleteCandidate> {
    records
        .iter()
        .filter_map(|record| {
            let reason = if !record.invalid_reason.is_empty() {
                record.invalid_reason.clone()
            } else if record.view.pool_status == "invalid" {
                "status_invalid".to_string()
            } else {
                return None;
            };
            Some(DeleteCandidate {
                file_name: record.view.file_name.clone(),
                email: record.account_email.clone(),
                email_masked: mask_email(&record.account_email),
                reason,
                status: record.view.pool_status.clone(),
                size_bytes: record.view.size_bytes,
                modified_at: record.view.modified_at,
                parse_error: record.view.parse_error.clone(),
                exists_in_pool: record.view.exists_in_pool,
            })
        })
        .collect()
}

pub async fn delete_invalid_preview(State(ctx): State<AdminContext>) -> Response {
    let records = match collect_records(&ctx) {
        Ok(records) => records,
        Err(e) => {
            return (StatusCode::INTERNAL_SERVER_ERROR, Json(json!({"error": e}))).into_response()
        }
    };
    let candidates = build_delete_candidates(&records);
    let structure_invalid =
        candidates.iter().filter(|c| c.reason != "status_invalid").count();
    let status_invalid = candidates.len() - structure_invalid;
    Json(json!({
        "candidates": candidates,
        "total": candidates.len(),
        "summary": {
            "structure_invalid": structure_invalid,
            "status_invalid": status_invalid,
        },
    }))
    .into_response()
}

#[derive(Deserialize)]
pub struct DeleteExecuteRequest {
    pub files: Vec<String>,
    #[serde(default)]
    pub auto_backup: Option<bool>,
}

fn create_backup_zip(data_dir: &Path, paths: &[PathBuf]) -> Result<PathBuf, String> {
    let backup_name = format!("invalid-backup-{}.zip", Utc::now().format("%Y%m%d-%H%M%S"));
    let backup_path = data_dir.join(backup_name);
    let file = std::fs::File::create(&backup_path).map_err(|e| format!("create backup: {}", e))?;
    let mut writer = zip::ZipWriter::new(file);
    let options = zip::write::SimpleFileOptions::default();
    for path in paths {
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| "bad backup entry name".to_string())?;
        let raw = std::fs::read(path).map_err(|e| format!("read {}: {}", name, e))?;
        writer.start_file(name, options).map_err(|e| format!("zip entry {}: {}", name, e))?;
        writer.write_all(&raw).map_err(|e| format!("zip write {}: {}", name, e))?;
    }
    writer.finish().map_err(|e| format!("finish backup zip: {}", e))?;
    Ok(backup_path)
}

/// Execute deletion of files the preview flagged. Only file names the
/// preview would currently produce are accepted.
pub async fn delete_invalid_execute(
    State(ctx): State<AdminContext>,
    Json(req): Json<DeleteExecuteRequest>,
) -> Response {
    if req.files.is_empty() {
        return (StatusCode::BAD_REQUEST, Json(json!({"error": "files must not be empty"})))
            .into_response();
    }
    let auto_backup = req.auto_backup.unwrap_or(true);

    let records = match collect_records(&ctx) {
        Ok(records) => records,
        Err(e) => {
            return (StatusCode::INTERNAL_SERVER_ERROR, Json(json!({"error": e}))).into_response()
        }
    };
    let allowed: std::collections::HashSet<String> =
        build_delete_candidates(&records).into_iter().map(|c| c.file_name).collect();

    let mut seen = std::collections::HashSet::new();
    let unique_files: Vec<String> = req
        .files
        .iter()
        .map(|f| f.trim().to_string())
        .filter(|name| {
            // Reject path-traversal shapes and anything outside the preview.
            !name.is_empty()
                && Path::new(name).file_name().and_then(|n| n.to_str()) == Some(name.as_str())
                && name.to_ascii_lowercase().ends_with(".json")
                && allowed.contains(name)
                && seen.insert(name.clone())
        })
        .collect();
    if unique_files.is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({"error": "no deletable files given (must come from the preview)"})),
        )
            .into_response();
    }

    let paths: Vec<PathBuf> = unique_files.iter().map(|n| ctx.data_dir.join(n)).collect();
    let backup_file = if auto_backup {
        match create_backup_zip(&ctx.data_dir, &paths) {
            Ok(path) => Some(path),
            Err(e) => {
                return (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(json!({"error": format!("backup failed: {}", e)})),
                )
                    .into_response()
            }
        }
    } else {
        None
    };

    let mut deleted = Vec::new();
    let mut failed = Vec::new();
    for (name, path) in unique_files.iter().zip(&paths) {
        match std::fs::remove_file(path) {
            Ok(()) => {
                ctx.state.pool.mark_invalid(
                    name.trim_end_matches(".json"),
                    "file deleted by admin",
                    false,
                );
                deleted.push(name.clone());
            }
            Err(e) => failed.push(format!("{}: {}", name, e)),
        }
    }

    if let Err(e) = ctx.state.pool.load(&ctx.data_dir) {
        tracing::warn!("Pool reload after delete failed: {}", e);
    }

    let mut response = json!({
        "deleted_count": deleted.len(),
        "deleted_files": deleted,
        "failed": failed,
        "stats": ctx.state.pool.stats(),
    });
    if let Some(backup) = backup_file {
        response["backup_file"] = json!(backup.display().to_string());
    }
    (StatusCode::OK, Json(response)).into_response()
}
