//! Media part extraction and normalization.
//!
//! Images that are not already PNG/JPEG are re-encoded to PNG; video MIME
//! types collapse onto the set the upstream accepts.

use base64::Engine;
use gembiz_types::error::UpstreamError;

const BASE64: base64::engine::GeneralPurpose = base64::engine::general_purpose::STANDARD;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKind {
    Image,
    Video,
}

/// One media part pulled from a user message: either inline base64 bytes or
/// a URL to upload/fetch.
#[derive(Debug, Clone)]
pub struct MediaPart {
    pub kind: MediaKind,
    pub mime_type: String,
    /// Base64 content for inline parts.
    pub data: String,
    pub url: String,
    pub is_url: bool,
}

const VIDEO_EXTENSIONS: &[&str] = &[".mp4", ".webm", ".mov", ".avi", ".mkv", ".m4v"];

/// Parse an `image_url`/`video_url`/`file` URL value into a media part.
/// `data:` URLs decode inline; anything else stays a URL for
/// upload-by-reference with a download fallback.
pub fn parse_media_url(url: &str, default_kind: MediaKind) -> Option<MediaPart> {
    if let Some(rest) = url.strip_prefix("data:") {
        let (meta, payload) = rest.split_once(',')?;
        let mut data = payload.to_string();
        let (kind, mime_type) = if meta.contains("video/") {
            (MediaKind::Video, normalize_video_mime(meta).to_string())
        } else {
            let mime = if meta.contains("image/png") {
                "image/png".to_string()
            } else if meta.contains("image/jpeg") {
                "image/jpeg".to_string()
            } else {
                match convert_base64_to_png(&data) {
                    Ok(converted) => {
                        data = converted;
                        "image/png".to_string()
                    }
                    Err(e) => {
                        tracing::warn!("base64 image conversion failed ({}): {}", meta, e);
                        "image/jpeg".to_string()
                    }
                }
            };
            (MediaKind::Image, mime)
        };
        return Some(MediaPart {
            kind,
            mime_type,
            data,
            url: String::new(),
            is_url: false,
        });
    }

    let lower = url.to_ascii_lowercase();
    let kind = if VIDEO_EXTENSIONS.iter().any(|ext| lower.ends_with(ext)) {
        MediaKind::Video
    } else {
        default_kind
    };
    Some(MediaPart {
        kind,
        mime_type: String::new(),
        data: String::new(),
        url: url.to_string(),
        is_url: true,
    })
}

/// Collapse video MIME variants onto what the upstream accepts.
pub fn normalize_video_mime(mime: &str) -> &'static str {
    let mime = mime.to_ascii_lowercase();
    if mime.contains("webm") {
        "video/webm"
    } else if mime.contains("3gpp") {
        "video/3gpp"
    } else {
        // mp4, quicktime/mov, avi, mkv, and anything unknown upload as mp4
        "video/mp4"
    }
}

/// Re-encode arbitrary image bytes as PNG.
pub fn convert_to_png(data: &[u8]) -> Result<Vec<u8>, String> {
    let img = image::load_from_memory(data).map_err(|e| format!("decode image: {}", e))?;
    let mut out = std::io::Cursor::new(Vec::new());
    img.write_to(&mut out, image::ImageFormat::Png).map_err(|e| format!("encode png: {}", e))?;
    Ok(out.into_inner())
}

pub fn convert_base64_to_png(data: &str) -> Result<String, String> {
    let bytes = BASE64.decode(data).map_err(|e| format!("decode base64: {}", e))?;
    Ok(BASE64.encode(convert_to_png(&bytes)?))
}

/// Download user-supplied media. 401/403 from the remote host surface as
/// [`UpstreamError::MediaDownload`] and must not trigger account rotation.
pub async fn download_media(
    client: &reqwest::Client,
    url: &str,
    kind: MediaKind,
) -> Result<(String, String), UpstreamError> {
    let resp = client
        .get(url)
        .send()
        .await
        .map_err(|e| UpstreamError::Network { message: format!("media download: {}", e) })?;
    let status = resp.status().as_u16();
    if status == 401 || status == 403 {
        return Err(UpstreamError::MediaDownload { status });
    }
    if status >= 400 {
        return Err(UpstreamError::MediaDownload { status });
    }
    let mime = resp
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();
    let bytes = resp
        .bytes()
        .await
        .map_err(|e| UpstreamError::Network { message: format!("media download body: {}", e) })?;

    if kind == MediaKind::Video || mime.starts_with("video/") {
        let mime = if mime.is_empty() { "video/mp4".to_string() } else { mime };
        return Ok((BASE64.encode(&bytes), normalize_video_mime(&mime).to_string()));
    }

    let mime = if mime.is_empty() { "image/jpeg".to_string() } else { mime };
    if !mime.contains("jpeg") && !mime.contains("png") {
        match convert_to_png(&bytes) {
            Ok(converted) => return Ok((BASE64.encode(converted), "image/png".to_string())),
            Err(e) => tracing::warn!("image conversion failed ({}): {}, keeping original", mime, e),
        }
    }
    Ok((BASE64.encode(&bytes), mime))
}

/// Render an inline image as a markdown data URI.
pub fn format_image_as_markdown(mime: &str, base64_data: &str) -> String {
    format!("![image](data:{};base64,{})", mime, base64_data)
}
