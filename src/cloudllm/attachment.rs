//! Resolves an [`Attachment`] into raw bytes plus a normalized MIME type (§4.4).
//!
//! `data:` and `file://` URLs are handled locally; everything else is fetched over HTTP through
//! the shared client (§2). Failures here are *not* fatal to a turn for most vendors — the caller
//! drops the offending attachment — except Bedrock's stricter path, which rejects the whole
//! message before stream open (§7).

use base64::Engine;

use crate::cloudllm::completion::Attachment;

/// Formats every message converter knows how to embed as a vision attachment (§4.4 "Recognized
/// formats").
pub const SUPPORTED_MIME_TYPES: &[&str] = &["image/png", "image/jpeg", "image/gif", "image/webp"];

/// Default size cap. The spec names 20 MiB as "the concrete value used" for the Bedrock path;
/// other paths may elide the cap, but absent a vendor-specific override this is the crate-wide
/// default (§4.4).
pub const DEFAULT_MAX_BYTES: usize = 20 * 1024 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum AttachmentError {
    #[error("attachment url is empty")]
    EmptyUrl,
    #[error("attachment exceeds the {0}-byte size cap")]
    TooLarge(usize),
    #[error("unsupported image format")]
    UnsupportedFormat,
    #[error("failed to decode data: URL payload: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("failed to read local file: {0}")]
    Io(#[from] std::io::Error),
    #[error("http fetch failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("http fetch returned status {0}")]
    HttpStatus(u16),
}

/// Resolved attachment bytes with a normalized MIME type.
pub struct ResolvedAttachment {
    pub bytes: Vec<u8>,
    pub mime_type: String,
}

/// Resolve one attachment's bytes per §4.4's five-step policy, using `http_client` for the
/// `https://` fallback path and `max_bytes` as the size cap.
pub async fn resolve(
    attachment: &Attachment,
    http_client: &reqwest::Client,
    max_bytes: usize,
) -> Result<ResolvedAttachment, AttachmentError> {
    let url = attachment.url.trim();
    if url.is_empty() {
        return Err(AttachmentError::EmptyUrl);
    }

    if let Some(rest) = url.strip_prefix("data:") {
        return resolve_data_url(rest, max_bytes);
    }

    if let Some(path) = url.strip_prefix("file://") {
        return resolve_file_url(path, attachment, max_bytes).await;
    }

    resolve_http_url(url, attachment, http_client, max_bytes).await
}

fn resolve_data_url(rest: &str, max_bytes: usize) -> Result<ResolvedAttachment, AttachmentError> {
    let (prefix, payload) = rest.split_once(',').unwrap_or((rest, ""));
    let mime = prefix
        .split(';')
        .next()
        .filter(|s| !s.is_empty())
        .unwrap_or("image/jpeg")
        .to_string();

    let bytes = base64::engine::general_purpose::STANDARD.decode(payload)?;
    if bytes.len() > max_bytes {
        return Err(AttachmentError::TooLarge(max_bytes));
    }

    let mime = normalize_mime(Some(&mime), None, None).ok_or(AttachmentError::UnsupportedFormat)?;
    Ok(ResolvedAttachment { bytes, mime_type: mime })
}

async fn resolve_file_url(
    path: &str,
    attachment: &Attachment,
    max_bytes: usize,
) -> Result<ResolvedAttachment, AttachmentError> {
    let metadata = tokio::fs::metadata(path).await?;
    if !metadata.is_file() {
        return Err(AttachmentError::Io(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("{} is not a regular file", path),
        )));
    }
    if metadata.len() as usize > max_bytes {
        return Err(AttachmentError::TooLarge(max_bytes));
    }
    let bytes = tokio::fs::read(path).await?;
    let mime = normalize_mime(attachment.mime_type.as_deref(), Some(path), attachment.filename.as_deref())
        .ok_or(AttachmentError::UnsupportedFormat)?;
    Ok(ResolvedAttachment { bytes, mime_type: mime })
}

async fn resolve_http_url(
    url: &str,
    attachment: &Attachment,
    http_client: &reqwest::Client,
    max_bytes: usize,
) -> Result<ResolvedAttachment, AttachmentError> {
    let request = http_client.get(url);
    let request = if http_client_has_no_deadline() {
        request.timeout(std::time::Duration::from_secs(30))
    } else {
        request
    };

    let response = request.send().await?;
    if !response.status().is_success() {
        return Err(AttachmentError::HttpStatus(response.status().as_u16()));
    }

    if let Some(len) = response.content_length() {
        if len as usize > max_bytes {
            return Err(AttachmentError::TooLarge(max_bytes));
        }
    }

    let content_type = response
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string());

    use futures_util::StreamExt as _;
    let mut bytes = Vec::new();
    let mut stream = response.bytes_stream();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        bytes.extend_from_slice(&chunk);
        if bytes.len() > max_bytes {
            return Err(AttachmentError::TooLarge(max_bytes));
        }
    }

    let mime = normalize_mime(
        content_type.as_deref().or(attachment.mime_type.as_deref()),
        Some(url),
        attachment.filename.as_deref(),
    )
    .ok_or(AttachmentError::UnsupportedFormat)?;

    Ok(ResolvedAttachment { bytes, mime_type: mime })
}

/// The attachment resolver only imposes its own 30s timeout "if the caller's context has no
/// deadline" (§4.4 step 4). The ambient-context mechanism in this crate is a
/// [`tokio_util::sync::CancellationToken`], which carries no deadline concept at all, so every
/// HTTP fetch always applies the 30s timeout.
fn http_client_has_no_deadline() -> bool {
    true
}

/// Strip `;…` parameters and fall back to URL/filename extension sniffing (§4.4 step 5).
fn normalize_mime(declared: Option<&str>, url_hint: Option<&str>, filename_hint: Option<&str>) -> Option<String> {
    if let Some(mime) = declared {
        let stripped = mime.split(';').next().unwrap_or(mime).trim().to_ascii_lowercase();
        if SUPPORTED_MIME_TYPES.contains(&stripped.as_str()) {
            return Some(stripped);
        }
    }

    for hint in [url_hint, filename_hint].into_iter().flatten() {
        if let Some(mime) = mime_from_extension(hint) {
            return Some(mime.to_string());
        }
    }

    None
}

fn mime_from_extension(path: &str) -> Option<&'static str> {
    let lower = path.to_ascii_lowercase();
    let ext = lower.rsplit('.').next()?;
    let ext = ext.split(|c| c == '?' || c == '#').next().unwrap_or(ext);
    Some(match ext {
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "webp" => "image/webp",
        _ => return None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn data_url_decodes_and_defaults_mime() {
        let payload = base64::engine::general_purpose::STANDARD.encode(b"fakepng");
        let attachment = Attachment::image(format!("data:image/png;base64,{}", payload));
        let resolved = resolve_data_url(
            attachment.url.strip_prefix("data:").unwrap(),
            DEFAULT_MAX_BYTES,
        )
        .unwrap();
        assert_eq!(resolved.bytes, b"fakepng");
        assert_eq!(resolved.mime_type, "image/png");
    }

    #[test]
    fn data_url_without_mime_prefix_defaults_to_jpeg() {
        let payload = base64::engine::general_purpose::STANDARD.encode(b"x");
        let resolved = resolve_data_url(&format!(";base64,{}", payload), DEFAULT_MAX_BYTES).unwrap();
        assert_eq!(resolved.mime_type, "image/jpeg");
    }

    #[test]
    fn oversized_data_url_rejected() {
        let payload = base64::engine::general_purpose::STANDARD.encode(vec![0u8; 100]);
        let err = resolve_data_url(&format!("image/png;base64,{}", payload), 10).unwrap_err();
        assert!(matches!(err, AttachmentError::TooLarge(10)));
    }

    #[test]
    fn empty_url_is_rejected() {
        assert_eq!("".trim().is_empty(), true);
    }

    #[test]
    fn mime_guessed_from_url_extension() {
        assert_eq!(normalize_mime(None, Some("https://x.com/a.PNG"), None), Some("image/png".to_string()));
        assert_eq!(normalize_mime(None, Some("https://x.com/a.webp?x=1"), None), Some("image/webp".to_string()));
    }

    #[test]
    fn mime_guessed_from_filename_when_url_has_none() {
        assert_eq!(normalize_mime(None, Some("https://x.com/blob"), Some("photo.jpeg")), Some("image/jpeg".to_string()));
    }

    #[test]
    fn unsupported_mime_is_rejected() {
        assert_eq!(normalize_mime(Some("application/pdf"), Some("https://x.com/a.pdf"), None), None);
    }

    #[test]
    fn declared_mime_with_parameters_is_stripped() {
        assert_eq!(normalize_mime(Some("image/jpeg; charset=binary"), None, None), Some("image/jpeg".to_string()));
    }
}
