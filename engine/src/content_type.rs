//! Content type and file extension detection for fetched bytes.
//!
//! Every path that names a file (single fetch, archive entries, uploads, cache keys)
//! goes through `resolve_content_type` so the same bytes always end up with the same
//! extension.

const OCTET_STREAM: &str = "application/octet-stream";
const PLAIN_TEXT: &str = "text/plain; charset=utf-8";

/// Extension → canonical MIME type of everything the gateway knows how to name.
const EXTENSIONS: &[(&str, &str)] = &[
    ("jpg", "image/jpeg"),
    ("png", "image/png"),
    ("gif", "image/gif"),
    ("webp", "image/webp"),
    ("mp4", "video/mp4"),
    ("mov", "video/quicktime"),
    ("webm", "video/webm"),
    ("avi", "video/x-msvideo"),
    ("mp3", "audio/mpeg"),
    ("ogg", "audio/ogg"),
    ("pdf", "application/pdf"),
    ("zip", "application/zip"),
    ("txt", "text/plain; charset=utf-8"),
];

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResolvedType {
    pub mime: &'static str,
    pub extension: &'static str,
}

impl ResolvedType {
    fn from_extension(extension: &'static str) -> Self {
        ResolvedType {
            mime: mime_for_extension(extension),
            extension,
        }
    }
}

pub fn resolve_content_type(bytes: &[u8], hint: Option<&str>) -> ResolvedType {
    let sniffed = sniff(bytes);
    let hint = hint.map(str::trim).filter(|h| !h.is_empty());

    let effective = match hint {
        Some(hint) if is_generic(sniffed) && !is_generic(hint) => hint,
        _ => sniffed,
    };

    ResolvedType::from_extension(extension_for_mime(effective))
}

/// Canonical MIME type of `extension`, `application/octet-stream` if unknown.
pub fn mime_for_extension(extension: &str) -> &'static str {
    let extension = extension.to_ascii_lowercase();
    let extension = match extension.as_str() {
        "jpeg" => "jpg",
        other => other,
    };
    EXTENSIONS
        .iter()
        .find(|(ext, _)| *ext == extension)
        .map(|(_, mime)| *mime)
        .unwrap_or(OCTET_STREAM)
}

fn sniff(bytes: &[u8]) -> &'static str {
    if let Some(kind) = infer::get(bytes) {
        return kind.mime_type();
    }
    if std::str::from_utf8(bytes).is_ok() {
        PLAIN_TEXT
    } else {
        OCTET_STREAM
    }
}

fn is_generic(mime: &str) -> bool {
    let essence = essence(mime);
    essence == OCTET_STREAM || essence == "text/plain"
}

fn essence(mime: &str) -> String {
    mime.split(';').next().unwrap_or("").trim().to_ascii_lowercase()
}

fn extension_for_mime(mime: &str) -> &'static str {
    let essence = essence(mime);
    let exact = match essence.as_str() {
        "image/jpeg" | "image/jpg" | "image/pjpeg" => Some("jpg"),
        "image/png" => Some("png"),
        "image/gif" => Some("gif"),
        "image/webp" => Some("webp"),
        "video/quicktime" => Some("mov"),
        "video/webm" => Some("webm"),
        "video/x-msvideo" => Some("avi"),
        "audio/ogg" | "application/ogg" => Some("ogg"),
        "application/pdf" => Some("pdf"),
        "application/zip" => Some("zip"),
        _ => None,
    };
    if let Some(extension) = exact {
        return extension;
    }

    match essence.split_once('/') {
        Some(("video", _)) => "mp4",
        Some(("audio", _)) => "mp3",
        Some(("text", _)) => "txt",
        _ => "bin",
    }
}
