/// Directories the bot API stores media under.
const MEDIA_FOLDERS: &[&str] = &[
    "photos",
    "videos",
    "documents",
    "animations",
    "voice",
    "music",
    "video_notes",
    "stickers",
    "thumbnails",
];

/// Turns whatever path form the upstream returned into a download path relative to the
/// credential, with exactly one leading `/`.
///
/// Upstreams return paths in several shapes: bare (`photos/file_1.jpg`), prefixed with
/// the download route and credential (`/file/bot<token>/photos/file_1.jpg`), or as a
/// full URL. The credential never survives normalization.
pub fn normalize_locator(raw: &str, credential: &str) -> String {
    let tail = if !credential.is_empty()
        && let Some(index) = raw.rfind(credential)
    {
        &raw[index + credential.len()..]
    } else if let Some(index) = media_folder_start(raw) {
        &raw[index..]
    } else {
        raw
    };

    format!("/{}", tail.trim_start_matches('/'))
}

fn media_folder_start(raw: &str) -> Option<usize> {
    let mut offset = 0;
    for segment in raw.split('/') {
        if MEDIA_FOLDERS.contains(&segment) {
            return Some(offset);
        }
        offset += segment.len() + 1;
    }
    None
}
