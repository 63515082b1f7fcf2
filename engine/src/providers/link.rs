//! Downloads of arbitrary http(s) links, the input side of upload-by-link.

use super::read_limited;
use crate::client::FetchedContent;
use crate::errors::ClientError;
use url::Url;

pub struct LinkDownloader {
    http: reqwest::Client,
    max_download_bytes: u64,
}

impl LinkDownloader {
    pub fn new(http: reqwest::Client, max_download_bytes: u64) -> Self {
        LinkDownloader {
            http,
            max_download_bytes,
        }
    }

    pub async fn download(&self, link: &Url) -> Result<FetchedContent, ClientError> {
        if !matches!(link.scheme(), "http" | "https") {
            return Err(ClientError::Rejected(format!("unsupported scheme {}", link.scheme())));
        }

        let response = self.http.get(link.clone()).send().await?;
        read_limited(response, self.max_download_bytes).await
    }
}

/// Last non-empty path segment of `link`, or an empty string.
pub fn link_file_name(link: &Url) -> String {
    link.path_segments()
        .and_then(|segments| segments.filter(|s| !s.is_empty()).next_back())
        .unwrap_or_default()
        .to_string()
}
