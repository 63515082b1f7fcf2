//! Upstream provider implementations of `ResolveFetchStore`, plus plain link downloads.

pub mod link;
pub mod telegram;

pub use link::LinkDownloader;
pub use telegram::{BotApiClient, BotApiFactory};

use crate::client::FetchedContent;
use crate::errors::ClientError;
use bytes::BytesMut;

/// Reads a download body, failing with `TooLarge` as soon as it grows past `limit`.
async fn read_limited(mut response: reqwest::Response, limit: u64) -> Result<FetchedContent, ClientError> {
    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(ClientError::Status {
            status: status.as_u16(),
            body,
        });
    }

    if let Some(size) = response.content_length()
        && size > limit
    {
        return Err(ClientError::TooLarge { size, limit });
    }

    let content_type_hint = response
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .map(String::from);

    let mut bytes = BytesMut::new();
    while let Some(chunk) = response.chunk().await? {
        let size = (bytes.len() + chunk.len()) as u64;
        if size > limit {
            return Err(ClientError::TooLarge { size, limit });
        }
        bytes.extend_from_slice(&chunk);
    }

    Ok(FetchedContent {
        bytes: bytes.freeze(),
        content_type_hint,
    })
}
