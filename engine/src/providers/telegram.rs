//! Client for the Telegram bot API.
//!
//! One `BotApiClient` per bot token. Files are looked up with `getFile`, downloaded from
//! the file endpoint and uploaded with the `send*` methods, which return the id the
//! upstream assigned to the stored copy.

use super::read_limited;
use crate::client::{ClientFactory, FetchedContent, NamedClient, ResolveFetchStore, ResourceLocator, StoreRequest};
use crate::errors::ClientError;
use crate::locator::normalize_locator;
use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;
use url::Url;

pub const DEFAULT_MAX_DOWNLOAD_BYTES: u64 = 50 * 1024 * 1024;

#[derive(Deserialize)]
struct ApiResponse<T> {
    ok: bool,
    result: Option<T>,
    description: Option<String>,
}

#[derive(Deserialize)]
struct FileInfo {
    file_path: Option<String>,
}

/// Kind of `send*` method an upload goes through.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum UploadKind {
    Photo,
    Video,
    Audio,
    Document,
}

impl UploadKind {
    fn for_content_type(content_type: &str) -> Self {
        if content_type.starts_with("image/") {
            UploadKind::Photo
        } else if content_type.starts_with("video/") {
            UploadKind::Video
        } else if content_type.starts_with("audio/") {
            UploadKind::Audio
        } else {
            UploadKind::Document
        }
    }

    fn field(&self) -> &'static str {
        match self {
            UploadKind::Photo => "photo",
            UploadKind::Video => "video",
            UploadKind::Audio => "audio",
            UploadKind::Document => "document",
        }
    }

    fn method(&self) -> &'static str {
        match self {
            UploadKind::Photo => "sendPhoto",
            UploadKind::Video => "sendVideo",
            UploadKind::Audio => "sendAudio",
            UploadKind::Document => "sendDocument",
        }
    }
}

pub struct BotApiClient {
    http: reqwest::Client,
    base_url: String,
    token: String,
    max_download_bytes: u64,
}

impl BotApiClient {
    pub fn new(http: reqwest::Client, base_url: &Url, token: impl Into<String>, max_download_bytes: u64) -> Self {
        BotApiClient {
            http,
            base_url: base_url.as_str().trim_end_matches('/').to_string(),
            token: token.into(),
            max_download_bytes,
        }
    }

    fn method_url(&self, method: &str) -> String {
        format!("{}/bot{}/{}", self.base_url, self.token, method)
    }

    fn file_url(&self, locator: &ResourceLocator) -> String {
        format!("{}/file/bot{}{}", self.base_url, self.token, locator.as_str())
    }

    async fn read_json(response: reqwest::Response) -> Result<Value, ClientError> {
        let status = response.status();
        let body = response.bytes().await?;
        if !status.is_success() {
            return Err(ClientError::Status {
                status: status.as_u16(),
                body: String::from_utf8_lossy(&body).into_owned(),
            });
        }
        serde_json::from_slice(&body).map_err(|e| ClientError::InvalidResponse(e.to_string()))
    }
}

/// Builds `BotApiClient`s for tokens supplied per request.
pub struct BotApiFactory {
    http: reqwest::Client,
    base_url: Url,
    max_download_bytes: u64,
}

impl BotApiFactory {
    pub fn new(http: reqwest::Client, base_url: Url, max_download_bytes: u64) -> Self {
        BotApiFactory {
            http,
            base_url,
            max_download_bytes,
        }
    }
}

impl ClientFactory for BotApiFactory {
    fn client_for(&self, credential: &str) -> NamedClient {
        let client = BotApiClient::new(self.http.clone(), &self.base_url, credential, self.max_download_bytes);
        NamedClient::new("source", Arc::new(client))
    }
}

fn unwrap_api<T>(response: ApiResponse<T>) -> Result<T, ClientError> {
    if !response.ok {
        return Err(ClientError::Rejected(
            response.description.unwrap_or_else(|| "no description".to_string()),
        ));
    }
    response
        .result
        .ok_or_else(|| ClientError::InvalidResponse("missing result".to_string()))
}

/// Extracts the id of the stored file from a `send*` result. Photos come back in several
/// sizes; the last one is the largest.
fn stored_file_id(result: &Value, kind: UploadKind) -> Option<String> {
    let file = match kind {
        UploadKind::Photo => result.get("photo")?.as_array()?.last()?,
        other => result.get(other.field())?,
    };
    file.get("file_id")?
        .as_str()
        .filter(|id| !id.is_empty())
        .map(String::from)
}

#[async_trait]
impl ResolveFetchStore for BotApiClient {
    async fn resolve(&self, resource_id: &str) -> Result<ResourceLocator, ClientError> {
        let response = self
            .http
            .post(self.method_url("getFile"))
            .json(&serde_json::json!({ "file_id": resource_id }))
            .send()
            .await?;

        let value = Self::read_json(response).await?;
        let parsed: ApiResponse<FileInfo> =
            serde_json::from_value(value).map_err(|e| ClientError::InvalidResponse(e.to_string()))?;
        let file_path = unwrap_api(parsed)?
            .file_path
            .filter(|path| !path.is_empty())
            .ok_or_else(|| ClientError::InvalidResponse("empty file path".to_string()))?;

        Ok(ResourceLocator::new(normalize_locator(&file_path, &self.token)))
    }

    async fn fetch(&self, locator: &ResourceLocator) -> Result<FetchedContent, ClientError> {
        let response = self.http.get(self.file_url(locator)).send().await?;
        read_limited(response, self.max_download_bytes).await
    }

    async fn store(&self, request: &StoreRequest) -> Result<String, ClientError> {
        let kind = UploadKind::for_content_type(&request.content_type);
        let part = Part::bytes(request.bytes.to_vec())
            .file_name(request.name.clone())
            .mime_str(&request.content_type)?;
        let form = Form::new()
            .text("chat_id", request.destination.clone())
            .part(kind.field(), part);

        let response = self
            .http
            .post(self.method_url(kind.method()))
            .multipart(form)
            .send()
            .await?;

        let value = Self::read_json(response).await?;
        let parsed: ApiResponse<Value> =
            serde_json::from_value(value).map_err(|e| ClientError::InvalidResponse(e.to_string()))?;
        let result = unwrap_api(parsed)?;

        stored_file_id(&result, kind)
            .ok_or_else(|| ClientError::InvalidResponse(format!("no file id for {} in response", kind.field())))
    }

    fn describe(&self) -> String {
        let visible: String = self.token.chars().take(6).collect();
        format!("BotApiClient{{token: {visible}***}}")
    }
}
