use crate::errors::GatewayError;
use crate::metrics_defs::{REQUEST_DURATION, REQUESTS_INFLIGHT};
use crate::routes::{Action, RouteMatch, Router};
use bytes::Bytes;
use engine::{ArchiveItem, ArchiveJob, ArchiveStream, Engine, ServedFrom, StoreOptions, StoredResource};
use http::header::{CACHE_CONTROL, CONTENT_DISPOSITION, CONTENT_LENGTH, CONTENT_TYPE, HeaderName};
use http::{Request, Response, StatusCode};
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Full, LengthLimitError, Limited};
use hyper::body::{Body, Frame, Incoming};
use hyper::service::Service;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use shared::http::make_boxed_error_response;
use shared::{gauge, histogram};
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll, ready};
use std::time::Instant;
use url::Url;

pub type GatewayBody = BoxBody<Bytes, GatewayError>;

const X_CACHE: HeaderName = HeaderName::from_static("x-cache");
const X_CACHE_KEY: HeaderName = HeaderName::from_static("x-cache-key");
const X_SERVED_BY: HeaderName = HeaderName::from_static("x-served-by");
const X_FILE_NAME: &str = "x-file-name";

const CACHE_CONTROL_VALUE: &str = "public, max-age=86400";
const MAX_JSON_BYTES: usize = 1024 * 1024;

#[derive(Deserialize)]
struct ArchiveRequest {
    items: Vec<ArchiveRequestItem>,
}

#[derive(Deserialize)]
struct ArchiveRequestItem {
    scope: String,
    id: String,
    name: Option<String>,
    client: Option<String>,
}

#[derive(Deserialize)]
struct LinkRequest {
    link: String,
    name: Option<String>,
}

#[derive(Deserialize)]
struct TransferRequest {
    file_id: String,
    credential: String,
    scope: String,
    destination: Option<String>,
    client: Option<String>,
}

#[derive(Serialize)]
struct ErrorBody {
    result: bool,
    message: String,
}

#[derive(Serialize)]
struct UploadBody<'a> {
    result: bool,
    file_id: &'a str,
    client: &'a str,
    content_type: &'a str,
    extension: &'a str,
}

#[derive(Serialize)]
struct ScopesBody {
    result: bool,
    scopes: BTreeMap<String, Vec<String>>,
}

/// Public media endpoints.
#[derive(Clone)]
pub struct GatewayService {
    engine: Arc<Engine>,
    router: Arc<Router>,
    max_upload_bytes: usize,
}

impl GatewayService {
    pub fn new(engine: Arc<Engine>, max_upload_bytes: usize) -> Self {
        GatewayService {
            engine,
            router: Arc::new(Router::gateway()),
            max_upload_bytes,
        }
    }

    /// Turns every request into a response; failures become JSON error bodies.
    pub async fn handle<B>(&self, request: Request<B>) -> Response<GatewayBody>
    where
        B: Body<Data = Bytes> + Send,
        B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        let start = Instant::now();
        gauge!(REQUESTS_INFLIGHT).increment(1.0);

        let (route, result) = self.dispatch(request).await;
        let response = result.unwrap_or_else(error_response);

        gauge!(REQUESTS_INFLIGHT).decrement(1.0);
        histogram!(
            REQUEST_DURATION,
            "route" => route,
            "status" => response.status().as_u16().to_string()
        )
        .record(start.elapsed().as_secs_f64());

        response
    }

    async fn dispatch<B>(&self, request: Request<B>) -> (&'static str, Result<Response<GatewayBody>, GatewayError>)
    where
        B: Body<Data = Bytes> + Send,
        B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        let method = request.method().clone();
        let path = request.uri().path().to_string();
        let query = parse_query(request.uri().query());

        let (action, params) = match self.router.resolve(&method, &path) {
            RouteMatch::Found { action, params } => (action, params),
            RouteMatch::MethodNotAllowed => return ("unknown", Err(GatewayError::MethodNotAllowed)),
            RouteMatch::NotFound => return ("unknown", Err(GatewayError::NotFound(format!("route {path}")))),
        };

        let result = match action {
            Action::Instant => self.instant(&params, &query).await,
            Action::CachedOnly => self.cached_only(&params).await,
            Action::Archive => self.archive(request).await,
            Action::Upload => self.upload(&params, &query, request).await,
            Action::UploadLink => self.upload_link(&params, &query, request).await,
            Action::Transfer => self.transfer(request).await,
            Action::Scopes => self.scopes(),
        };
        (action.name(), result)
    }

    async fn instant(
        &self,
        params: &HashMap<&str, &str>,
        query: &HashMap<String, String>,
    ) -> Result<Response<GatewayBody>, GatewayError> {
        let scope = param(params, "scope")?;
        let id = param(params, "id")?;
        let client = params
            .get("client")
            .copied()
            .or_else(|| query.get("client").map(String::as_str));

        let resource = self.engine.service().fetch(scope, id, client).await?;
        let (cache_status, served_by) = match &resource.served_from {
            ServedFrom::Cache => ("HIT", "cache"),
            ServedFrom::Origin { client } => ("MISS", client.as_str()),
        };

        Ok(Response::builder()
            .status(StatusCode::OK)
            .header(CONTENT_TYPE, resource.content_type.as_str())
            .header(CONTENT_LENGTH, resource.bytes.len())
            .header(CACHE_CONTROL, CACHE_CONTROL_VALUE)
            .header(X_CACHE, cache_status)
            .header(X_SERVED_BY, served_by)
            .body(full(resource.bytes))?)
    }

    async fn cached_only(&self, params: &HashMap<&str, &str>) -> Result<Response<GatewayBody>, GatewayError> {
        let scope = param(params, "scope")?;
        let id = param(params, "id")?;
        let service = self.engine.service();
        if !service.registry().contains(scope) {
            return Err(engine::EngineError::UnknownScope(scope.to_string()).into());
        }

        let (entry, content) = match service.cache().lookup(scope, id).await {
            Ok(Some(hit)) => hit,
            Ok(None) => return Err(GatewayError::NotFound(format!("{scope}/{id} in cache"))),
            Err(error) => {
                tracing::warn!(scope, id, %error, "Cache lookup failed");
                return Err(GatewayError::NotFound(format!("{scope}/{id} in cache")));
            }
        };

        Ok(Response::builder()
            .status(StatusCode::OK)
            .header(CONTENT_TYPE, content.content_type.as_str())
            .header(CONTENT_LENGTH, content.bytes.len())
            .header(CACHE_CONTROL, CACHE_CONTROL_VALUE)
            .header(X_CACHE, "HIT")
            .header(X_CACHE_KEY, entry.key())
            .body(full(content.bytes))?)
    }

    async fn archive<B>(&self, request: Request<B>) -> Result<Response<GatewayBody>, GatewayError>
    where
        B: Body<Data = Bytes> + Send,
        B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        let body = read_body(request.into_body(), MAX_JSON_BYTES).await?;
        let parsed: ArchiveRequest =
            serde_json::from_slice(&body).map_err(|e| GatewayError::BadRequest(format!("invalid archive request: {e}")))?;
        if let Some(position) = parsed
            .items
            .iter()
            .position(|item| item.scope.trim().is_empty() || item.id.trim().is_empty())
        {
            return Err(GatewayError::BadRequest(format!(
                "archive item {position} needs a scope and an id"
            )));
        }

        let job = ArchiveJob {
            items: parsed
                .items
                .into_iter()
                .map(|item| ArchiveItem {
                    display_name: item.name.unwrap_or_else(|| item.id.clone()),
                    scope: item.scope,
                    resource_id: item.id,
                    preferred_client: item.client,
                })
                .collect(),
        };
        let item_count = job.items.len();
        let stream = self.engine.archive().assemble(job)?;

        let archive_name = format!("{:x}.zip", Sha256::digest(&body));
        tracing::info!(items = item_count, archive_name, "Streaming archive");

        Ok(Response::builder()
            .status(StatusCode::OK)
            .header(CONTENT_TYPE, "application/zip")
            .header(CONTENT_DISPOSITION, format!("attachment; filename=\"{archive_name}\""))
            .body(ArchiveBody { stream }.boxed())?)
    }

    async fn upload<B>(
        &self,
        params: &HashMap<&str, &str>,
        query: &HashMap<String, String>,
        request: Request<B>,
    ) -> Result<Response<GatewayBody>, GatewayError>
    where
        B: Body<Data = Bytes> + Send,
        B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        let scope = param(params, "scope")?;
        let name = request
            .headers()
            .get(X_FILE_NAME)
            .and_then(|value| value.to_str().ok())
            .unwrap_or_default()
            .to_string();
        let client = query.get("client").map(String::as_str);
        let race = is_true(query.get("race"));

        let body = read_body(request.into_body(), self.max_upload_bytes).await?;
        if body.is_empty() {
            return Err(GatewayError::BadRequest("empty upload".to_string()));
        }

        let stored = self
            .engine
            .service()
            .store(scope, &name, body, client, race)
            .await?;

        Ok(stored_response(&stored))
    }

    async fn upload_link<B>(
        &self,
        params: &HashMap<&str, &str>,
        query: &HashMap<String, String>,
        request: Request<B>,
    ) -> Result<Response<GatewayBody>, GatewayError>
    where
        B: Body<Data = Bytes> + Send,
        B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        let scope = param(params, "scope")?;
        let body = read_body(request.into_body(), MAX_JSON_BYTES).await?;
        let parsed: LinkRequest =
            serde_json::from_slice(&body).map_err(|e| GatewayError::BadRequest(format!("invalid link request: {e}")))?;

        let link = Url::parse(parsed.link.trim()).map_err(|e| GatewayError::BadRequest(format!("invalid link: {e}")))?;
        if !matches!(link.scheme(), "http" | "https") {
            return Err(GatewayError::BadRequest(format!("unsupported link scheme {}", link.scheme())));
        }

        let options = StoreOptions {
            preferred: query.get("client").map(String::as_str),
            race: is_true(query.get("race")),
            ..StoreOptions::default()
        };
        let stored = self
            .engine
            .upload_link(scope, &link, parsed.name.as_deref(), options)
            .await?;
        Ok(stored_response(&stored))
    }

    async fn transfer<B>(&self, request: Request<B>) -> Result<Response<GatewayBody>, GatewayError>
    where
        B: Body<Data = Bytes> + Send,
        B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        let body = read_body(request.into_body(), MAX_JSON_BYTES).await?;
        let parsed: TransferRequest = serde_json::from_slice(&body)
            .map_err(|e| GatewayError::BadRequest(format!("invalid transfer request: {e}")))?;
        for (field, value) in [
            ("file_id", &parsed.file_id),
            ("credential", &parsed.credential),
            ("scope", &parsed.scope),
        ] {
            if value.trim().is_empty() {
                return Err(GatewayError::BadRequest(format!("{field} is required")));
            }
        }

        let options = StoreOptions {
            preferred: parsed.client.as_deref(),
            destination: parsed.destination.as_deref(),
            ..StoreOptions::default()
        };
        let stored = self
            .engine
            .transfer(&parsed.credential, &parsed.file_id, &parsed.scope, options)
            .await?;
        Ok(stored_response(&stored))
    }

    fn scopes(&self) -> Result<Response<GatewayBody>, GatewayError> {
        Ok(json_response(
            StatusCode::OK,
            &ScopesBody {
                result: true,
                scopes: self.engine.service().registry().details(),
            },
        ))
    }
}

impl Service<Request<Incoming>> for GatewayService {
    type Response = Response<GatewayBody>;
    type Error = GatewayError;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send + 'static>>;

    fn call(&self, request: Request<Incoming>) -> Self::Future {
        let service = self.clone();
        Box::pin(async move { Ok(service.handle(request).await) })
    }
}

/// Response body fed by an archive being assembled. An archive failure surfaces as a
/// body error, which makes hyper abort the response instead of ending it cleanly.
struct ArchiveBody {
    stream: ArchiveStream,
}

impl Body for ArchiveBody {
    type Data = Bytes;
    type Error = GatewayError;

    fn poll_frame(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Result<Frame<Bytes>, GatewayError>>> {
        match ready!(self.get_mut().stream.poll_next_chunk(cx)) {
            Some(Ok(chunk)) => Poll::Ready(Some(Ok(Frame::data(chunk)))),
            Some(Err(error)) => Poll::Ready(Some(Err(error.into()))),
            None => Poll::Ready(None),
        }
    }
}

fn param<'p>(params: &HashMap<&str, &'p str>, name: &str) -> Result<&'p str, GatewayError> {
    params
        .get(name)
        .copied()
        .ok_or_else(|| GatewayError::BadRequest(format!("missing {name}")))
}

fn is_true(flag: Option<&String>) -> bool {
    matches!(flag.map(String::as_str), Some("true" | "1"))
}

fn stored_response(stored: &StoredResource) -> Response<GatewayBody> {
    json_response(
        StatusCode::OK,
        &UploadBody {
            result: true,
            file_id: &stored.resource_id,
            client: &stored.client,
            content_type: &stored.content_type,
            extension: &stored.extension,
        },
    )
}

fn parse_query(query: Option<&str>) -> HashMap<String, String> {
    query
        .map(|q| url::form_urlencoded::parse(q.as_bytes()).into_owned().collect())
        .unwrap_or_default()
}

async fn read_body<B>(body: B, limit: usize) -> Result<Bytes, GatewayError>
where
    B: Body<Data = Bytes>,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    match Limited::new(body, limit).collect().await {
        Ok(collected) => Ok(collected.to_bytes()),
        Err(e) if e.downcast_ref::<LengthLimitError>().is_some() => Err(GatewayError::PayloadTooLarge(limit)),
        Err(e) => Err(GatewayError::BadRequest(format!("could not read body: {e}"))),
    }
}

fn full(bytes: Bytes) -> GatewayBody {
    Full::new(bytes).map_err(|e| match e {}).boxed()
}

fn json_response(status: StatusCode, value: &impl Serialize) -> Response<GatewayBody> {
    let Ok(body) = serde_json::to_vec(value) else {
        return make_boxed_error_response(StatusCode::INTERNAL_SERVER_ERROR);
    };

    let mut response = Response::new(full(Bytes::from(body)));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, http::HeaderValue::from_static("application/json"));
    response
}

fn error_response(error: GatewayError) -> Response<GatewayBody> {
    let status = error.status();
    // Upstream failure detail stays in the logs
    let message = if status.is_server_error() {
        tracing::warn!(status = status.as_u16(), %error, "Request failed");
        status.canonical_reason().unwrap_or("request failed").to_string()
    } else {
        tracing::debug!(status = status.as_u16(), %error, "Request rejected");
        error.to_string()
    };

    json_response(status, &ErrorBody { result: false, message })
}
