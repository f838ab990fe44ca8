//! Signed request dispatch and the bucket→region cache.

use crate::config::EndpointConfig;
use crate::document::Document;
use crate::error::{Error, Result, ServiceError};
use crate::query::{has_dot_segment, resource_path, Query};
use crate::retry::{Delay, RetryPolicy, AUTHORIZATION_HEADER_MALFORMED};
use crate::signing;
use crate::transport::{collect_body, ByteStream, HttpRequest, Transport};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use bytes::Bytes;
use chrono::Utc;
use md5::{Digest, Md5};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_TYPE};
use reqwest::{Method, StatusCode};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tracing::{debug, info};
use url::Url;

/// Attempts allowed for region correction, counting the first request.
pub const REGION_REDIRECT_ATTEMPTS: u32 = 3;

/// Region the service reports for the bucket, also sent on error responses.
pub const X_AMZ_BUCKET_REGION: &str = "x-amz-bucket-region";

const CONTENT_MD5: &str = "content-md5";

/// Bucket name → region, learned from region-mismatch errors.
///
/// Clones share the same map. Entries are never evicted.
#[derive(Debug, Clone, Default)]
pub struct RegionCache {
    inner: Arc<RwLock<HashMap<String, String>>>,
}

impl RegionCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, bucket: &str) -> Option<String> {
        match self.inner.read() {
            Ok(map) => map.get(bucket).cloned(),
            Err(poisoned) => poisoned.into_inner().get(bucket).cloned(),
        }
    }

    /// Last write wins.
    pub fn insert(&self, bucket: impl Into<String>, region: impl Into<String>) {
        let (bucket, region) = (bucket.into(), region.into());
        match self.inner.write() {
            Ok(mut map) => map.insert(bucket, region),
            Err(poisoned) => poisoned.into_inner().insert(bucket, region),
        };
    }

    pub fn len(&self) -> usize {
        match self.inner.read() {
            Ok(map) => map.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// How the response body is handed back
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ResponseMode {
    #[default]
    Buffered,
    /// The caller drains the body; dropping it releases the connection.
    Streamed,
    /// XML (or JSON, by content type) decoded into a [`Document`].
    Structured,
}

/// One request to the storage service. Immutable once built.
#[derive(Debug, Clone)]
pub struct RequestDescriptor {
    pub method: Method,
    pub bucket: String,
    pub path: String,
    pub headers: HeaderMap,
    pub query: Query,
    pub body: Bytes,
    pub version_id: Option<String>,
    /// Send to this region instead of the cached one. No region correction.
    pub region: Option<String>,
    pub mode: ResponseMode,
}

impl RequestDescriptor {
    pub fn new(method: Method, bucket: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            method,
            bucket: bucket.into(),
            path: path.into(),
            headers: HeaderMap::new(),
            query: Query::new(),
            body: Bytes::new(),
            version_id: None,
            region: None,
            mode: ResponseMode::Buffered,
        }
    }

    pub fn query(mut self, name: &str, value: impl Into<String>) -> Self {
        self.query.insert(name.to_string(), value.into());
        self
    }

    /// Add a sub-resource flag such as `?tagging` or `?uploads`.
    pub fn subresource(self, name: &str) -> Self {
        self.query(name, "")
    }

    pub fn header(mut self, name: HeaderName, value: &str) -> Result<Self> {
        self.headers.insert(name, HeaderValue::from_str(value)?);
        Ok(self)
    }

    pub fn body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    pub fn version(mut self, version_id: Option<&str>) -> Self {
        self.version_id = version_id.map(str::to_string);
        self
    }

    pub fn in_region(mut self, region: impl Into<String>) -> Self {
        self.region = Some(region.into());
        self
    }

    pub fn mode(mut self, mode: ResponseMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn resource(&self) -> String {
        resource_path(&self.path, &self.query, self.version_id.as_deref())
    }
}

pub enum ResponseBody {
    Bytes(Bytes),
    Stream(ByteStream),
    Document(Document),
}

impl std::fmt::Debug for ResponseBody {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResponseBody::Bytes(bytes) => f.debug_tuple("Bytes").field(&bytes.len()).finish(),
            ResponseBody::Stream(_) => f.write_str("Stream"),
            ResponseBody::Document(doc) => f.debug_tuple("Document").field(doc).finish(),
        }
    }
}

#[derive(Debug)]
pub struct Response {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: ResponseBody,
}

impl Response {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    pub async fn into_bytes(self) -> Result<Bytes> {
        match self.body {
            ResponseBody::Bytes(bytes) => Ok(bytes),
            ResponseBody::Stream(stream) => collect_body(stream).await,
            ResponseBody::Document(doc) => Ok(Bytes::from(doc.to_xml())),
        }
    }

    pub fn into_document(self) -> Result<Document> {
        match self.body {
            ResponseBody::Document(doc) => Ok(doc),
            ResponseBody::Bytes(bytes) => decode_document(&self.headers, &bytes),
            ResponseBody::Stream(_) => Err(Error::InvalidArgument(
                "streamed response cannot be decoded in place".to_string(),
            )),
        }
    }

    pub fn into_stream(self) -> ByteStream {
        match self.body {
            ResponseBody::Stream(stream) => stream,
            ResponseBody::Bytes(bytes) => Box::pin(futures::stream::once(async move { Ok(bytes) })),
            ResponseBody::Document(doc) => {
                let bytes = Bytes::from(doc.to_xml());
                Box::pin(futures::stream::once(async move { Ok(bytes) }))
            }
        }
    }
}

fn decode_document(headers: &HeaderMap, body: &[u8]) -> Result<Document> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(Document::default());
    }
    let is_json = headers
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map_or(false, |ct| ct.contains("json"));
    if is_json {
        Document::from_json(body)
    } else {
        Document::from_xml(body)
    }
}

/// Decode a non-2xx response into the provider's error.
pub fn service_error(status: StatusCode, body: &[u8]) -> ServiceError {
    let doc = Document::from_xml(body).ok();
    let error = doc.as_ref().and_then(|d| d.child("Error"));

    match error {
        Some(error) => {
            let metadata = error
                .children()
                .iter()
                .filter_map(|(name, value)| value.as_scalar().map(|v| (name.clone(), v.to_string())))
                .collect();
            ServiceError {
                status: status.as_u16(),
                code: error
                    .child_text("Code")
                    .map(str::to_string)
                    .unwrap_or_else(|| status.as_u16().to_string()),
                message: error.child_text("Message").map(str::to_string),
                request_id: error.child_text("RequestId").map(str::to_string),
                metadata,
            }
        }
        None => ServiceError::from_status(status.as_u16()),
    }
}

/// An `<Error>` document inside a 2xx body, as sent by copy and
/// multipart completion when they fail after the status line went out.
pub fn embedded_error(status: StatusCode, body: &[u8]) -> Option<ServiceError> {
    let doc = Document::from_xml(body).ok()?;
    doc.child("Error")?;
    Some(service_error(status, body))
}

/// Signs and sends requests for one endpoint configuration
#[derive(Clone)]
pub struct Dispatcher {
    config: Arc<EndpointConfig>,
    transport: Arc<dyn Transport>,
    regions: RegionCache,
}

impl Dispatcher {
    pub fn new(config: EndpointConfig, transport: Arc<dyn Transport>) -> Self {
        Self {
            config: Arc::new(config),
            transport,
            regions: RegionCache::new(),
        }
    }

    pub fn config(&self) -> &EndpointConfig {
        &self.config
    }

    pub fn regions(&self) -> &RegionCache {
        &self.regions
    }

    /// Region a request for `bucket` goes to.
    pub fn region_for(&self, bucket: &str) -> String {
        self.regions
            .get(bucket)
            .unwrap_or_else(|| self.config.region.clone())
    }

    pub fn url_for(&self, request: &RequestDescriptor, region: &str) -> Result<Url> {
        if has_dot_segment(&request.path) {
            return Err(Error::InvalidArgument(format!(
                "key '{}' has a '.' or '..' segment and cannot be addressed",
                request.path
            )));
        }
        let base = self.config.endpoint.base_url(&request.bucket, region);
        Ok(Url::parse(&format!("{}{}", base, request.resource()))?)
    }

    /// Send `request` once. No retries of any kind.
    pub async fn dispatch(&self, request: &RequestDescriptor) -> Result<Response> {
        let region = match &request.region {
            Some(region) => region.clone(),
            None => self.region_for(&request.bucket),
        };
        let url = self.url_for(request, &region)?;

        let mut headers = request.headers.clone();
        if !request.body.is_empty() && !headers.contains_key(CONTENT_MD5) {
            let digest = BASE64.encode(Md5::digest(&request.body));
            headers.insert(CONTENT_MD5, HeaderValue::from_str(&digest)?);
        }
        signing::sign(
            &request.method,
            &url,
            &mut headers,
            &signing::hash_payload(&request.body),
            &self.config.credentials,
            &region,
            Utc::now(),
        )?;

        let response = self
            .transport
            .send(HttpRequest {
                method: request.method.clone(),
                url,
                headers,
                body: request.body.clone(),
            })
            .await?;

        debug!(
            method = %request.method,
            bucket = %request.bucket,
            path = %request.path,
            region = %region,
            status = response.status.as_u16(),
            "dispatched request"
        );

        if !response.status.is_success() {
            let body = collect_body(response.body).await?;
            let mut error = service_error(response.status, &body);
            if error.region().is_none() {
                if let Some(hint) = response.headers.get(X_AMZ_BUCKET_REGION).and_then(|v| v.to_str().ok()) {
                    error.metadata.insert("Region".to_string(), hint.to_string());
                }
            }
            return Err(error.into());
        }

        let body = match request.mode {
            ResponseMode::Streamed => ResponseBody::Stream(response.body),
            ResponseMode::Buffered => ResponseBody::Bytes(collect_body(response.body).await?),
            ResponseMode::Structured => {
                let bytes = collect_body(response.body).await?;
                ResponseBody::Document(decode_document(&response.headers, &bytes)?)
            }
        };

        Ok(Response {
            status: response.status,
            headers: response.headers,
            body,
        })
    }

    /// Policy that corrects the cached region for `bucket` and retries at once.
    ///
    /// Retries on `AuthorizationHeaderMalformed` with a region hint, and on a
    /// body-less 301 or 400 (HEAD) whose `x-amz-bucket-region` names a region
    /// other than the one the request went to.
    pub fn region_redirect_policy(&self, bucket: &str) -> RetryPolicy {
        let regions = self.regions.clone();
        let bucket = bucket.to_string();
        let current = {
            let regions = self.regions.clone();
            let bucket = bucket.clone();
            let default_region = self.config.region.clone();
            move || regions.get(&bucket).unwrap_or_else(|| default_region.clone())
        };
        RetryPolicy::new(
            "region-redirect",
            REGION_REDIRECT_ATTEMPTS,
            Delay::None,
            move |err| {
                let Some(e) = err.service() else {
                    return false;
                };
                match e.region() {
                    None => false,
                    Some(_) if e.is(AUTHORIZATION_HEADER_MALFORMED) => true,
                    Some(hint) => {
                        !e.metadata.contains_key("Code")
                            && matches!(e.status, 301 | 400)
                            && hint != current()
                    }
                }
            },
        )
        .with_hook(move |err| {
            if let Some(region) = err.service().and_then(ServiceError::region) {
                info!(bucket = %bucket, region = %region, "correcting bucket region");
                regions.insert(bucket.clone(), region);
            }
        })
    }

    /// Send `request`, following region corrections unless it names its
    /// own region.
    pub async fn send(&self, request: &RequestDescriptor) -> Result<Response> {
        if request.region.is_some() {
            return self.dispatch(request).await;
        }
        self.region_redirect_policy(&request.bucket)
            .run(|_| self.dispatch(request))
            .await
    }
}
