//! Multipart upload protocol: begin, sequential parts, complete or abort.

use crate::config::DEFAULT_PART_SIZE;
use crate::dispatch::{embedded_error, Dispatcher, RequestDescriptor, ResponseMode};
use crate::document::Document;
use crate::error::{Error, Result};
use crate::types::PutResponse;
use bytes::{Bytes, BytesMut};
use reqwest::header::ETAG;
use reqwest::Method;
use std::path::Path;
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::{debug, info, warn};

/// Smallest part size the service accepts for all but the last part (5 MiB).
pub const MIN_PART_SIZE: usize = 5 * 1024 * 1024;
/// Largest part size the service accepts (5 GiB).
pub const MAX_PART_SIZE: u64 = 5 * 1024 * 1024 * 1024;
/// Highest part number.
pub const MAX_PARTS: u32 = 10_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadState {
    NotStarted,
    InProgress,
    Completed,
    Aborted,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedPart {
    pub part_number: u32,
    pub etag: String,
}

/// Handle of one multipart upload.
///
/// Parts are numbered contiguously from 1 in the order they are uploaded.
#[derive(Debug, Clone)]
pub struct MultipartUpload {
    bucket: String,
    key: String,
    upload_id: Option<String>,
    parts: Vec<CompletedPart>,
    state: UploadState,
}

impl MultipartUpload {
    pub fn new(bucket: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            key: key.into(),
            upload_id: None,
            parts: Vec::new(),
            state: UploadState::NotStarted,
        }
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn upload_id(&self) -> Option<&str> {
        self.upload_id.as_deref()
    }

    pub fn parts(&self) -> &[CompletedPart] {
        &self.parts
    }

    pub fn state(&self) -> UploadState {
        self.state
    }

    /// Part number the next `upload_part` call must use.
    pub fn next_part_number(&self) -> u32 {
        self.parts.len() as u32 + 1
    }

    fn in_progress_id(&self) -> Result<String> {
        match (&self.state, &self.upload_id) {
            (UploadState::InProgress, Some(id)) => Ok(id.clone()),
            (state, _) => Err(Error::InvalidArgument(format!(
                "multipart upload of '{}' is {:?}, not in progress",
                self.key, state
            ))),
        }
    }

    /// `<CompleteMultipartUpload>` listing every part in part-number order.
    pub fn manifest(&self) -> Document {
        let parts = self.parts.iter().map(|part| {
            (
                "Part",
                Document::node(vec![
                    ("PartNumber", Document::scalar(part.part_number.to_string())),
                    ("ETag", Document::scalar(part.etag.as_str())),
                ]),
            )
        });
        Document::element("CompleteMultipartUpload", Document::node(parts))
    }
}

#[derive(Debug, Clone)]
pub struct MultipartConfig {
    pub part_size: usize,
    /// Abort the upload when a part or the completion fails. When false the
    /// upload is left unfinished on the service and keeps its parts.
    pub abort_on_failure: bool,
}

impl Default for MultipartConfig {
    fn default() -> Self {
        Self {
            part_size: DEFAULT_PART_SIZE,
            abort_on_failure: false,
        }
    }
}

impl MultipartConfig {
    pub fn new(part_size: usize) -> Self {
        Self {
            part_size,
            ..Default::default()
        }
    }

    pub fn with_abort_on_failure(mut self, abort: bool) -> Self {
        self.abort_on_failure = abort;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.part_size < MIN_PART_SIZE || self.part_size as u64 > MAX_PART_SIZE {
            return Err(Error::InvalidArgument(format!(
                "part size {} is outside {}..={} bytes",
                self.part_size, MIN_PART_SIZE, MAX_PART_SIZE
            )));
        }
        Ok(())
    }
}

/// Drives multipart uploads through a [`Dispatcher`]
#[derive(Clone)]
pub struct MultipartCoordinator {
    dispatcher: Dispatcher,
    config: MultipartConfig,
}

impl MultipartCoordinator {
    pub fn new(dispatcher: Dispatcher, config: MultipartConfig) -> Self {
        Self { dispatcher, config }
    }

    pub fn config(&self) -> &MultipartConfig {
        &self.config
    }

    /// Start an upload and return its handle in the `InProgress` state.
    pub async fn begin(&self, bucket: &str, key: &str) -> Result<MultipartUpload> {
        let mut upload = MultipartUpload::new(bucket, key);
        let request = RequestDescriptor::new(Method::POST, bucket, key)
            .subresource("uploads")
            .mode(ResponseMode::Structured);
        let doc = self.dispatcher.send(&request).await?.into_document()?;

        let upload_id = doc
            .root()
            .child_text("UploadId")
            .filter(|id| !id.is_empty())
            .ok_or_else(|| Error::InvalidResponse("InitiateMultipartUpload without UploadId".to_string()))?;

        info!(bucket, key, upload_id, "multipart upload started");
        upload.upload_id = Some(upload_id.to_string());
        upload.state = UploadState::InProgress;
        Ok(upload)
    }

    /// Upload part `part_number`, which must be the handle's next part number.
    pub async fn upload_part(&self, upload: &mut MultipartUpload, part_number: u32, body: Bytes) -> Result<String> {
        let upload_id = upload.in_progress_id()?;
        if part_number != upload.next_part_number() {
            return Err(Error::InvalidArgument(format!(
                "expected part number {}, got {}",
                upload.next_part_number(),
                part_number
            )));
        }
        if part_number > MAX_PARTS {
            return Err(Error::InvalidArgument(format!(
                "multipart upload cannot exceed {} parts",
                MAX_PARTS
            )));
        }

        let size = body.len();
        let request = RequestDescriptor::new(Method::PUT, upload.bucket.as_str(), upload.key.as_str())
            .query("partNumber", part_number.to_string())
            .query("uploadId", upload_id)
            .body(body);
        let response = self.dispatcher.send(&request).await?;

        let etag = response
            .header(ETAG.as_str())
            .ok_or_else(|| Error::InvalidResponse(format!("part {} response without ETag", part_number)))?
            .to_string();

        debug!(key = %upload.key, part_number, size, etag = %etag, "uploaded part");
        upload.parts.push(CompletedPart {
            part_number,
            etag: etag.clone(),
        });
        Ok(etag)
    }

    /// Send the manifest. A 200 response carrying an `<Error>` body fails.
    pub async fn complete(&self, upload: &mut MultipartUpload) -> Result<PutResponse> {
        let upload_id = upload.in_progress_id()?;
        let request = RequestDescriptor::new(Method::POST, upload.bucket.as_str(), upload.key.as_str())
            .query("uploadId", upload_id)
            .body(upload.manifest().to_xml());
        let response = self.dispatcher.send(&request).await?;

        let status = response.status;
        let mut result = PutResponse::from_headers(&response.headers);
        let body = response.into_bytes().await?;
        if let Some(err) = embedded_error(status, &body) {
            return Err(err.into());
        }
        if let Ok(doc) = Document::from_xml(&body) {
            if let Some(etag) = doc.root().child_text("ETag") {
                result.etag = Some(etag.to_string());
            }
        }

        info!(key = %upload.key, parts = upload.parts.len(), "multipart upload completed");
        upload.state = UploadState::Completed;
        Ok(result)
    }

    /// Abort the upload and discard its parts.
    pub async fn abort(&self, upload: &mut MultipartUpload) -> Result<()> {
        let upload_id = upload.in_progress_id()?;
        let request = RequestDescriptor::new(Method::DELETE, upload.bucket.as_str(), upload.key.as_str())
            .query("uploadId", upload_id);
        self.dispatcher.send(&request).await?;

        info!(key = %upload.key, "multipart upload aborted");
        upload.state = UploadState::Aborted;
        Ok(())
    }

    /// Upload everything `reader` yields, one part per `part_size` chunk.
    ///
    /// An empty reader produces a single empty part.
    pub async fn upload_stream<R>(&self, bucket: &str, key: &str, mut reader: R) -> Result<PutResponse>
    where
        R: AsyncRead + Unpin + Send,
    {
        self.config.validate()?;
        let mut upload = self.begin(bucket, key).await?;

        let result = self.upload_parts(&mut upload, &mut reader).await;
        let result = match result {
            Ok(()) => self.complete(&mut upload).await,
            Err(err) => Err(err),
        };

        match result {
            Err(err) if self.config.abort_on_failure && upload.state == UploadState::InProgress => {
                if let Err(abort_err) = self.abort(&mut upload).await {
                    warn!(key, error = %abort_err, "failed to abort multipart upload");
                }
                Err(err)
            }
            other => other,
        }
    }

    async fn upload_parts<R>(&self, upload: &mut MultipartUpload, reader: &mut R) -> Result<()>
    where
        R: AsyncRead + Unpin + Send,
    {
        loop {
            let chunk = read_chunk(reader, self.config.part_size).await?;
            if chunk.is_empty() && !upload.parts.is_empty() {
                return Ok(());
            }
            let last = chunk.len() < self.config.part_size;
            let part_number = upload.next_part_number();
            self.upload_part(upload, part_number, chunk).await?;
            if last {
                return Ok(());
            }
        }
    }

    pub async fn upload_file(&self, bucket: &str, key: &str, path: impl AsRef<Path>) -> Result<PutResponse> {
        let file = tokio::fs::File::open(path.as_ref()).await?;
        self.upload_stream(bucket, key, file).await
    }
}

/// Read up to `size` bytes; shorter only at end of input.
async fn read_chunk<R>(reader: &mut R, size: usize) -> Result<Bytes>
where
    R: AsyncRead + Unpin,
{
    let mut buf = BytesMut::with_capacity(size);
    while buf.len() < size {
        let read = (&mut *reader)
            .take((size - buf.len()) as u64)
            .read_buf(&mut buf)
            .await?;
        if read == 0 {
            break;
        }
    }
    Ok(buf.freeze())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Credentials, EndpointConfig};
    use crate::transport::{HttpRequest, HttpResponse, Transport};
    use async_trait::async_trait;
    use futures::StreamExt;
    use reqwest::header::{HeaderMap, HeaderValue};
    use reqwest::StatusCode;
    use std::sync::{Arc, Mutex};

    const MIB: usize = 1024 * 1024;

    #[derive(Debug, Clone)]
    struct Seen {
        method: Method,
        query: String,
        body_len: usize,
        body: Option<String>,
    }

    /// Answers like the service would for a healthy multipart upload.
    #[derive(Default)]
    struct RecordingTransport {
        seen: Mutex<Vec<Seen>>,
        fail_part: Option<u32>,
        complete_body: Option<&'static str>,
    }

    impl RecordingTransport {
        fn seen(&self) -> Vec<Seen> {
            self.seen.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Transport for RecordingTransport {
        async fn send(&self, request: HttpRequest) -> Result<HttpResponse> {
            let query = request.url.query().unwrap_or_default().to_string();
            let text = (request.body.len() < 4096).then(|| String::from_utf8_lossy(&request.body).into_owned());
            self.seen.lock().unwrap().push(Seen {
                method: request.method.clone(),
                query: query.clone(),
                body_len: request.body.len(),
                body: text,
            });

            let mut headers = HeaderMap::new();
            let (status, body) = if query == "uploads=" {
                (200, "<InitiateMultipartUploadResult><UploadId>UP1</UploadId></InitiateMultipartUploadResult>")
            } else if let Some(part) = query
                .strip_prefix("partNumber=")
                .and_then(|rest| rest.split('&').next())
                .and_then(|n| n.parse::<u32>().ok())
            {
                if self.fail_part == Some(part) {
                    (500, "<Error><Code>InternalError</Code></Error>")
                } else {
                    headers.insert(ETAG, HeaderValue::from_str(&format!("\"etag-{}\"", part)).unwrap());
                    (200, "")
                }
            } else if request.method == Method::POST {
                (
                    200,
                    self.complete_body
                        .unwrap_or("<CompleteMultipartUploadResult><ETag>\"final\"</ETag></CompleteMultipartUploadResult>"),
                )
            } else {
                (204, "")
            };

            Ok(HttpResponse {
                status: StatusCode::from_u16(status).unwrap(),
                headers,
                body: futures::stream::once(async move { Ok(Bytes::from_static(body.as_bytes())) }).boxed(),
            })
        }
    }

    fn new_coordinator(transport: Arc<RecordingTransport>, config: MultipartConfig) -> MultipartCoordinator {
        let endpoint = EndpointConfig::new("us-east-1", Credentials::new("AK", "SK"));
        MultipartCoordinator::new(Dispatcher::new(endpoint, transport), config)
    }

    #[tokio::test]
    async fn test_stream_split_into_ordered_parts() {
        let transport = Arc::new(RecordingTransport::default());
        let coordinator = new_coordinator(transport.clone(), MultipartConfig::new(50 * MIB));
        let data = vec![7u8; 120 * MIB];

        let result = coordinator
            .upload_stream("bucket", "big.bin", data.as_slice())
            .await
            .unwrap();
        assert_eq!(result.etag.as_deref(), Some("\"final\""));

        let seen = transport.seen();
        assert_eq!(seen.len(), 5);
        assert_eq!(seen[0].query, "uploads=");
        let sizes: Vec<_> = seen[1..4].iter().map(|s| s.body_len).collect();
        assert_eq!(sizes, vec![50 * MIB, 50 * MIB, 20 * MIB]);
        assert_eq!(seen[1].query, "partNumber=1&uploadId=UP1");
        assert_eq!(seen[3].query, "partNumber=3&uploadId=UP1");
        assert_eq!(
            seen[4].body.as_deref(),
            Some(
                "<CompleteMultipartUpload>\
                 <Part><PartNumber>1</PartNumber><ETag>&quot;etag-1&quot;</ETag></Part>\
                 <Part><PartNumber>2</PartNumber><ETag>&quot;etag-2&quot;</ETag></Part>\
                 <Part><PartNumber>3</PartNumber><ETag>&quot;etag-3&quot;</ETag></Part>\
                 </CompleteMultipartUpload>"
            )
        );
    }

    #[tokio::test]
    async fn test_exact_multiple_has_no_trailing_empty_part() {
        let transport = Arc::new(RecordingTransport::default());
        let coordinator = new_coordinator(transport.clone(), MultipartConfig::new(5 * MIB));
        let data = vec![1u8; 10 * MIB];
        coordinator.upload_stream("b", "k", data.as_slice()).await.unwrap();
        let parts = transport.seen().iter().filter(|s| s.query.starts_with("partNumber")).count();
        assert_eq!(parts, 2);
    }

    #[tokio::test]
    async fn test_empty_stream_uploads_one_empty_part() {
        let transport = Arc::new(RecordingTransport::default());
        let coordinator = new_coordinator(transport.clone(), MultipartConfig::default());
        coordinator.upload_stream("b", "k", tokio::io::empty()).await.unwrap();
        let seen = transport.seen();
        assert_eq!(seen.len(), 3);
        assert_eq!(seen[1].body_len, 0);
    }

    #[tokio::test]
    async fn test_upload_part_rejects_out_of_order_number() {
        let transport = Arc::new(RecordingTransport::default());
        let coordinator = new_coordinator(transport.clone(), MultipartConfig::default());
        let mut upload = coordinator.begin("b", "k").await.unwrap();
        assert_eq!(upload.state(), UploadState::InProgress);

        let err = coordinator
            .upload_part(&mut upload, 2, Bytes::from_static(b"x"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));

        coordinator.upload_part(&mut upload, 1, Bytes::from_static(b"x")).await.unwrap();
        assert!(coordinator.upload_part(&mut upload, 1, Bytes::from_static(b"y")).await.is_err());
        assert_eq!(upload.parts().len(), 1);
    }

    #[tokio::test]
    async fn test_complete_with_error_body_fails() {
        let transport = Arc::new(RecordingTransport {
            complete_body: Some("<Error><Code>InternalError</Code><Message>try again</Message></Error>"),
            ..Default::default()
        });
        let coordinator = new_coordinator(transport, MultipartConfig::default());
        let mut upload = coordinator.begin("b", "k").await.unwrap();
        coordinator.upload_part(&mut upload, 1, Bytes::from_static(b"x")).await.unwrap();

        let err = coordinator.complete(&mut upload).await.unwrap_err();
        assert_eq!(err.code(), Some("InternalError"));
        assert_eq!(err.service().unwrap().status, 200);
        assert_eq!(upload.state(), UploadState::InProgress);
    }

    #[tokio::test]
    async fn test_abort_moves_handle_to_aborted() {
        let transport = Arc::new(RecordingTransport::default());
        let coordinator = new_coordinator(transport.clone(), MultipartConfig::default());
        let mut upload = coordinator.begin("b", "k").await.unwrap();
        coordinator.abort(&mut upload).await.unwrap();
        assert_eq!(upload.state(), UploadState::Aborted);
        assert_eq!(transport.seen()[1].method, Method::DELETE);
        assert!(coordinator.complete(&mut upload).await.is_err());
    }

    #[tokio::test]
    async fn test_part_failure_leaves_upload_unless_configured() {
        let data = vec![0u8; 12 * MIB];

        let transport = Arc::new(RecordingTransport {
            fail_part: Some(2),
            ..Default::default()
        });
        let coordinator = new_coordinator(transport.clone(), MultipartConfig::new(5 * MIB));
        let err = coordinator.upload_stream("b", "k", data.as_slice()).await.unwrap_err();
        assert_eq!(err.code(), Some("InternalError"));
        assert!(transport.seen().iter().all(|s| s.method != Method::DELETE));

        let transport = Arc::new(RecordingTransport {
            fail_part: Some(2),
            ..Default::default()
        });
        let coordinator = new_coordinator(
            transport.clone(),
            MultipartConfig::new(5 * MIB).with_abort_on_failure(true),
        );
        assert!(coordinator.upload_stream("b", "k", data.as_slice()).await.is_err());
        assert_eq!(transport.seen().last().unwrap().method, Method::DELETE);
    }

    #[test]
    fn test_part_size_validation() {
        assert!(MultipartConfig::new(MIN_PART_SIZE).validate().is_ok());
        assert!(MultipartConfig::new(MIN_PART_SIZE - 1).validate().is_err());
        assert!(MultipartConfig::default().validate().is_ok());
    }

    #[tokio::test]
    async fn test_upload_file() {
        use std::io::Write;

        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(&vec![3u8; 6 * MIB]).unwrap();
        file.flush().unwrap();

        let transport = Arc::new(RecordingTransport::default());
        let coordinator = new_coordinator(transport.clone(), MultipartConfig::new(5 * MIB));
        coordinator.upload_file("b", "file.bin", file.path()).await.unwrap();

        let sizes: Vec<_> = transport
            .seen()
            .iter()
            .filter(|s| s.query.starts_with("partNumber"))
            .map(|s| s.body_len)
            .collect();
        assert_eq!(sizes, vec![5 * MIB, MIB]);
    }
}
