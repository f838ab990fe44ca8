use crate::config::{ClientOptions, EndpointConfig, DEFAULT_REGION};
use crate::dispatch::{embedded_error, Dispatcher, RegionCache, RequestDescriptor, Response, ResponseMode};
use crate::document::Document;
use crate::error::{Error, Result};
use crate::multipart::{MultipartConfig, MultipartCoordinator};
use crate::presign::{self, PresignOptions};
use crate::query::escape_path;
use crate::retry::{
    Delay, RetryPolicy, ABSENT_CODES, BUCKET_ALREADY_OWNED_BY_YOU, NO_SUCH_TAG_SET,
};
use crate::transport::{ReqwestTransport, Transport};
use crate::types::*;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use reqwest::header::{HeaderName, CONTENT_ENCODING, CONTENT_TYPE};
use reqwest::Method;
use std::path::Path;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::info;

const X_AMZ_COPY_SOURCE: HeaderName = HeaderName::from_static("x-amz-copy-source");

/// S3 client
///
/// Cheap to clone; clones share the transport and the bucket→region cache.
#[derive(Clone)]
pub struct S3Client {
    dispatcher: Dispatcher,
    options: ClientOptions,
}

impl S3Client {
    /// Create a new client with default options
    pub fn new(config: EndpointConfig) -> Result<Self> {
        Self::with_options(config, ClientOptions::default())
    }

    pub fn with_options(config: EndpointConfig, options: ClientOptions) -> Result<Self> {
        let transport = ReqwestTransport::new(options.timeout)?;
        Ok(Self::with_transport(config, options, Arc::new(transport)))
    }

    /// Create a client that sends through `transport`.
    pub fn with_transport(config: EndpointConfig, options: ClientOptions, transport: Arc<dyn Transport>) -> Self {
        Self {
            dispatcher: Dispatcher::new(config, transport),
            options,
        }
    }

    /// Create a client from the standard AWS environment variables
    pub fn from_env() -> Result<Self> {
        Self::new(EndpointConfig::from_env()?)
    }

    pub fn config(&self) -> &EndpointConfig {
        self.dispatcher.config()
    }

    pub fn options(&self) -> &ClientOptions {
        &self.options
    }

    pub fn regions(&self) -> &RegionCache {
        self.dispatcher.regions()
    }

    fn transient_delay(&self) -> Delay {
        Delay::Exponential {
            initial: self.options.retry_delay,
            max: self.options.max_retry_delay,
        }
    }

    async fn send_with(&self, policy: RetryPolicy, request: &RequestDescriptor) -> Result<Response> {
        let dispatcher = &self.dispatcher;
        policy.run(move |_| dispatcher.send(request)).await
    }

    async fn exists(&self, request: &RequestDescriptor) -> Result<bool> {
        match self
            .send_with(RetryPolicy::existence(self.transient_delay()), request)
            .await
        {
            Ok(_) => Ok(true),
            Err(err) if err.has_code(ABSENT_CODES) => Ok(false),
            Err(err) => Err(err),
        }
    }

    // ----- Objects -----

    /// Put an object into storage
    pub async fn put_object(
        &self,
        bucket: &str,
        key: &str,
        body: impl Into<Bytes>,
        content_type: Option<&str>,
    ) -> Result<PutResponse> {
        let metadata = Metadata {
            content_type: content_type
                .map(String::from)
                .unwrap_or_else(|| mime::APPLICATION_OCTET_STREAM.to_string()),
            ..Default::default()
        };
        self.put_object_with_metadata(bucket, key, body, &metadata).await
    }

    /// Put an object with content type, encoding and user metadata.
    ///
    /// Only `content_type`, `content_encoding` and `custom` are sent.
    pub async fn put_object_with_metadata(
        &self,
        bucket: &str,
        key: &str,
        body: impl Into<Bytes>,
        metadata: &Metadata,
    ) -> Result<PutResponse> {
        let mut request = RequestDescriptor::new(Method::PUT, bucket, key)
            .header(CONTENT_TYPE, &metadata.content_type)?
            .body(body);
        if let Some(encoding) = &metadata.content_encoding {
            request = request.header(CONTENT_ENCODING, encoding)?;
        }
        for (name, value) in &metadata.custom {
            let header = HeaderName::from_bytes(format!("{}{}", USER_METADATA_PREFIX, name).as_bytes())
                .map_err(|e| Error::InvalidArgument(format!("metadata key '{}': {}", name, e)))?;
            request = request.header(header, value)?;
        }

        let response = self.dispatcher.send(&request).await?;
        Ok(PutResponse::from_headers(&response.headers))
    }

    /// Get an object from storage
    pub async fn get_object(&self, bucket: &str, key: &str, version: Option<&str>) -> Result<(Bytes, Metadata)> {
        let request = RequestDescriptor::new(Method::GET, bucket, key).version(version);
        let response = self
            .send_with(RetryPolicy::object_get(self.transient_delay()), &request)
            .await?;

        let mut metadata = Metadata::from_headers(&response.headers);
        let data = response.into_bytes().await?;
        metadata.size = data.len() as u64;
        Ok((data, metadata))
    }

    /// Get an object as a stream. Dropping the stream releases the connection.
    pub async fn get_object_stream(&self, bucket: &str, key: &str, version: Option<&str>) -> Result<ObjectStream> {
        let request = RequestDescriptor::new(Method::GET, bucket, key)
            .version(version)
            .mode(ResponseMode::Streamed);
        let response = self
            .send_with(RetryPolicy::object_get(self.transient_delay()), &request)
            .await?;

        Ok(ObjectStream {
            metadata: Metadata::from_headers(&response.headers),
            body: response.into_stream(),
        })
    }

    /// Stream an object into `writer` and return the number of bytes written.
    pub async fn download_to_writer<W>(
        &self,
        bucket: &str,
        key: &str,
        version: Option<&str>,
        writer: &mut W,
    ) -> Result<u64>
    where
        W: AsyncWrite + Unpin + Send,
    {
        let stream = self.get_object_stream(bucket, key, version).await?;
        let mut reader = stream.into_async_read();
        Ok(tokio::io::copy(&mut reader, writer).await?)
    }

    /// Get metadata for an object
    pub async fn head_object(&self, bucket: &str, key: &str, version: Option<&str>) -> Result<Metadata> {
        let request = RequestDescriptor::new(Method::HEAD, bucket, key).version(version);
        let response = self.dispatcher.send(&request).await?;
        Ok(Metadata::from_headers(&response.headers))
    }

    /// Check if an object exists
    pub async fn object_exists(&self, bucket: &str, key: &str, version: Option<&str>) -> Result<bool> {
        let request = RequestDescriptor::new(Method::HEAD, bucket, key).version(version);
        self.exists(&request).await
    }

    /// Delete an object from storage
    pub async fn delete_object(&self, bucket: &str, key: &str, version: Option<&str>) -> Result<()> {
        let request = RequestDescriptor::new(Method::DELETE, bucket, key).version(version);
        self.dispatcher.send(&request).await?;
        Ok(())
    }

    /// Server-side copy. A 200 response carrying an `<Error>` body fails.
    pub async fn copy_object(
        &self,
        src_bucket: &str,
        src_key: &str,
        src_version: Option<&str>,
        dst_bucket: &str,
        dst_key: &str,
    ) -> Result<PutResponse> {
        let mut source = format!("/{}/{}", src_bucket, escape_path(src_key));
        if let Some(version) = src_version {
            source.push_str("?versionId=");
            source.push_str(&urlencoding::encode(version));
        }
        let request = RequestDescriptor::new(Method::PUT, dst_bucket, dst_key).header(X_AMZ_COPY_SOURCE, &source)?;
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
        Ok(result)
    }

    // ----- Buckets -----

    /// Create a bucket in the client's default region
    pub async fn create_bucket(&self, bucket: &str) -> Result<()> {
        let region = self.config().region.clone();
        self.create_bucket_in(bucket, &region).await
    }

    /// Create a bucket in `region`. Creating a bucket you already own succeeds.
    ///
    /// The region is cached for the bucket only once the service accepts it.
    pub async fn create_bucket_in(&self, bucket: &str, region: &str) -> Result<()> {
        let mut request = RequestDescriptor::new(Method::PUT, bucket, "").in_region(region);
        if region != DEFAULT_REGION {
            let body = Document::element(
                "CreateBucketConfiguration",
                Document::element("LocationConstraint", Document::scalar(region)),
            );
            request = request.body(body.to_xml());
        }

        match self.dispatcher.send(&request).await {
            Ok(_) => {
                info!(bucket, region, "bucket created");
                self.regions().insert(bucket, region);
                Ok(())
            }
            Err(err) if err.has_code(&[BUCKET_ALREADY_OWNED_BY_YOU]) => {
                self.regions().insert(bucket, region);
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    pub async fn delete_bucket(&self, bucket: &str) -> Result<()> {
        let request = RequestDescriptor::new(Method::DELETE, bucket, "");
        self.dispatcher.send(&request).await?;
        Ok(())
    }

    pub async fn bucket_exists(&self, bucket: &str) -> Result<bool> {
        let request = RequestDescriptor::new(Method::HEAD, bucket, "");
        self.exists(&request).await
    }

    /// Region the bucket lives in. The answer is also cached for later requests.
    pub async fn bucket_region(&self, bucket: &str) -> Result<String> {
        let request = RequestDescriptor::new(Method::GET, bucket, "")
            .subresource("location")
            .mode(ResponseMode::Structured);
        let doc = self.dispatcher.send(&request).await?.into_document()?;

        let region = match doc.root().as_scalar().unwrap_or_default() {
            "" => DEFAULT_REGION.to_string(),
            "EU" => "eu-west-1".to_string(),
            other => other.to_string(),
        };
        self.regions().insert(bucket, region.as_str());
        Ok(region)
    }

    pub async fn list_buckets(&self) -> Result<Vec<BucketInfo>> {
        let request = RequestDescriptor::new(Method::GET, "", "").mode(ResponseMode::Structured);
        let doc = self.dispatcher.send(&request).await?.into_document()?;

        let buckets = doc
            .root()
            .child("Buckets")
            .map(|b| {
                b.children_named("Bucket")
                    .filter_map(|bucket| {
                        Some(BucketInfo {
                            name: bucket.child_text("Name")?.to_string(),
                            creation_date: bucket
                                .child_text("CreationDate")
                                .and_then(|d| DateTime::parse_from_rfc3339(d).ok())
                                .map(|d| d.with_timezone(&Utc)),
                        })
                    })
                    .collect()
            })
            .unwrap_or_default();
        Ok(buckets)
    }

    /// List one page of objects
    pub async fn list_objects(&self, bucket: &str, list_req: &ListRequest) -> Result<ListResponse> {
        let mut request = RequestDescriptor::new(Method::GET, bucket, "").mode(ResponseMode::Structured);
        if let Some(prefix) = &list_req.prefix {
            request = request.query("prefix", prefix.as_str());
        }
        if let Some(delimiter) = &list_req.delimiter {
            request = request.query("delimiter", delimiter.as_str());
        }
        if let Some(max_keys) = list_req.max_keys {
            request = request.query("max-keys", max_keys.to_string());
        }
        if let Some(marker) = &list_req.marker {
            request = request.query("marker", marker.as_str());
        }

        let response = self
            .send_with(RetryPolicy::listing_page(self.transient_delay()), &request)
            .await?;
        ListResponse::from_document(&response.into_document()?)
    }

    /// List every object under `prefix`, following markers page by page.
    pub async fn list_all_objects(&self, bucket: &str, prefix: Option<&str>) -> Result<Vec<ObjectInfo>> {
        let mut list_req = ListRequest {
            prefix: prefix.map(String::from),
            ..Default::default()
        };
        let mut objects = Vec::new();

        loop {
            let page = self.list_objects(bucket, &list_req).await?;
            objects.extend(page.objects);
            if !page.truncated {
                return Ok(objects);
            }
            match page.next_marker {
                Some(marker) if list_req.marker.as_deref() != Some(marker.as_str()) => {
                    list_req.marker = Some(marker);
                }
                _ => {
                    return Err(Error::InvalidResponse(format!(
                        "truncated listing of '{}' did not advance its marker",
                        bucket
                    )))
                }
            }
        }
    }

    // ----- Tagging and versioning -----

    async fn get_tags(&self, request: RequestDescriptor) -> Result<Tags> {
        let request = request.subresource("tagging").mode(ResponseMode::Structured);
        match self.dispatcher.send(&request).await {
            Ok(response) => Ok(tags_from_document(&response.into_document()?)),
            Err(err) if err.has_code(&[NO_SUCH_TAG_SET]) => Ok(Tags::new()),
            Err(err) => Err(err),
        }
    }

    /// Tags of an object; an object without tags yields an empty set.
    pub async fn get_object_tagging(&self, bucket: &str, key: &str, version: Option<&str>) -> Result<Tags> {
        self.get_tags(RequestDescriptor::new(Method::GET, bucket, key).version(version))
            .await
    }

    pub async fn put_object_tagging(&self, bucket: &str, key: &str, version: Option<&str>, tags: &Tags) -> Result<()> {
        let request = RequestDescriptor::new(Method::PUT, bucket, key)
            .version(version)
            .subresource("tagging")
            .body(tags_to_document(tags).to_xml());
        self.dispatcher.send(&request).await?;
        Ok(())
    }

    pub async fn delete_object_tagging(&self, bucket: &str, key: &str, version: Option<&str>) -> Result<()> {
        let request = RequestDescriptor::new(Method::DELETE, bucket, key)
            .version(version)
            .subresource("tagging");
        self.dispatcher.send(&request).await?;
        Ok(())
    }

    pub async fn get_bucket_tagging(&self, bucket: &str) -> Result<Tags> {
        self.get_tags(RequestDescriptor::new(Method::GET, bucket, "")).await
    }

    pub async fn put_bucket_tagging(&self, bucket: &str, tags: &Tags) -> Result<()> {
        let request = RequestDescriptor::new(Method::PUT, bucket, "")
            .subresource("tagging")
            .body(tags_to_document(tags).to_xml());
        self.dispatcher.send(&request).await?;
        Ok(())
    }

    /// `None` when versioning was never configured on the bucket.
    pub async fn get_bucket_versioning(&self, bucket: &str) -> Result<Option<VersioningStatus>> {
        let request = RequestDescriptor::new(Method::GET, bucket, "")
            .subresource("versioning")
            .mode(ResponseMode::Structured);
        let doc = self.dispatcher.send(&request).await?.into_document()?;
        Ok(doc.root().child_text("Status").and_then(VersioningStatus::parse))
    }

    pub async fn set_bucket_versioning(&self, bucket: &str, enabled: bool) -> Result<()> {
        let status = if enabled {
            VersioningStatus::Enabled
        } else {
            VersioningStatus::Suspended
        };
        let body = Document::element(
            "VersioningConfiguration",
            Document::element("Status", Document::scalar(status.as_str())),
        );
        let request = RequestDescriptor::new(Method::PUT, bucket, "")
            .subresource("versioning")
            .body(body.to_xml());
        self.dispatcher.send(&request).await?;
        Ok(())
    }

    /// Every version and delete marker under `prefix`.
    pub async fn list_object_versions(&self, bucket: &str, prefix: Option<&str>) -> Result<Vec<ObjectVersion>> {
        let mut versions = Vec::new();
        let mut markers: Option<(String, Option<String>)> = None;

        loop {
            let mut request = RequestDescriptor::new(Method::GET, bucket, "")
                .subresource("versions")
                .mode(ResponseMode::Structured);
            if let Some(prefix) = prefix {
                request = request.query("prefix", prefix);
            }
            if let Some((key_marker, version_marker)) = &markers {
                request = request.query("key-marker", key_marker.as_str());
                if let Some(version_marker) = version_marker {
                    request = request.query("version-id-marker", version_marker.as_str());
                }
            }

            let response = self
                .send_with(RetryPolicy::listing_page(self.transient_delay()), &request)
                .await?;
            let page = VersionPage::from_document(&response.into_document()?)?;
            versions.extend(page.versions);
            if !page.truncated {
                return Ok(versions);
            }

            let next = page
                .next_key_marker
                .map(|key| (key, page.next_version_id_marker));
            if next.is_none() || next == markers {
                return Err(Error::InvalidResponse(format!(
                    "truncated version listing of '{}' did not advance its markers",
                    bucket
                )));
            }
            markers = next;
        }
    }

    /// Delete every object version and delete marker, then the bucket.
    pub async fn purge_bucket(&self, bucket: &str) -> Result<()> {
        let versions = self.list_object_versions(bucket, None).await?;
        for version in &versions {
            self.delete_object(bucket, &version.key, Some(&version.version_id))
                .await?;
        }
        info!(bucket, deleted = versions.len(), "purged bucket");
        self.delete_bucket(bucket).await
    }

    // ----- Multipart -----

    /// Multipart coordinator using the client's part size.
    pub fn multipart(&self) -> MultipartCoordinator {
        self.multipart_with(MultipartConfig::new(self.options.part_size))
    }

    pub fn multipart_with(&self, config: MultipartConfig) -> MultipartCoordinator {
        MultipartCoordinator::new(self.dispatcher.clone(), config)
    }

    /// Upload everything `reader` yields as a multipart upload.
    pub async fn upload_stream<R>(&self, bucket: &str, key: &str, reader: R) -> Result<PutResponse>
    where
        R: AsyncRead + Unpin + Send,
    {
        self.multipart().upload_stream(bucket, key, reader).await
    }

    pub async fn upload_file(&self, bucket: &str, key: &str, path: impl AsRef<Path>) -> Result<PutResponse> {
        self.multipart().upload_file(bucket, key, path).await
    }

    // ----- Presigned URLs -----

    /// Presigned URL valid from now
    pub fn presign_url(&self, bucket: &str, key: &str, options: &PresignOptions) -> Result<String> {
        self.presign_url_at(bucket, key, options, Utc::now())
    }

    pub fn presign_url_at(
        &self,
        bucket: &str,
        key: &str,
        options: &PresignOptions,
        now: DateTime<Utc>,
    ) -> Result<String> {
        let config = self.config();
        let base_url = config
            .endpoint
            .base_url(bucket, &self.dispatcher.region_for(bucket));
        presign::presign_url(&base_url, &config.credentials, bucket, key, options, now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Credentials;

    fn client() -> S3Client {
        let config = EndpointConfig::new("us-east-1", Credentials::new("AK", "SK"));
        S3Client::new(config).unwrap()
    }

    #[test]
    fn test_client_creation() {
        let client = client();
        assert_eq!(client.config().region, "us-east-1");
        assert!(client.regions().is_empty());
    }

    #[test]
    fn test_clones_share_region_cache() {
        let client = client();
        let clone = client.clone();
        clone.regions().insert("b", "ap-south-1");
        assert_eq!(client.regions().get("b").as_deref(), Some("ap-south-1"));
    }

    #[test]
    fn test_presign_uses_cached_region() {
        let client = client();
        client.regions().insert("b", "eu-west-1");
        let url = client
            .presign_url("b", "k.txt", &PresignOptions::default())
            .unwrap();
        assert!(url.starts_with("https://b.s3.eu-west-1.amazonaws.com/k.txt?"));
    }

    #[test]
    fn test_multipart_uses_client_part_size() {
        let config = EndpointConfig::new("us-east-1", Credentials::new("AK", "SK"));
        let options = ClientOptions {
            part_size: 8 * 1024 * 1024,
            ..Default::default()
        };
        let client = S3Client::with_options(config, options).unwrap();
        assert_eq!(client.multipart().config().part_size, 8 * 1024 * 1024);
        assert!(!client.multipart().config().abort_on_failure);
    }
}
