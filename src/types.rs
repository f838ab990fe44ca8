use crate::document::Document;
use crate::error::{Error, Result};
use crate::transport::ByteStream;
use chrono::{DateTime, Utc};
use futures::TryStreamExt;
use reqwest::header::{HeaderMap, CONTENT_ENCODING, CONTENT_LENGTH, CONTENT_TYPE, ETAG, LAST_MODIFIED};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use tokio::io::AsyncRead;
use tokio_util::io::StreamReader;

/// Prefix of user-defined metadata headers
pub const USER_METADATA_PREFIX: &str = "x-amz-meta-";

pub const X_AMZ_VERSION_ID: &str = "x-amz-version-id";

/// Object tags, ordered by key.
pub type Tags = BTreeMap<String, String>;

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

fn parse_timestamp(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .or_else(|_| DateTime::parse_from_rfc2822(value))
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

/// Metadata for an object in storage
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Metadata {
    pub content_type: String,
    pub content_encoding: Option<String>,
    pub size: u64,
    pub last_modified: Option<DateTime<Utc>>,
    pub etag: Option<String>,
    pub version_id: Option<String>,
    /// User metadata from `x-amz-meta-*` headers, keyed without the prefix.
    pub custom: HashMap<String, String>,
}

impl Default for Metadata {
    fn default() -> Self {
        Self {
            content_type: mime::APPLICATION_OCTET_STREAM.to_string(),
            content_encoding: None,
            size: 0,
            last_modified: None,
            etag: None,
            version_id: None,
            custom: HashMap::new(),
        }
    }
}

impl Metadata {
    /// Read object metadata from GET or HEAD response headers.
    pub fn from_headers(headers: &HeaderMap) -> Self {
        let custom = headers
            .iter()
            .filter_map(|(name, value)| {
                let key = name.as_str().strip_prefix(USER_METADATA_PREFIX)?;
                Some((key.to_string(), value.to_str().ok()?.to_string()))
            })
            .collect();

        Self {
            content_type: header_str(headers, CONTENT_TYPE.as_str())
                .map(String::from)
                .unwrap_or_else(|| mime::APPLICATION_OCTET_STREAM.to_string()),
            content_encoding: header_str(headers, CONTENT_ENCODING.as_str()).map(String::from),
            size: header_str(headers, CONTENT_LENGTH.as_str())
                .and_then(|s| s.parse().ok())
                .unwrap_or(0),
            last_modified: header_str(headers, LAST_MODIFIED.as_str()).and_then(parse_timestamp),
            etag: header_str(headers, ETAG.as_str()).map(String::from),
            version_id: header_str(headers, X_AMZ_VERSION_ID).map(String::from),
            custom,
        }
    }
}

/// Information about a stored object, as returned by a listing
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ObjectInfo {
    pub key: String,
    pub size: u64,
    pub last_modified: Option<DateTime<Utc>>,
    pub etag: Option<String>,
    pub storage_class: Option<String>,
}

impl ObjectInfo {
    pub fn from_document(doc: &Document) -> Result<Self> {
        let key = doc
            .child_text("Key")
            .ok_or_else(|| Error::InvalidResponse("listing entry without Key".to_string()))?;
        Ok(Self {
            key: key.to_string(),
            size: doc.child_text("Size").and_then(|s| s.parse().ok()).unwrap_or(0),
            last_modified: doc.child_text("LastModified").and_then(parse_timestamp),
            etag: doc.child_text("ETag").map(String::from),
            storage_class: doc.child_text("StorageClass").map(String::from),
        })
    }
}

/// Response from a Put operation
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct PutResponse {
    pub etag: Option<String>,
    pub version_id: Option<String>,
}

impl PutResponse {
    pub fn from_headers(headers: &HeaderMap) -> Self {
        Self {
            etag: header_str(headers, ETAG.as_str()).map(String::from),
            version_id: header_str(headers, X_AMZ_VERSION_ID).map(String::from),
        }
    }
}

/// Request for listing objects
#[derive(Debug, Clone, Default)]
pub struct ListRequest {
    pub prefix: Option<String>,
    pub delimiter: Option<String>,
    pub max_keys: Option<u32>,
    /// List keys after this one.
    pub marker: Option<String>,
}

impl ListRequest {
    pub fn with_prefix(prefix: impl Into<String>) -> Self {
        Self {
            prefix: Some(prefix.into()),
            ..Default::default()
        }
    }
}

/// One page of a listing
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ListResponse {
    pub objects: Vec<ObjectInfo>,
    pub common_prefixes: Vec<String>,
    /// Marker for the next page when the listing is truncated.
    pub next_marker: Option<String>,
    pub truncated: bool,
}

impl ListResponse {
    /// Decode a `ListBucketResult` (XML) or its JSON equivalent.
    pub fn from_document(doc: &Document) -> Result<Self> {
        let root = doc.child("ListBucketResult").unwrap_or(doc);
        let objects = root
            .children_named("Contents")
            .map(ObjectInfo::from_document)
            .collect::<Result<Vec<_>>>()?;
        let common_prefixes = root
            .children_named("CommonPrefixes")
            .filter_map(|p| p.child_text("Prefix"))
            .map(String::from)
            .collect();
        let truncated = root
            .child_text("IsTruncated")
            .map_or(false, |t| t.eq_ignore_ascii_case("true"));

        // Without a delimiter the service omits NextMarker; the last key is the marker.
        let next_marker = if truncated {
            root.child_text("NextMarker")
                .filter(|m| !m.is_empty())
                .map(String::from)
                .or_else(|| objects.last().map(|o| o.key.clone()))
        } else {
            None
        };

        Ok(Self {
            objects,
            common_prefixes,
            next_marker,
            truncated,
        })
    }
}

/// Bucket as reported by `ListAllMyBuckets`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BucketInfo {
    pub name: String,
    pub creation_date: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VersioningStatus {
    Enabled,
    Suspended,
}

impl VersioningStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            VersioningStatus::Enabled => "Enabled",
            VersioningStatus::Suspended => "Suspended",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "Enabled" => Some(VersioningStatus::Enabled),
            "Suspended" => Some(VersioningStatus::Suspended),
            _ => None,
        }
    }
}

/// An object version or delete marker
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ObjectVersion {
    pub key: String,
    pub version_id: String,
    pub is_latest: bool,
    pub is_delete_marker: bool,
    pub size: u64,
    pub last_modified: Option<DateTime<Utc>>,
}

impl ObjectVersion {
    fn from_document(doc: &Document, is_delete_marker: bool) -> Result<Self> {
        let key = doc
            .child_text("Key")
            .ok_or_else(|| Error::InvalidResponse("version entry without Key".to_string()))?;
        Ok(Self {
            key: key.to_string(),
            version_id: doc.child_text("VersionId").unwrap_or("null").to_string(),
            is_latest: doc.child_text("IsLatest") == Some("true"),
            is_delete_marker,
            size: doc.child_text("Size").and_then(|s| s.parse().ok()).unwrap_or(0),
            last_modified: doc.child_text("LastModified").and_then(parse_timestamp),
        })
    }
}

/// One page of `ListObjectVersions`
#[derive(Debug, Clone, Default)]
pub struct VersionPage {
    pub versions: Vec<ObjectVersion>,
    pub next_key_marker: Option<String>,
    pub next_version_id_marker: Option<String>,
    pub truncated: bool,
}

impl VersionPage {
    /// Versions and delete markers are returned in document order.
    pub fn from_document(doc: &Document) -> Result<Self> {
        let root = doc.child("ListVersionsResult").unwrap_or(doc);
        let mut versions = Vec::new();
        for (name, entry) in root.children() {
            match name.as_str() {
                "Version" => versions.push(ObjectVersion::from_document(entry, false)?),
                "DeleteMarker" => versions.push(ObjectVersion::from_document(entry, true)?),
                _ => {}
            }
        }
        Ok(Self {
            versions,
            next_key_marker: root.child_text("NextKeyMarker").map(String::from),
            next_version_id_marker: root.child_text("NextVersionIdMarker").map(String::from),
            truncated: root.child_text("IsTruncated") == Some("true"),
        })
    }
}

/// Object body delivered as a stream, plus the metadata from its headers
pub struct ObjectStream {
    pub metadata: Metadata,
    pub body: ByteStream,
}

impl std::fmt::Debug for ObjectStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectStream")
            .field("metadata", &self.metadata)
            .finish_non_exhaustive()
    }
}

impl ObjectStream {
    /// Adapt the body into an [`AsyncRead`].
    pub fn into_async_read(self) -> impl AsyncRead + Send + Unpin {
        StreamReader::new(
            self.body
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e)),
        )
    }
}

pub(crate) fn tags_from_document(doc: &Document) -> Tags {
    doc.root()
        .child("TagSet")
        .map(|set| {
            set.children_named("Tag")
                .filter_map(|tag| {
                    Some((
                        tag.child_text("Key")?.to_string(),
                        tag.child_text("Value").unwrap_or_default().to_string(),
                    ))
                })
                .collect()
        })
        .unwrap_or_default()
}

pub(crate) fn tags_to_document(tags: &Tags) -> Document {
    let tag_set = tags.iter().map(|(key, value)| {
        (
            "Tag",
            Document::node(vec![
                ("Key", Document::scalar(key.as_str())),
                ("Value", Document::scalar(value.as_str())),
            ]),
        )
    });
    Document::element("Tagging", Document::element("TagSet", Document::node(tag_set)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderValue;
    use tokio::io::AsyncReadExt;

    #[test]
    fn test_metadata_default() {
        let metadata = Metadata::default();
        assert_eq!(metadata.size, 0);
        assert_eq!(metadata.content_type, "application/octet-stream");
        assert!(metadata.custom.is_empty());
    }

    #[test]
    fn test_metadata_from_headers() {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_LENGTH, HeaderValue::from_static("11"));
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("text/plain"));
        headers.insert(ETAG, HeaderValue::from_static("\"abc\""));
        headers.insert(LAST_MODIFIED, HeaderValue::from_static("Wed, 12 Oct 2009 17:50:00 GMT"));
        headers.insert(X_AMZ_VERSION_ID, HeaderValue::from_static("v1"));
        headers.insert("x-amz-meta-owner", HeaderValue::from_static("alice"));

        let metadata = Metadata::from_headers(&headers);
        assert_eq!(metadata.size, 11);
        assert_eq!(metadata.content_type, "text/plain");
        assert_eq!(metadata.etag.as_deref(), Some("\"abc\""));
        assert_eq!(metadata.version_id.as_deref(), Some("v1"));
        assert_eq!(metadata.custom.get("owner").map(String::as_str), Some("alice"));
        assert_eq!(
            metadata.last_modified.unwrap().to_rfc3339(),
            "2009-10-12T17:50:00+00:00"
        );
    }

    #[test]
    fn test_metadata_serialization() {
        let mut metadata = Metadata::default();
        metadata.content_type = "application/json".to_string();
        metadata.custom.insert("key".to_string(), "value".to_string());

        let json = serde_json::to_string(&metadata).unwrap();
        let deserialized: Metadata = serde_json::from_str(&json).unwrap();
        assert_eq!(metadata, deserialized);
    }

    #[test]
    fn test_list_response_uses_last_key_as_marker() {
        let xml = br#"<ListBucketResult><IsTruncated>true</IsTruncated>
            <Contents><Key>a</Key><Size>1</Size><LastModified>2009-10-12T17:50:30.000Z</LastModified></Contents>
            <Contents><Key>b</Key><Size>2</Size></Contents>
            <CommonPrefixes><Prefix>dir/</Prefix></CommonPrefixes>
            </ListBucketResult>"#;
        let page = ListResponse::from_document(&Document::from_xml(xml).unwrap()).unwrap();
        assert_eq!(page.objects.len(), 2);
        assert!(page.objects[0].last_modified.is_some());
        assert_eq!(page.common_prefixes, vec!["dir/"]);
        assert_eq!(page.next_marker.as_deref(), Some("b"));
    }

    #[test]
    fn test_list_response_from_json() {
        let json = br#"{"IsTruncated":false,"Contents":[{"Key":"x","Size":4}]}"#;
        let page = ListResponse::from_document(&Document::from_json(json).unwrap()).unwrap();
        assert_eq!(page.objects[0].key, "x");
        assert_eq!(page.objects[0].size, 4);
        assert!(!page.truncated);
        assert!(page.next_marker.is_none());
    }

    #[test]
    fn test_version_page_keeps_delete_markers() {
        let xml = br#"<ListVersionsResult><IsTruncated>false</IsTruncated>
            <Version><Key>k</Key><VersionId>2</VersionId><IsLatest>false</IsLatest><Size>3</Size></Version>
            <DeleteMarker><Key>k</Key><VersionId>3</VersionId><IsLatest>true</IsLatest></DeleteMarker>
            </ListVersionsResult>"#;
        let page = VersionPage::from_document(&Document::from_xml(xml).unwrap()).unwrap();
        assert_eq!(page.versions.len(), 2);
        assert!(!page.versions[0].is_delete_marker);
        assert!(page.versions[1].is_delete_marker);
        assert!(page.versions[1].is_latest);
    }

    #[test]
    fn test_tags_document() {
        let mut tags = Tags::new();
        tags.insert("env".to_string(), "dev".to_string());
        tags.insert("owner".to_string(), "ops".to_string());
        let doc = tags_to_document(&tags);
        assert_eq!(
            doc.to_xml(),
            "<Tagging><TagSet><Tag><Key>env</Key><Value>dev</Value></Tag>\
             <Tag><Key>owner</Key><Value>ops</Value></Tag></TagSet></Tagging>"
        );
        assert_eq!(tags_from_document(&doc), tags);
    }

    #[test]
    fn test_versioning_status() {
        assert_eq!(VersioningStatus::parse("Enabled"), Some(VersioningStatus::Enabled));
        assert_eq!(VersioningStatus::parse(""), None);
        assert_eq!(VersioningStatus::Suspended.as_str(), "Suspended");
    }

    #[tokio::test]
    async fn test_object_stream_as_async_read() {
        let body: ByteStream = Box::pin(futures::stream::iter(vec![
            Ok(bytes::Bytes::from_static(b"hello ")),
            Ok(bytes::Bytes::from_static(b"world")),
        ]));
        let stream = ObjectStream {
            metadata: Metadata::default(),
            body,
        };
        let mut out = String::new();
        stream.into_async_read().read_to_string(&mut out).await.unwrap();
        assert_eq!(out, "hello world");
    }
}
