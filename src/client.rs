use crate::error::Result;
use crate::s3_client::S3Client;
use crate::types::*;
use async_trait::async_trait;
use bytes::Bytes;

/// Trait for object store operations on a single bucket
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Put an object into storage
    async fn put(&self, key: &str, data: Bytes, metadata: Option<Metadata>) -> Result<PutResponse>;

    /// Get an object from storage
    async fn get(&self, key: &str) -> Result<(Bytes, Metadata)>;

    /// Delete an object from storage
    async fn delete(&self, key: &str) -> Result<()>;

    /// List objects with optional prefix filtering
    async fn list(&self, list_req: ListRequest) -> Result<ListResponse>;

    /// Check if an object exists
    async fn exists(&self, key: &str) -> Result<bool>;

    /// Get metadata for an object
    async fn get_metadata(&self, key: &str) -> Result<Metadata>;
}

/// One bucket of an [`S3Client`]
#[derive(Clone)]
pub struct Bucket {
    client: S3Client,
    name: String,
}

impl Bucket {
    pub fn new(client: S3Client, name: impl Into<String>) -> Self {
        Self {
            client,
            name: name.into(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn client(&self) -> &S3Client {
        &self.client
    }
}

impl S3Client {
    /// View of `name` implementing [`ObjectStore`].
    pub fn bucket(&self, name: impl Into<String>) -> Bucket {
        Bucket::new(self.clone(), name)
    }
}

#[async_trait]
impl ObjectStore for Bucket {
    async fn put(&self, key: &str, data: Bytes, metadata: Option<Metadata>) -> Result<PutResponse> {
        let metadata = metadata.unwrap_or_default();
        self.client
            .put_object_with_metadata(&self.name, key, data, &metadata)
            .await
    }

    async fn get(&self, key: &str) -> Result<(Bytes, Metadata)> {
        self.client.get_object(&self.name, key, None).await
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.client.delete_object(&self.name, key, None).await
    }

    async fn list(&self, list_req: ListRequest) -> Result<ListResponse> {
        self.client.list_objects(&self.name, &list_req).await
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        self.client.object_exists(&self.name, key, None).await
    }

    async fn get_metadata(&self, key: &str) -> Result<Metadata> {
        self.client.head_object(&self.name, key, None).await
    }
}
