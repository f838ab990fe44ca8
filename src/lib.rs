//! # objstore-s3
//!
//! An async client for Amazon S3 and S3-compatible object stores.
//!
//! ## Features
//!
//! - **Signed requests**: AWS Signature Version 4 on every request
//! - **Region discovery**: region-mismatch errors correct a per-client
//!   bucket→region cache and the request is retried in the right region
//! - **Bounded retries**: explicit policies for read-after-write lag
//! - **Multipart uploads**: fixed-size parts streamed from any `AsyncRead`
//! - **Presigned URLs**: query-string authenticated download links
//!
//! ## Quick Start
//!
//! ```no_run
//! use objstore_s3::{EndpointConfig, S3Client};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // Reads AWS_ACCESS_KEY_ID, AWS_SECRET_ACCESS_KEY and AWS_REGION
//!     let client = S3Client::new(EndpointConfig::from_env()?)?;
//!
//!     client.create_bucket("my-bucket").await?;
//!     client.put_object("my-bucket", "hello.txt", "Hello, World!", Some("text/plain")).await?;
//!
//!     let (data, metadata) = client.get_object("my-bucket", "hello.txt", None).await?;
//!     println!("Retrieved {} bytes of {}", data.len(), metadata.content_type);
//!
//!     if client.object_exists("my-bucket", "hello.txt", None).await? {
//!         client.delete_object("my-bucket", "hello.txt", None).await?;
//!     }
//!
//!     Ok(())
//! }
//! ```
//!
//! ## S3-compatible servers
//!
//! ```no_run
//! use objstore_s3::{Credentials, Endpoint, EndpointConfig, S3Client};
//!
//! let config = EndpointConfig::new("us-east-1", Credentials::new("minio", "minio123"))
//!     .with_endpoint(Endpoint::custom("http://localhost:9000")?);
//! let client = S3Client::new(config)?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
//!
//! ## Multipart uploads
//!
//! ```no_run
//! # async fn example(client: objstore_s3::S3Client) -> Result<(), Box<dyn std::error::Error>> {
//! let response = client.upload_file("my-bucket", "backup.tar", "/tmp/backup.tar").await?;
//! println!("uploaded, etag {:?}", response.etag);
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod config;
pub mod dispatch;
pub mod document;
pub mod error;
pub mod multipart;
pub mod presign;
pub mod query;
pub mod retry;
pub mod s3_client;
pub mod signing;
pub mod transport;
pub mod types;

// Re-export main types for convenience
pub use client::{Bucket, ObjectStore};
pub use config::{ClientOptions, Credentials, Endpoint, EndpointConfig};
pub use dispatch::{Dispatcher, RegionCache, RequestDescriptor, Response, ResponseMode};
pub use document::Document;
pub use error::{Error, Result, ServiceError};
pub use multipart::{MultipartConfig, MultipartCoordinator, MultipartUpload, UploadState};
pub use presign::PresignOptions;
pub use retry::{Delay, RetryPolicy};
pub use s3_client::S3Client;
pub use transport::{ReqwestTransport, Transport};
pub use types::*;
