use bytes::Bytes;
use objstore_s3::{EndpointConfig, ListRequest, ObjectStore, PresignOptions, S3Client, Tags};
use std::env;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    println!("==> S3 Client Example");

    let client = S3Client::new(EndpointConfig::from_env()?)?;
    let bucket = env::var("S3_BUCKET").unwrap_or_else(|_| "objstore-s3-demo".to_string());
    println!("✓ Created client for region {}", client.config().region);

    client.create_bucket(&bucket).await?;
    println!("✓ Bucket ready: {} ({})", bucket, client.bucket_region(&bucket).await?);

    // Put an object
    let key = "demos/hello.txt";
    let put_response = client
        .put_object(&bucket, key, "Hello from objstore-s3!", Some("text/plain"))
        .await?;
    println!("✓ Put object: {}", key);
    println!("  ETag: {:?}", put_response.etag);

    // Tag it
    let mut tags = Tags::new();
    tags.insert("demo".to_string(), "s3_client".to_string());
    client.put_object_tagging(&bucket, key, None, &tags).await?;
    println!("✓ Tags: {:?}", client.get_object_tagging(&bucket, key, None).await?);

    // Same operations through the bucket view
    let view = client.bucket(bucket.as_str());
    view.put("demos/bytes.bin", Bytes::from_static(&[1, 2, 3]), None).await?;
    let metadata = view.get_metadata("demos/bytes.bin").await?;
    println!("✓ Got metadata: {} bytes, {}", metadata.size, metadata.content_type);

    let list_response = view.list(ListRequest::with_prefix("demos/")).await?;
    println!("✓ Listed {} objects with prefix 'demos/'", list_response.objects.len());
    for obj in &list_response.objects {
        println!("  - {} ({} bytes)", obj.key, obj.size);
    }

    let url = client.presign_url(&bucket, key, &PresignOptions::default())?;
    println!("✓ Presigned URL (1h): {}", url);

    client.delete_object(&bucket, key, None).await?;
    println!("✓ Object exists after deletion: {}", client.object_exists(&bucket, key, None).await?);

    println!("\n==> S3 client example completed successfully!");
    Ok(())
}
