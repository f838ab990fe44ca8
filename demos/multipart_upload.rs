use objstore_s3::{EndpointConfig, MultipartConfig, S3Client};
use std::env;
use tracing_subscriber::EnvFilter;

/// Usage: multipart_upload <bucket> <key> <file>
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let mut args = env::args().skip(1);
    let (bucket, key, path) = match (args.next(), args.next(), args.next()) {
        (Some(bucket), Some(key), Some(path)) => (bucket, key, path),
        _ => anyhow::bail!("usage: multipart_upload <bucket> <key> <file>"),
    };

    let client = S3Client::new(EndpointConfig::from_env()?)?;
    let multipart = client.multipart_with(
        MultipartConfig::new(client.options().part_size).with_abort_on_failure(true),
    );

    let response = multipart.upload_file(&bucket, &key, &path).await?;
    println!("✓ Uploaded {} to s3://{}/{}", path, bucket, key);
    println!("  ETag: {:?}", response.etag);

    let metadata = client.head_object(&bucket, &key, None).await?;
    println!("  Size: {} bytes", metadata.size);
    Ok(())
}
