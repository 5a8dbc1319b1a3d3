// pgvault/src/backup/s3_upload.rs
use anyhow::{Context, Result};
use aws_sdk_s3 as s3;
use s3::config::Region;
use s3::primitives::ByteStream;
use std::path::Path;
use tracing::info;

use crate::config::SpacesConfig;

/// Client for an S3-compatible endpoint (Spaces, MinIO, AWS) with static
/// credentials from config.json.
pub(crate) async fn spaces_client(spaces_config: &SpacesConfig) -> s3::Client {
    let sdk_config = aws_config::defaults(s3::config::BehaviorVersion::latest())
        .endpoint_url(&spaces_config.endpoint_url)
        .region(Region::new(spaces_config.region.clone()))
        .credentials_provider(s3::config::Credentials::new(
            &spaces_config.access_key_id,
            &spaces_config.secret_access_key,
            None,
            None,
            "Static",
        ))
        .load()
        .await;
    s3::Client::new(&sdk_config)
}

/// `<folder_prefix>/<file_name>`, or just the file name without a prefix.
pub fn object_key(spaces_config: &SpacesConfig, file_name: &str) -> String {
    match spaces_config.folder_prefix.as_deref().map(|p| p.trim_matches('/')) {
        Some(prefix) if !prefix.is_empty() => format!("{}/{}", prefix, file_name),
        _ => file_name.to_string(),
    }
}

/// Fails fast before any export runs when the bucket is unreachable.
pub async fn check_bucket_access(spaces_config: &SpacesConfig) -> Result<()> {
    let client = spaces_client(spaces_config).await;
    client
        .head_bucket()
        .bucket(&spaces_config.bucket_name)
        .send()
        .await
        .with_context(|| {
            format!(
                "Bucket '{}' at {} is not accessible",
                spaces_config.bucket_name, spaces_config.endpoint_url
            )
        })?;
    info!(bucket = %spaces_config.bucket_name, "✓ Bucket is accessible");
    Ok(())
}

/// Uploads a bundle and returns the `s3://bucket/key` it can be restored from.
pub async fn upload_bundle(spaces_config: &SpacesConfig, bundle_path: &Path) -> Result<String> {
    let file_name = bundle_path
        .file_name()
        .context("Bundle path has no file name")?
        .to_string_lossy()
        .into_owned();
    let key = object_key(spaces_config, &file_name);
    info!(bundle = %bundle_path.display(), bucket = %spaces_config.bucket_name, key = %key, "Uploading bundle");

    let body = ByteStream::from_path(bundle_path)
        .await
        .with_context(|| format!("Failed to read bundle {}", bundle_path.display()))?;

    spaces_client(spaces_config)
        .await
        .put_object()
        .bucket(&spaces_config.bucket_name)
        .key(&key)
        .body(body)
        .send()
        .await
        .with_context(|| format!("Failed to upload {} to bucket {}", bundle_path.display(), spaces_config.bucket_name))?;

    let uri = format!("s3://{}/{}", spaces_config.bucket_name, key);
    info!(uri = %uri, "✅ Bundle uploaded");
    Ok(uri)
}
