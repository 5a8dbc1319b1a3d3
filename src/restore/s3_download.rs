// pgvault/src/restore/s3_download.rs
use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tracing::info;

use crate::backup::s3_upload::spaces_client;
use crate::config::SpacesConfig;

/// Splits `s3://bucket/key` into bucket and key.
pub fn parse_s3_uri(s3_uri: &str) -> Result<(String, String)> {
    let uri = url::Url::parse(s3_uri).with_context(|| format!("Invalid S3 URI format: {}", s3_uri))?;
    if uri.scheme() != "s3" {
        anyhow::bail!("S3 URI must start with s3://");
    }
    let bucket = uri.host_str().context("S3 URI missing bucket name")?.to_string();
    let key = uri.path().trim_start_matches('/').to_string();
    if key.is_empty() {
        anyhow::bail!("S3 URI missing key (object path)");
    }
    Ok((bucket, key))
}

/// Downloads `s3_uri` into `into_dir`, keeping the object's file name.
pub async fn download_bundle(spaces_config: &SpacesConfig, s3_uri: &str, into_dir: &Path) -> Result<PathBuf> {
    let (bucket, key) = parse_s3_uri(s3_uri)?;
    let file_name = key.rsplit('/').next().unwrap_or(&key).to_string();
    let destination_path = into_dir.join(&file_name);
    info!(uri = s3_uri, to = %destination_path.display(), "Downloading bundle");

    tokio::fs::create_dir_all(into_dir)
        .await
        .with_context(|| format!("Failed to create directory for download: {}", into_dir.display()))?;

    let mut object = spaces_client(spaces_config)
        .await
        .get_object()
        .bucket(&bucket)
        .key(&key)
        .send()
        .await
        .with_context(|| format!("Failed to get object {}", s3_uri))?;

    let mut output_file = File::create(&destination_path)
        .await
        .with_context(|| format!("Failed to create destination file: {}", destination_path.display()))?;

    let mut total_bytes = 0usize;
    while let Some(chunk) = object
        .body
        .try_next()
        .await
        .with_context(|| format!("Failed to read body of {}", s3_uri))?
    {
        output_file
            .write_all(&chunk)
            .await
            .with_context(|| format!("Failed to write to {}", destination_path.display()))?;
        total_bytes += chunk.len();
    }
    output_file.flush().await?;

    info!(bytes = total_bytes, path = %destination_path.display(), "✅ Bundle downloaded");
    Ok(destination_path)
}
