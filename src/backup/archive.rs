// pgvault/src/backup/archive.rs
use anyhow::{Context, Result};
use flate2::Compression;
use flate2::write::GzEncoder;
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use tar::Builder;
use tracing::{debug, info};
use walkdir::WalkDir;

use super::artifact::METADATA_SUFFIX;

/// Packs a backup set directory into `<set_dir>.tar.gz`.
///
/// Entries are stored under the set's own directory name, so extracting the
/// bundle recreates `backup_<timestamp>/`. Leftover `.partial` outputs are
/// not bundled.
pub fn create_tar_gz_archive(set_dir: &Path) -> Result<PathBuf> {
    if !set_dir.is_dir() {
        anyhow::bail!("Backup set is not a directory: {}", set_dir.display());
    }
    let set_name = set_dir
        .file_name()
        .context("Backup set path has no directory name")?
        .to_owned();
    let bundle_path = set_dir.with_file_name(format!("{}.tar.gz", set_name.to_string_lossy()));
    if bundle_path.exists() {
        anyhow::bail!("Bundle {} already exists", bundle_path.display());
    }

    info!(set = %set_dir.display(), bundle = %bundle_path.display(), "Bundling backup set");

    let bundle_file = File::create(&bundle_path)
        .with_context(|| format!("Failed to create bundle file: {}", bundle_path.display()))?;
    let mut tar_builder = Builder::new(GzEncoder::new(bundle_file, Compression::default()));

    for entry in WalkDir::new(set_dir).sort_by_file_name() {
        let entry = entry.with_context(|| format!("Failed to walk directory: {}", set_dir.display()))?;
        let path = entry.path();
        let relative = path
            .strip_prefix(set_dir)
            .with_context(|| format!("Failed to strip prefix {} from {}", set_dir.display(), path.display()))?;
        if relative.as_os_str().is_empty() {
            continue;
        }
        let is_partial = relative
            .components()
            .next()
            .and_then(|c| c.as_os_str().to_str())
            .is_some_and(|first| first.starts_with('.') && first.ends_with(".partial"));
        if is_partial {
            debug!(path = %path.display(), "Skipping partial export output");
            continue;
        }

        let name = Path::new(&set_name).join(relative);
        if entry.file_type().is_dir() {
            tar_builder
                .append_dir(&name, path)
                .with_context(|| format!("Failed to append directory {} to bundle", path.display()))?;
        } else if entry.file_type().is_file() {
            tar_builder
                .append_path_with_name(path, &name)
                .with_context(|| format!("Failed to append file {} to bundle", path.display()))?;
        }
    }

    tar_builder
        .into_inner()
        .and_then(|encoder| encoder.finish())
        .with_context(|| format!("Failed to finish bundle {}", bundle_path.display()))?;

    info!(bundle = %bundle_path.display(), "✓ Bundle written");
    Ok(bundle_path)
}

/// Unpacks a bundle into `extract_to_dir` and returns the backup set
/// directory inside it.
pub fn extract_tar_gz_archive(bundle_path: &Path, extract_to_dir: &Path) -> Result<PathBuf> {
    if !bundle_path.is_file() {
        anyhow::bail!("Bundle for extraction is not a file: {}", bundle_path.display());
    }
    fs::create_dir_all(extract_to_dir)
        .with_context(|| format!("Failed to create extraction directory: {}", extract_to_dir.display()))?;

    info!(bundle = %bundle_path.display(), into = %extract_to_dir.display(), "Extracting bundle");
    let bundle_file =
        File::open(bundle_path).with_context(|| format!("Failed to open bundle: {}", bundle_path.display()))?;
    let mut archive = tar::Archive::new(flate2::read::GzDecoder::new(bundle_file));
    archive.unpack(extract_to_dir).with_context(|| {
        format!(
            "Failed to unpack bundle {} to {}",
            bundle_path.display(),
            extract_to_dir.display()
        )
    })?;

    locate_backup_set(extract_to_dir)
}

fn holds_sidecars(dir: &Path) -> Result<bool> {
    for entry in fs::read_dir(dir)? {
        let name = entry?.file_name();
        if name.to_string_lossy().ends_with(METADATA_SUFFIX) {
            return Ok(true);
        }
    }
    Ok(false)
}

/// The extraction root itself when it holds artifact sidecars, otherwise
/// its single subdirectory.
fn locate_backup_set(root: &Path) -> Result<PathBuf> {
    if holds_sidecars(root)? {
        return Ok(root.to_path_buf());
    }
    let subdirs: Vec<PathBuf> = fs::read_dir(root)?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| path.is_dir())
        .collect();
    match subdirs.as_slice() {
        [set_dir] if holds_sidecars(set_dir)? => Ok(set_dir.clone()),
        _ => anyhow::bail!("No backup set found in {}", root.display()),
    }
}
