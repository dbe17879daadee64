//! Media store boundary.
//!
//! The pipeline depends only on the `MediaStore` trait and does not know
//! what system of record sits behind it. `FolderStore` is the built-in
//! implementation committing into a local library directory.

use std::path::PathBuf;

use anyhow::{Context, Result};
use async_trait::async_trait;
use image::DynamicImage;
use tracing::debug;

use crate::classifier::MediaKind;

/// A finished, placed media file ready for commit. Produced once by
/// placement, consumed once by the store.
#[derive(Debug, Clone)]
pub struct MediaFile {
    pub path: PathBuf,
    pub kind: MediaKind,
    pub extension: String,
}

/// External system of record for finished media.
///
/// Videos are committed by file reference. Images are committed from
/// decoded pixel data where a decoder exists; formats the pipeline accepts
/// but cannot decode in-process (HEIC) are committed from their original
/// encoded bytes instead.
#[async_trait]
pub trait MediaStore: Send + Sync {
    /// Whether the caller may add media to the store. Checked before any
    /// network activity.
    fn is_authorized(&self) -> bool;

    /// Durably commits a video by file reference.
    async fn commit_video(&self, file: &MediaFile) -> Result<()>;

    /// Durably commits an image from its decoded pixels.
    async fn commit_image(&self, file: &MediaFile, image: DynamicImage) -> Result<()>;

    /// Durably commits an image from its original encoded bytes.
    async fn commit_image_bytes(&self, file: &MediaFile, bytes: Vec<u8>) -> Result<()>;
}

/// Folder-backed media store: commits into a library directory on the local
/// filesystem.
pub struct FolderStore {
    library_dir: PathBuf,
}

impl FolderStore {
    /// Creates the store, making sure the library directory exists.
    pub fn new(library_dir: impl Into<PathBuf>) -> Result<Self> {
        let library_dir = library_dir.into();
        std::fs::create_dir_all(&library_dir)
            .with_context(|| format!("failed to create library dir: {}", library_dir.display()))?;
        Ok(Self { library_dir })
    }

    pub fn library_dir(&self) -> &std::path::Path {
        &self.library_dir
    }

    fn destination(&self, file: &MediaFile) -> Result<PathBuf> {
        let name = file
            .path
            .file_name()
            .context("placed file has no file name")?;
        Ok(self.library_dir.join(name))
    }
}

#[async_trait]
impl MediaStore for FolderStore {
    fn is_authorized(&self) -> bool {
        // Local folder: authorized iff the library directory is writable.
        !self.library_dir.metadata().map(|m| m.permissions().readonly()).unwrap_or(true)
    }

    async fn commit_video(&self, file: &MediaFile) -> Result<()> {
        let dest = self.destination(file)?;
        tokio::fs::copy(&file.path, &dest)
            .await
            .with_context(|| format!("failed to copy video into library: {}", dest.display()))?;
        debug!(dest = %dest.display(), "video committed to library");
        Ok(())
    }

    async fn commit_image(&self, file: &MediaFile, image: DynamicImage) -> Result<()> {
        let dest = self.destination(file)?;
        // Re-encode from the decoded pixels; the format follows the
        // destination extension.
        tokio::task::spawn_blocking(move || image.save(&dest).context("failed to encode image"))
            .await
            .context("image encode task failed")??;
        debug!("image committed to library");
        Ok(())
    }

    async fn commit_image_bytes(&self, file: &MediaFile, bytes: Vec<u8>) -> Result<()> {
        let dest = self.destination(file)?;
        tokio::fs::write(&dest, bytes)
            .await
            .with_context(|| format!("failed to write image into library: {}", dest.display()))?;
        debug!(dest = %dest.display(), "image committed to library from encoded bytes");
        Ok(())
    }
}
