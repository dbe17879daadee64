//! End-to-end pipeline: classify, fetch, resolve, place, commit.
//!
//! Stages run strictly sequentially and fail fast; no stage retries. The
//! caller supplies a URL and a progress callback and receives one outcome.

use std::fs;
use std::path::Path;

use anyhow::Result;
use tracing::{info, warn};

use crate::classifier::{classify, MediaKind};
use crate::config::SaverConfig;
use crate::content_type::resolve_extension;
use crate::engine::{CancelHandle, DownloadEngine, Progress};
use crate::error::SaveError;
use crate::placement::place;
use crate::store::{MediaFile, MediaStore};

/// Immutable description of one download.
#[derive(Debug, Clone)]
pub struct DownloadRequest {
    pub url: String,
    /// Caller's expectation of what the URL points at. When present,
    /// classification must agree or the request is rejected.
    pub kind_hint: Option<MediaKind>,
}

impl DownloadRequest {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            kind_hint: None,
        }
    }

    pub fn with_kind_hint(mut self, kind: MediaKind) -> Self {
        self.kind_hint = Some(kind);
        self
    }
}

/// Downloads one direct media URL and commits it into a media store.
pub struct MediaSaver<S: MediaStore> {
    engine: DownloadEngine,
    store: S,
}

impl<S: MediaStore> MediaSaver<S> {
    pub fn new(config: &SaverConfig, store: S) -> Result<Self> {
        Ok(Self {
            engine: DownloadEngine::new(config)?,
            store,
        })
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Fetches `request` and commits the result. `on_progress` fires zero
    /// or more times from the transfer's execution context; a rejected
    /// request produces no progress events and no network call.
    pub async fn save<F>(
        &self,
        request: &DownloadRequest,
        on_progress: F,
    ) -> Result<MediaFile, SaveError>
    where
        F: Fn(Progress) + Send + 'static,
    {
        self.save_cancellable(request, on_progress, CancelHandle::new())
            .await
    }

    /// Like [`MediaSaver::save`], with a caller-held cancel handle.
    pub async fn save_cancellable<F>(
        &self,
        request: &DownloadRequest,
        on_progress: F,
        cancel: CancelHandle,
    ) -> Result<MediaFile, SaveError>
    where
        F: Fn(Progress) + Send + 'static,
    {
        let kind = classify(&request.url)
            .ok_or_else(|| SaveError::Validation(request.url.clone()))?;
        if let Some(hint) = request.kind_hint {
            if hint != kind {
                return Err(SaveError::Validation(format!(
                    "{} does not match the expected media kind",
                    request.url
                )));
            }
        }
        if !self.store.is_authorized() {
            return Err(SaveError::Permission);
        }

        self.run_pipeline(&request.url, kind, on_progress, cancel)
            .await
    }

    /// Fetch, resolve, place, commit. Runs after a request has passed
    /// validation and authorization.
    async fn run_pipeline<F>(
        &self,
        url: &str,
        kind: MediaKind,
        on_progress: F,
        cancel: CancelHandle,
    ) -> Result<MediaFile, SaveError>
    where
        F: Fn(Progress) + Send + 'static,
    {
        let payload = self
            .engine
            .start_cancellable(url, on_progress, cancel)
            .await?;
        let extension = resolve_extension(url, payload.content_type.as_deref());
        let final_path = place(&payload.path, self.engine.scratch_dir(), &extension)?;
        let file = MediaFile {
            path: final_path,
            kind,
            extension,
        };

        self.commit_placed(&file).await?;
        info!(url = %url, path = %file.path.display(), "media saved");
        Ok(file)
    }

    /// Commits an already-placed file, deleting it when the store rejects
    /// the commit so nothing orphaned stays behind.
    ///
    /// Images go to the store as decoded pixels. HEIC has no registered
    /// in-process decoder, so recognized HEIC payloads are committed from
    /// their original encoded bytes instead of being rejected.
    async fn commit_placed(&self, file: &MediaFile) -> Result<(), SaveError> {
        let commit = match file.kind {
            MediaKind::Video => self.store.commit_video(file).await,
            MediaKind::Image => {
                let bytes = match fs::read(&file.path) {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        remove_placed(&file.path);
                        return Err(SaveError::UnsupportedContent(format!(
                            "reading image bytes: {}",
                            e
                        )));
                    }
                };
                match image::load_from_memory(&bytes) {
                    Ok(image) => self.store.commit_image(file, image).await,
                    Err(_) if is_heic(&bytes) => {
                        self.store.commit_image_bytes(file, bytes).await
                    }
                    Err(e) => {
                        remove_placed(&file.path);
                        return Err(SaveError::UnsupportedContent(format!(
                            "decoding image: {}",
                            e
                        )));
                    }
                }
            }
        };

        if let Err(e) = commit {
            remove_placed(&file.path);
            return Err(SaveError::Persistence(format!("{:#}", e)));
        }
        Ok(())
    }
}

/// True when `bytes` open with an ISO-BMFF `ftyp` box whose major brand is a
/// HEIF/HEIC still image.
fn is_heic(bytes: &[u8]) -> bool {
    const BRANDS: [&[u8; 4]; 6] = [b"heic", b"heix", b"heim", b"heis", b"mif1", b"msf1"];
    bytes.len() >= 12
        && bytes[4..8] == *b"ftyp"
        && BRANDS.iter().any(|brand| bytes[8..12] == **brand)
}

fn remove_placed(path: &Path) {
    if let Err(e) = fs::remove_file(path) {
        warn!(
            "failed to remove uncommitted file {}: {}",
            path.display(),
            e
        );
    }
}
