//! URL classification: is this a direct media link?
//!
//! Pure check, no I/O. Accepts only `https` URLs whose path ends in a known
//! image or video extension; everything else is rejected before any network
//! activity happens.

use url::Url;

/// Image extensions accepted by the classifier.
pub const IMAGE_EXTENSIONS: [&str; 4] = ["jpg", "jpeg", "png", "heic"];

/// Video extensions accepted by the classifier.
pub const VIDEO_EXTENSIONS: [&str; 3] = ["mp4", "mov", "m4v"];

/// Media category of an accepted URL or a finished file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKind {
    Image,
    Video,
}

/// Classifies `url` as direct image or video media, or `None` when rejected.
///
/// Only the `https` scheme is accepted. The extension match is a
/// case-insensitive suffix check on the URL path; query and fragment are
/// ignored. An unparseable string is a rejection, not an error.
pub fn classify(url: &str) -> Option<MediaKind> {
    let parsed = Url::parse(url).ok()?;
    if parsed.scheme() != "https" {
        return None;
    }

    let path = parsed.path().to_ascii_lowercase();
    let ext = path_extension(&path)?;
    if IMAGE_EXTENSIONS.contains(&ext) {
        Some(MediaKind::Image)
    } else if VIDEO_EXTENSIONS.contains(&ext) {
        Some(MediaKind::Video)
    } else {
        None
    }
}

/// True if `url` points directly at image or video bytes we can save.
pub fn is_direct_media(url: &str) -> bool {
    classify(url).is_some()
}

/// Extension of the last path segment, or `None` when the segment has no
/// dot, starts with its only dot, or ends in one.
pub(crate) fn path_extension(path: &str) -> Option<&str> {
    let segment = path.rsplit('/').next().unwrap_or(path);
    let (stem, ext) = segment.rsplit_once('.')?;
    if stem.is_empty() || ext.is_empty() {
        return None;
    }
    Some(ext)
}
