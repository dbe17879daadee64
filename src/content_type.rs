//! File-extension resolution from imperfect signals.
//!
//! The server-reported MIME type is sometimes absent or wrong, so the
//! request URL is consulted first, then the MIME table, then extension-like
//! tokens inside the URL path, and finally a literal fallback.

use url::Url;

use crate::classifier::path_extension;

/// Fallback extension when no signal yields anything usable.
pub const FALLBACK_EXTENSION: &str = "dat";

/// MIME type to extension, for the media types we recognize.
const MIME_TABLE: [(&str, &str); 6] = [
    ("video/mp4", "mp4"),
    ("video/quicktime", "mov"),
    ("video/x-m4v", "m4v"),
    ("image/jpeg", "jpg"),
    ("image/png", "png"),
    ("image/heic", "heic"),
];

/// Extension-like tokens searched for inside the URL path, in priority
/// order.
const PATH_HINTS: [(&str, &str); 6] = [
    (".mp4", "mp4"),
    (".mov", "mov"),
    (".m4v", "m4v"),
    (".jpg", "jpg"),
    (".jpeg", "jpg"),
    (".png", "png"),
];

/// Resolves the extension for a finished download.
///
/// Precedence, first match wins:
/// 1. Non-empty extension of the request URL's path, used as-is even when
///    it is outside the recognized set.
/// 2. `response_mime` looked up in the MIME table (parameters such as
///    `; charset=` are stripped first).
/// 3. Substring search of the URL path for known extension tokens. The
///    search covers the path component only; query parameters never
///    participate.
/// 4. `"dat"`.
pub fn resolve_extension(request_url: &str, response_mime: Option<&str>) -> String {
    let path = Url::parse(request_url)
        .map(|u| u.path().to_ascii_lowercase())
        .unwrap_or_default();

    if let Some(ext) = path_extension(&path) {
        return ext.to_string();
    }

    if let Some(mime) = response_mime {
        let mime = mime.to_ascii_lowercase();
        let essence = mime.split(';').next().unwrap_or("").trim();
        if let Some((_, ext)) = MIME_TABLE.iter().find(|(m, _)| *m == essence) {
            return ext.to_string();
        }
    }

    for (hint, ext) in PATH_HINTS {
        if path.contains(hint) {
            return ext.to_string();
        }
    }

    FALLBACK_EXTENSION.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn url_path_extension_wins() {
        assert_eq!(
            resolve_extension("https://x/a.jpg", Some("video/mp4")),
            "jpg"
        );
        // Used as-is even outside the recognized set.
        assert_eq!(resolve_extension("https://x/archive.bin", None), "bin");
    }

    #[test]
    fn url_extension_is_lowercased() {
        assert_eq!(resolve_extension("https://x/photo.PNG", None), "png");
    }

    #[test]
    fn mime_table_when_url_has_no_extension() {
        assert_eq!(
            resolve_extension("https://x/media", Some("video/mp4")),
            "mp4"
        );
        assert_eq!(
            resolve_extension("https://x/media", Some("video/quicktime")),
            "mov"
        );
        assert_eq!(
            resolve_extension("https://x/media", Some("video/x-m4v")),
            "m4v"
        );
        assert_eq!(
            resolve_extension("https://x/media", Some("image/jpeg")),
            "jpg"
        );
        assert_eq!(
            resolve_extension("https://x/media", Some("image/png")),
            "png"
        );
        assert_eq!(
            resolve_extension("https://x/media", Some("image/heic")),
            "heic"
        );
    }

    #[test]
    fn mime_match_ignores_case_and_parameters() {
        assert_eq!(
            resolve_extension("https://x/media", Some("Image/JPEG; charset=binary")),
            "jpg"
        );
    }

    #[test]
    fn path_hint_when_mime_is_unknown() {
        assert_eq!(
            resolve_extension("https://x/dl/clip.mov/stream", None),
            "mov"
        );
        assert_eq!(
            resolve_extension("https://x/dl/pic.jpeg/raw", Some("application/octet-stream")),
            "jpg"
        );
    }

    #[test]
    fn path_hints_respect_priority_order() {
        // Both tokens present; ".mp4" outranks ".png".
        assert_eq!(
            resolve_extension("https://x/a.png.dir/b.mp4.dir/media", None),
            "mp4"
        );
    }

    #[test]
    fn query_parameters_do_not_participate() {
        assert_eq!(
            resolve_extension("https://x/media?src=a.mov", None),
            FALLBACK_EXTENSION
        );
    }

    #[test]
    fn falls_back_to_dat() {
        assert_eq!(resolve_extension("https://x/media", None), "dat");
        assert_eq!(
            resolve_extension("https://x/media", Some("application/pdf")),
            "dat"
        );
    }
}
