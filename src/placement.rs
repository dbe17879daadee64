//! Atomic placement of a finished temp file under a fresh private name.
//!
//! The destination name is generated, never derived from the request, so
//! concurrent or historical downloads cannot collide and paths are not
//! predictable. The move happens exactly once, before any store commit.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::SaveError;

/// Moves `temp_path` to a fresh uniquely-named `msave-<uuid>.<extension>`
/// file inside `scratch_dir` and returns the destination.
///
/// Any pre-existing file at the destination is removed first. On failure the
/// original temp file is cleaned up and `Storage` is returned, so no store
/// commit can see a half-placed payload.
pub fn place(temp_path: &Path, scratch_dir: &Path, extension: &str) -> Result<PathBuf, SaveError> {
    let dest = scratch_dir.join(format!("msave-{}.{}", Uuid::new_v4(), extension));

    let _ = fs::remove_file(&dest);
    match fs::rename(temp_path, &dest) {
        Ok(()) => {
            debug!(from = %temp_path.display(), to = %dest.display(), "placed payload");
            Ok(dest)
        }
        Err(e) => {
            if let Err(rm) = fs::remove_file(temp_path) {
                warn!(
                    "failed to remove temp file {} after placement error: {}",
                    temp_path.display(),
                    rm
                );
            }
            Err(SaveError::Storage(e))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn moves_payload_to_a_fresh_name_with_extension() {
        let dir = tempfile::tempdir().unwrap();
        let temp = dir.path().join("payload");
        fs::write(&temp, b"media bytes").unwrap();

        let placed = place(&temp, dir.path(), "jpg").unwrap();

        assert!(!temp.exists());
        assert_eq!(placed.extension().unwrap(), "jpg");
        assert!(placed
            .file_name()
            .unwrap()
            .to_string_lossy()
            .starts_with("msave-"));
        assert_eq!(fs::read(&placed).unwrap(), b"media bytes");
    }

    #[test]
    fn never_reuses_a_destination_name() {
        let dir = tempfile::tempdir().unwrap();
        let mut seen = std::collections::HashSet::new();
        for _ in 0..16 {
            let temp = dir.path().join("payload");
            fs::write(&temp, b"same input every time").unwrap();
            let placed = place(&temp, dir.path(), "mp4").unwrap();
            assert!(seen.insert(placed), "destination name reused");
        }
    }

    #[test]
    fn failure_cleans_up_the_temp_file() {
        let dir = tempfile::tempdir().unwrap();
        let temp = dir.path().join("payload");
        fs::write(&temp, b"x").unwrap();
        let missing_dir = dir.path().join("nope");

        let err = place(&temp, &missing_dir, "png").unwrap_err();

        assert!(matches!(err, SaveError::Storage(_)));
        assert!(!temp.exists());
    }
}
