// src/pathres.rs
//
// Maps a request target to a filesystem path. No traversal
// sanitization is performed — a target like `/../../etc/passwd` resolves
// exactly as written. That is a known, flagged risk (see DESIGN.md), not
// something this module silently guards against.

use crate::config::{INDEX_FILE, ROOT_DIR, UPLOAD_SUBDIR};

/// Length the upload prefix check uses. One source variant checks 9 bytes
/// (`strncmp(path, "/upload", 9)`), which also demands the next two bytes
/// match — a bug, since `"/upload"` itself is 7 bytes. This resolver checks
/// the intended 7.
const UPLOAD_PREFIX: &str = "/upload";

/// Resolve a GET target to an absolute path under `ROOT_DIR`. `"/"` maps
/// to the configured index file; anything else is appended verbatim.
pub fn resolve_get(target: &str) -> String {
    if target == "/" {
        format!("{}/{}", ROOT_DIR, INDEX_FILE)
    } else {
        format!("{}{}", ROOT_DIR, target)
    }
}

/// Resolve a PUT target. Returns `None` if the target does not begin with
/// `/upload`, which the caller must turn into a 400 before opening any file.
pub fn resolve_put(target: &str) -> Option<String> {
    if !target.starts_with(UPLOAD_PREFIX) {
        return None;
    }
    let suffix = &target[UPLOAD_PREFIX.len()..];
    Some(format!("{}/{}{}", ROOT_DIR, UPLOAD_SUBDIR, suffix))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn root_maps_to_index_file() {
        assert_eq!(resolve_get("/"), format!("{}/{}", ROOT_DIR, INDEX_FILE));
    }

    #[test]
    fn get_target_is_appended_verbatim() {
        assert_eq!(resolve_get("/foo/bar.txt"), format!("{}/foo/bar.txt", ROOT_DIR));
    }

    #[test]
    fn get_performs_no_traversal_sanitization() {
        assert_eq!(resolve_get("/../etc/passwd"), format!("{}/../etc/passwd", ROOT_DIR));
    }

    #[test]
    fn put_under_upload_resolves() {
        assert_eq!(
            resolve_put("/upload/file.bin"),
            Some(format!("{}/{}/file.bin", ROOT_DIR, UPLOAD_SUBDIR))
        );
    }

    #[test]
    fn put_exact_prefix_with_no_suffix_resolves_to_uploads_dir() {
        assert_eq!(
            resolve_put("/upload"),
            Some(format!("{}/{}", ROOT_DIR, UPLOAD_SUBDIR))
        );
    }

    #[test]
    fn put_outside_upload_is_rejected() {
        assert_eq!(resolve_put("/etc/passwd"), None);
    }

    #[test]
    fn put_prefix_match_does_not_require_following_slash() {
        // "/uploadxyz" begins with "/upload" (7 bytes); the 7-byte check is
        // the intended behavior, not the 9-byte `strncmp` variant.
        assert_eq!(
            resolve_put("/uploadxyz"),
            Some(format!("{}/{}xyz", ROOT_DIR, UPLOAD_SUBDIR))
        );
    }
}
