//! Screenshot discovery in the capture gallery.

use std::path::{Path, PathBuf};
use std::time::SystemTime;

use tracing::{debug, warn};
use walkdir::WalkDir;

/// Extensions recognized as screenshots, compared case-insensitively.
pub const SCREENSHOT_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "bmp", "tiff"];

fn extension(path: &Path) -> Option<String> {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(str::to_ascii_lowercase)
}

/// Whether `path` has a screenshot extension.
pub fn is_screenshot(path: &Path) -> bool {
    extension(path).is_some_and(|ext| SCREENSHOT_EXTENSIONS.contains(&ext.as_str()))
}

/// MIME type used when uploading `path`.
pub fn mime_type(path: &Path) -> &'static str {
    match extension(path).as_deref() {
        Some("jpg" | "jpeg") => "image/jpeg",
        Some("bmp") => "image/bmp",
        Some("tiff") => "image/tiff",
        _ => "image/png",
    }
}

/// Most recently modified screenshot anywhere under `dir`.
///
/// Unreadable entries are skipped. Returns `None` when the directory does
/// not exist or holds no screenshots.
pub fn most_recent_screenshot(dir: &Path) -> Option<PathBuf> {
    if !dir.is_dir() {
        warn!(dir = %dir.display(), "Gallery directory does not exist");
        return None;
    }

    let newest = WalkDir::new(dir)
        .into_iter()
        .filter_map(|entry| match entry {
            Ok(entry) => Some(entry),
            Err(e) => {
                debug!(error = %e, "Skipping unreadable gallery entry");
                None
            }
        })
        .filter(|entry| entry.file_type().is_file() && is_screenshot(entry.path()))
        .filter_map(|entry| {
            let modified: SystemTime = entry.metadata().ok()?.modified().ok()?;
            Some((modified, entry.into_path()))
        })
        .max_by_key(|(modified, _)| *modified)
        .map(|(_, path)| path);

    match &newest {
        Some(path) => debug!(path = %path.display(), "Most recent screenshot"),
        None => warn!(dir = %dir.display(), "No screenshots found"),
    }
    newest
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use std::time::Duration;

    fn touch(path: &Path, age: Duration) {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        let file = File::create(path).unwrap();
        file.set_modified(SystemTime::now() - age).unwrap();
    }

    #[test]
    fn newest_screenshot_wins_across_subdirectories() {
        let dir = tempfile::tempdir().unwrap();
        touch(&dir.path().join("old.png"), Duration::from_secs(300));
        touch(&dir.path().join("Game/Capture.JPG"), Duration::from_secs(10));
        touch(&dir.path().join("Game/notes.txt"), Duration::from_secs(1));
        touch(&dir.path().join("older.bmp"), Duration::from_secs(600));

        let found = most_recent_screenshot(dir.path()).unwrap();
        assert_eq!(found, dir.path().join("Game/Capture.JPG"));
    }

    #[test]
    fn no_screenshots_yields_none() {
        let dir = tempfile::tempdir().unwrap();
        touch(&dir.path().join("readme.md"), Duration::ZERO);
        assert!(most_recent_screenshot(dir.path()).is_none());
        assert!(most_recent_screenshot(&dir.path().join("missing")).is_none());
    }

    #[test]
    fn extension_checks_ignore_case() {
        assert!(is_screenshot(Path::new("a/b.TIFF")));
        assert!(!is_screenshot(Path::new("a/b.gif")));
        assert!(!is_screenshot(Path::new("a/png")));
        assert_eq!(mime_type(Path::new("x.JPEG")), "image/jpeg");
        assert_eq!(mime_type(Path::new("x.png")), "image/png");
    }
}
