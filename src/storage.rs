//! Output directory handling and artifact persistence.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

use crate::backend::Artifact;
use crate::error::{PluginError, Result};

const PROBE_FILE: &str = ".test_write_permission";
const MAX_NAME_ATTEMPTS: usize = 1000;

/// Create `dir` if needed and verify it accepts writes.
pub fn probe_output_directory(dir: &Path) -> Result<()> {
    std::fs::create_dir_all(dir).map_err(|e| {
        PluginError::filesystem(format!("Cannot create output directory {}", dir.display()), e)
    })?;
    let probe = dir.join(PROBE_FILE);
    std::fs::write(&probe, b"test").map_err(|e| {
        PluginError::filesystem(format!("Output directory {} is not writable", dir.display()), e)
    })?;
    std::fs::remove_file(&probe)
        .map_err(|e| PluginError::filesystem(format!("Cannot remove {}", probe.display()), e))?;
    Ok(())
}

/// Create `dir` if needed.
///
/// The error message is the one shown to the host.
pub fn ensure_output_directory(dir: &Path) -> Result<()> {
    std::fs::create_dir_all(dir).map_err(|e| {
        PluginError::config(format!(
            "Failed to create output directory '{}': {e}. Please check the path and permissions.",
            dir.display()
        ))
    })
}

/// Base file name for `artifact`: `{stem}_{YYYYMMDD_HHMMSS}[_{seq}]`.
pub fn base_name(artifact: &Artifact) -> String {
    let stamp = artifact.timestamp.format("%Y%m%d_%H%M%S");
    match artifact.sequence {
        Some(seq) => format!("{}_{stamp}_{seq}", artifact.file_stem),
        None => format!("{}_{stamp}", artifact.file_stem),
    }
}

/// Write `artifact` under `dir` as PNG and return the path.
///
/// Files are created exclusively. When the timestamped name is taken (two
/// jobs finishing in the same second) a numeric suffix is added, so an
/// existing file is never overwritten.
pub async fn persist(dir: &Path, artifact: &Artifact) -> Result<PathBuf> {
    fs::create_dir_all(dir).await.map_err(|e| {
        PluginError::filesystem(format!("Cannot create output directory {}", dir.display()), e)
    })?;

    let base = base_name(artifact);
    for attempt in 0..MAX_NAME_ATTEMPTS {
        let name = if attempt == 0 {
            format!("{base}.png")
        } else {
            format!("{base}-{attempt}.png")
        };
        let path = dir.join(name);

        let mut file = match OpenOptions::new().write(true).create_new(true).open(&path).await {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                debug!(path = %path.display(), "Name taken, trying next");
                continue;
            }
            Err(e) => {
                return Err(PluginError::filesystem(
                    format!("Cannot create {}", path.display()),
                    e,
                ))
            }
        };

        file.write_all(&artifact.bytes)
            .await
            .map_err(|e| PluginError::filesystem(format!("Cannot write {}", path.display()), e))?;
        file.flush()
            .await
            .map_err(|e| PluginError::filesystem(format!("Cannot write {}", path.display()), e))?;

        info!(path = %path.display(), bytes = artifact.bytes.len(), "Image saved");
        return Ok(path);
    }

    Err(PluginError::filesystem(
        format!("No free file name for {base} in {}", dir.display()),
        std::io::Error::from(ErrorKind::AlreadyExists),
    ))
}
