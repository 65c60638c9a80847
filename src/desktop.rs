//! Desktop background integration.
//!
//! Setting the wallpaper is platform specific, so it goes through a
//! user-supplied command: the image path is appended to its argv. Failures
//! are reported to the caller, which only logs them.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info};

use crate::error::{PluginError, Result};

const WALLPAPER_TIMEOUT: Duration = Duration::from_secs(15);

/// Sets the desktop background.
#[async_trait]
pub trait Wallpaper: Send + Sync {
    async fn set_background(&self, image: &Path) -> Result<()>;
}

/// Runs a command with the image path as its last argument.
#[derive(Debug, Clone)]
pub struct CommandWallpaper {
    argv: Vec<String>,
}

impl CommandWallpaper {
    pub fn new(argv: Vec<String>) -> Result<Self> {
        if argv.is_empty() {
            return Err(PluginError::config("Wallpaper command is empty"));
        }
        Ok(Self { argv })
    }
}

#[async_trait]
impl Wallpaper for CommandWallpaper {
    async fn set_background(&self, image: &Path) -> Result<()> {
        let (program, args) = self
            .argv
            .split_first()
            .ok_or_else(|| PluginError::config("Wallpaper command is empty"))?;

        let mut cmd = Command::new(program);
        cmd.args(args)
            .arg(image)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let output = tokio::time::timeout(WALLPAPER_TIMEOUT, cmd.output())
            .await
            .map_err(|_| PluginError::Container(format!("{program} timed out")))?
            .map_err(|e| PluginError::filesystem(format!("Failed to run {program}"), e))?;

        if !output.status.success() {
            return Err(PluginError::Container(format!(
                "{program} failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        info!(image = %image.display(), "Desktop background updated");
        Ok(())
    }
}

/// Used when no wallpaper command is configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoWallpaper;

#[async_trait]
impl Wallpaper for NoWallpaper {
    async fn set_background(&self, image: &Path) -> Result<()> {
        debug!(image = %image.display(), "No wallpaper command configured, skipping");
        Ok(())
    }
}
