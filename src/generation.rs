//! Background generation jobs.
//!
//! A job owns everything it needs, so it can outlive the command that
//! created it: resolve the source screenshot, submit to the backend, write
//! each returned image and hand the last one to the desktop.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{error, info, info_span, warn, Instrument};

use crate::backend::{GenerationRequest, ImageBackend, Submission};
use crate::desktop::Wallpaper;
use crate::error::{PluginError, Result};
use crate::gallery;
use crate::storage;

/// Where a job takes its conditioning image from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceSelection {
    None,
    /// Newest screenshot under this directory, resolved when the job runs.
    MostRecentIn(PathBuf),
}

/// What a finished job produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    Saved(Vec<PathBuf>),
    Enqueued,
}

/// One accepted generation request.
pub struct GenerationJob {
    request: GenerationRequest,
    source: SourceSelection,
    output_directory: PathBuf,
    backend: Box<dyn ImageBackend>,
    wallpaper: Arc<dyn Wallpaper>,
}

impl GenerationJob {
    pub fn new(
        request: GenerationRequest,
        source: SourceSelection,
        output_directory: PathBuf,
        backend: Box<dyn ImageBackend>,
        wallpaper: Arc<dyn Wallpaper>,
    ) -> Self {
        Self {
            request,
            source,
            output_directory,
            backend,
            wallpaper,
        }
    }

    /// Label used for task tracking.
    pub fn label(&self) -> String {
        format!("{}-{}", self.backend.kind(), self.request.id)
    }

    /// Run to completion, logging the outcome.
    pub async fn run(self) {
        let span = info_span!(
            "generation",
            request_id = %self.request.id,
            prompt = %self.request.prompt,
            backend = %self.backend.kind(),
        );
        async move {
            match self.execute().await {
                Ok(JobOutcome::Saved(paths)) => {
                    info!(count = paths.len(), "Generation finished");
                }
                Ok(JobOutcome::Enqueued) => info!("Generation handed to backend queue"),
                Err(e) => error!(error = %e, "Generation failed"),
            }
        }
        .instrument(span)
        .await;
    }

    /// Same as [`run`](Self::run) but returns the outcome.
    pub async fn execute(mut self) -> Result<JobOutcome> {
        if let SourceSelection::MostRecentIn(dir) = &self.source {
            let image = resolve_screenshot(dir.clone()).await?;
            info!(source = %image.display(), "Using screenshot");
            self.request.source_image = Some(image);
        }

        let artifacts = match self.backend.submit(&self.request).await? {
            Submission::Enqueued => return Ok(JobOutcome::Enqueued),
            Submission::Produced(artifacts) => artifacts,
        };

        let mut saved = Vec::with_capacity(artifacts.len());
        for artifact in &artifacts {
            let path = storage::persist(&self.output_directory, artifact).await?;
            info!(path = %path.display(), bytes = artifact.bytes.len(), "Image saved");
            saved.push(path);
        }

        if let Some(last) = saved.last() {
            if let Err(e) = self.wallpaper.set_background(last).await {
                warn!(error = %e, "Failed to set desktop background");
            }
        }
        Ok(JobOutcome::Saved(saved))
    }
}

async fn resolve_screenshot(dir: PathBuf) -> Result<PathBuf> {
    let found = tokio::task::spawn_blocking({
        let dir = dir.clone();
        move || gallery::most_recent_screenshot(&dir)
    })
    .await?;
    found.ok_or_else(|| no_screenshot(&dir))
}

fn no_screenshot(dir: &Path) -> PluginError {
    PluginError::config(format!(
        "No screenshot files found in directory or subdirectories: {}",
        dir.display()
    ))
}
