//! Image-generation backends.
//!
//! Each backend turns a [`GenerationRequest`] into either finished artifacts
//! or an accepted queue entry. Construction validates the configuration the
//! backend needs, so a backend that exists is ready to submit.

pub mod comfyui;
pub mod invokeai;
pub mod nim;

pub use comfyui::{ComfyBackend, ComfyClient};
pub use invokeai::{InvokeAiBackend, InvokeAiClient};
pub use nim::{NimBackend, NimClient};

use std::fmt;
use std::path::PathBuf;

use async_trait::async_trait;
use chrono::{DateTime, Local};
use uuid::Uuid;

use crate::config::Config;
use crate::error::Result;
use crate::monitor::MonitorSettings;

/// Completion model of a backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackendKind {
    /// NIM: one synchronous POST, artifact inline in the response.
    DirectInfer,
    /// InvokeAI: enqueue a graph and walk away.
    QueuedGraph,
    /// ComfyUI: enqueue a graph and follow its event stream.
    StreamingGraph,
}

impl BackendKind {
    /// Name used in user-facing acknowledgments for conditioned generation.
    pub const fn kontext_label(self) -> &'static str {
        match self {
            Self::DirectInfer => "Flux Kontext NIM",
            Self::QueuedGraph => "InvokeAI Flux Kontext",
            Self::StreamingGraph => "ComfyUI Flux Kontext",
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::DirectInfer => "nim",
            Self::QueuedGraph => "invokeai",
            Self::StreamingGraph => "comfyui",
        };
        f.write_str(name)
    }
}

/// One generation request, owned by its background job.
#[derive(Debug, Clone)]
pub struct GenerationRequest {
    /// Correlation id carried through logs.
    pub id: Uuid,
    pub prompt: String,
    pub steps: u32,
    /// Conditioning image, when the backend takes one.
    pub source_image: Option<PathBuf>,
    pub backend: BackendKind,
}

impl GenerationRequest {
    pub fn new(prompt: impl Into<String>, steps: u32, backend: BackendKind) -> Self {
        Self {
            id: Uuid::new_v4(),
            prompt: prompt.into(),
            steps,
            source_image: None,
            backend,
        }
    }
}

/// Generated image bytes, ready to be written to the output directory.
#[derive(Debug, Clone)]
pub struct Artifact {
    pub bytes: Vec<u8>,
    pub backend: BackendKind,
    /// Leading part of the output file name, e.g. `flux_image`.
    pub file_stem: &'static str,
    /// Position within a multi-image result, appended to the file name.
    pub sequence: Option<usize>,
    pub timestamp: DateTime<Local>,
}

impl Artifact {
    pub fn new(bytes: Vec<u8>, backend: BackendKind, file_stem: &'static str) -> Self {
        Self {
            bytes,
            backend,
            file_stem,
            sequence: None,
            timestamp: Local::now(),
        }
    }

    #[must_use]
    pub const fn with_sequence(mut self, sequence: usize) -> Self {
        self.sequence = Some(sequence);
        self
    }
}

/// What a backend hands back once submission finishes.
#[derive(Debug)]
pub enum Submission {
    /// The backend produced images.
    Produced(Vec<Artifact>),
    /// The backend accepted the work into its own queue; nothing to persist.
    Enqueued,
}

/// Trait for image-generation backends.
#[async_trait]
pub trait ImageBackend: Send + Sync {
    fn kind(&self) -> BackendKind;

    /// Run the backend's full submission flow for one request.
    ///
    /// Called from a background job; may take minutes.
    async fn submit(&self, request: &GenerationRequest) -> Result<Submission>;
}

/// Build the backend selected for conditioned generation.
///
/// Fails with a configuration error when the backend's service URL is missing.
pub fn kontext_backend(
    kind: BackendKind,
    config: &Config,
    http: &reqwest::Client,
    monitor: &MonitorSettings,
) -> Result<Box<dyn ImageBackend>> {
    let backend: Box<dyn ImageBackend> = match kind {
        BackendKind::DirectInfer => Box::new(NimBackend::kontext(config, http.clone())?),
        BackendKind::QueuedGraph => Box::new(InvokeAiBackend::from_config(config, http.clone())?),
        BackendKind::StreamingGraph => Box::new(ComfyBackend::from_config(
            config,
            http.clone(),
            monitor.clone(),
        )?),
    };
    Ok(backend)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::PluginError;

    #[test]
    fn missing_service_url_fails_selection() {
        let config = Config::from_json(
            r#"{"INVOKEAI_URL": "", "COMFYUI_URL": "", "FLUX_KONTEXT_NIM_URL": ""}"#,
        )
        .unwrap();
        let http = reqwest::Client::new();
        let monitor = MonitorSettings::default();

        for (kind, key) in [
            (BackendKind::DirectInfer, "FLUX_KONTEXT_NIM_URL"),
            (BackendKind::QueuedGraph, "INVOKEAI_URL"),
            (BackendKind::StreamingGraph, "COMFYUI_URL"),
        ] {
            let Err(err) = kontext_backend(kind, &config, &http, &monitor) else {
                panic!("{kind} should fail without a URL");
            };
            assert!(matches!(err, PluginError::Configuration(_)));
            assert!(err.to_string().contains(key), "{err}");
        }
    }

    #[test]
    fn selection_returns_requested_kind() {
        let config = Config::default();
        let http = reqwest::Client::new();
        let backend =
            kontext_backend(BackendKind::StreamingGraph, &config, &http, &MonitorSettings::default())
                .unwrap();
        assert_eq!(backend.kind(), BackendKind::StreamingGraph);
    }

    #[test]
    fn artifact_sequence() {
        let artifact = Artifact::new(vec![1, 2], BackendKind::StreamingGraph, "comfyui_flux_kontext")
            .with_sequence(2);
        assert_eq!(artifact.sequence, Some(2));
        assert_eq!(artifact.backend.to_string(), "comfyui");
    }
}
