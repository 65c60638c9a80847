//! InvokeAI backend.
//!
//! Uploads the screenshot, patches the bundled Flux Kontext batch and
//! enqueues it. InvokeAI stores the result itself, so success here means the
//! batch was accepted into the queue.

use std::path::Path;
use std::sync::OnceLock;

use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, info, instrument};

use super::{BackendKind, GenerationRequest, ImageBackend, Submission};
use crate::config::Config;
use crate::error::{PluginError, Result};
use crate::gallery;
use crate::http::{self, CONTROL_TIMEOUT, ENQUEUE_TIMEOUT, MAINTENANCE_TIMEOUT, TRANSFER_TIMEOUT};
use crate::workflow::{PatchSet, PatchedWorkflow, WorkflowTemplate};

const KONTEXT_BATCH: &str = include_str!("../../workflows/invokeai_flux_kontext.json");
static KONTEXT_TEMPLATE: OnceLock<WorkflowTemplate> = OnceLock::new();

const PROMPT_NODE: &str = "positive_prompt:0oQdkhpu9K";
const KONTEXT_NODE: &str = "flux_kontext:MsQ9ynwazR";
const DENOISE_NODE: &str = "flux_denoise:9SHZg1d4kC";
const METADATA_NODE: &str = "core_metadata:oCIejDlaQA";

/// Display name used in user-facing messages.
pub const SERVICE: &str = "InvokeAI";

#[derive(Debug, Deserialize)]
struct UploadResponse {
    image_name: Option<String>,
}

/// `/api/v1/app/version` body.
#[derive(Debug, Clone, Deserialize)]
pub struct AppVersion {
    #[serde(default = "unknown")]
    pub version: String,
    #[serde(default)]
    pub highlights: Vec<String>,
}

fn unknown() -> String {
    "Unknown".into()
}

impl AppVersion {
    pub fn summary(&self) -> String {
        let mut message = format!("InvokeAI service is running. Version: {}", self.version);
        if !self.highlights.is_empty() {
            message.push_str("\nHighlights: ");
            message.push_str(&self.highlights.join(", "));
        }
        message
    }
}

/// REST client for one InvokeAI server.
#[derive(Debug, Clone)]
pub struct InvokeAiClient {
    http: reqwest::Client,
    base_url: String,
}

impl InvokeAiClient {
    pub fn new(http: reqwest::Client, base_url: &str) -> Self {
        Self {
            http,
            base_url: http::normalize_base(base_url),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Upload `path` as a user image and return its server-side name.
    pub async fn upload_image(&self, path: &Path, board_id: Option<&str>) -> Result<String> {
        let bytes = tokio::fs::read(path)
            .await
            .map_err(|e| PluginError::filesystem(format!("Cannot read {}", path.display()), e))?;
        let file_name = path
            .file_name()
            .map_or_else(|| "image.png".into(), |n| n.to_string_lossy().into_owned());

        let part = Part::bytes(bytes)
            .file_name(file_name)
            .mime_str(gallery::mime_type(path))
            .map_err(|e| PluginError::network("Invalid upload MIME type", e))?;
        let form = Form::new().part("file", part);

        let mut query = vec![
            ("image_category", "user"),
            ("is_intermediate", "false"),
            ("crop_visible", "false"),
        ];
        if let Some(board) = board_id {
            query.push(("board_id", board));
        }

        let request = self
            .http
            .post(format!("{}/api/v1/images/upload", self.base_url))
            .header(reqwest::header::ACCEPT, "application/json")
            .query(&query)
            .multipart(form);
        let response: UploadResponse =
            http::send_json(request, TRANSFER_TIMEOUT, "InvokeAI image upload").await?;

        response
            .image_name
            .ok_or_else(|| PluginError::protocol("InvokeAI upload response has no image_name"))
    }

    /// Enqueue a batch on the default queue.
    pub async fn enqueue_batch(&self, batch: &PatchedWorkflow<'_>) -> Result<Value> {
        let request = self
            .http
            .post(format!("{}/api/v1/queue/default/enqueue_batch", self.base_url))
            .header(reqwest::header::ACCEPT, "application/json")
            .json(batch);
        http::send_json(request, ENQUEUE_TIMEOUT, "InvokeAI API request").await
    }

    pub async fn version(&self) -> Result<AppVersion> {
        let request = self.http.get(format!("{}/api/v1/app/version", self.base_url));
        http::send_json(request, CONTROL_TIMEOUT, "InvokeAI API request").await
    }

    pub async fn pause_processor(&self) -> Result<()> {
        self.processor("pause").await
    }

    pub async fn resume_processor(&self) -> Result<()> {
        self.processor("resume").await
    }

    async fn processor(&self, action: &str) -> Result<()> {
        let request = self
            .http
            .put(format!("{}/api/v1/queue/default/processor/{action}", self.base_url));
        http::send(request, CONTROL_TIMEOUT, "InvokeAI API request").await?;
        Ok(())
    }

    /// Release models held in VRAM.
    pub async fn empty_model_cache(&self) -> Result<()> {
        let request = self
            .http
            .post(format!("{}/api/v2/models/empty_model_cache", self.base_url));
        http::send(request, MAINTENANCE_TIMEOUT, "InvokeAI API request").await?;
        Ok(())
    }
}

/// The bundled Flux Kontext batch.
pub fn kontext_template() -> Result<&'static WorkflowTemplate> {
    WorkflowTemplate::cached(&KONTEXT_TEMPLATE, "InvokeAI Flux Kontext", KONTEXT_BATCH)
}

/// Patch prompt, conditioning image and step count into the batch.
pub fn kontext_batch(prompt: &str, image_name: &str, steps: u32) -> Result<PatchedWorkflow<'static>> {
    let node = |id: &'static str, field: &'static str| ["batch", "graph", "nodes", id, field];
    kontext_template()?.apply(
        PatchSet::new()
            .set(node(PROMPT_NODE, "value"), prompt)
            .set(
                ["batch", "graph", "nodes", KONTEXT_NODE, "image", "image_name"],
                image_name,
            )
            .set(node(DENOISE_NODE, "num_steps"), steps)
            .set(node(METADATA_NODE, "steps"), steps),
    )
}

/// Queued-graph backend.
#[derive(Debug, Clone)]
pub struct InvokeAiBackend {
    client: InvokeAiClient,
    board_id: Option<String>,
}

impl InvokeAiBackend {
    pub fn from_config(config: &Config, http: reqwest::Client) -> Result<Self> {
        let url = config.invokeai_url().ok_or_else(|| {
            PluginError::config(
                "FLUX_KONTEXT_INFERENCE_BACKEND is set to 'INVOKEAI' but INVOKEAI_URL is not configured. Please set INVOKEAI_URL in config.json",
            )
        })?;
        Ok(Self {
            client: InvokeAiClient::new(http, url),
            board_id: config.board_id().map(str::to_string),
        })
    }
}

#[async_trait]
impl ImageBackend for InvokeAiBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::QueuedGraph
    }

    #[instrument(skip_all, fields(request_id = %request.id, url = %self.client.base_url()))]
    async fn submit(&self, request: &GenerationRequest) -> Result<Submission> {
        let source = request
            .source_image
            .as_deref()
            .ok_or_else(|| PluginError::config("No source image provided for InvokeAI"))?;

        let image_name = self
            .client
            .upload_image(source, self.board_id.as_deref())
            .await?;
        info!(%image_name, "Uploaded source image");

        let batch = kontext_batch(&request.prompt, &image_name, request.steps)?;
        let response = self.client.enqueue_batch(&batch).await?;
        debug!(
            enqueued = ?response.get("enqueued"),
            batch_id = ?response.pointer("/batch/batch_id"),
            "Batch accepted"
        );
        info!("Flux Kontext batch submitted to InvokeAI queue");
        Ok(Submission::Enqueued)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn bundled_batch_patches_prompt_image_and_steps() {
        let batch = kontext_batch("turn it into porcelain", "upload-42.png", 35).unwrap();
        let value = batch.to_value().unwrap();
        let nodes = &value["batch"]["graph"]["nodes"];

        assert_eq!(nodes[PROMPT_NODE]["value"], "turn it into porcelain");
        assert_eq!(nodes[KONTEXT_NODE]["image"]["image_name"], "upload-42.png");
        assert_eq!(nodes[DENOISE_NODE]["num_steps"], 35);
        assert_eq!(nodes[METADATA_NODE]["steps"], 35);
        // Untouched structure survives
        assert_eq!(value["queue_id"], "default");
        assert_eq!(
            value["batch"]["graph"]["edges"],
            kontext_template().unwrap().graph()["batch"]["graph"]["edges"]
        );
    }

    #[test]
    fn patching_leaves_bundled_template_pristine() {
        let template = kontext_template().unwrap();
        let before = template.graph()["batch"]["graph"]["nodes"][PROMPT_NODE]["value"].clone();
        let _ = kontext_batch("something else", "x.png", 20).unwrap();
        assert_eq!(
            template.graph()["batch"]["graph"]["nodes"][PROMPT_NODE]["value"],
            before
        );
    }

    #[test]
    fn version_summary_lists_highlights() {
        let version: AppVersion =
            serde_json::from_value(json!({"version": "5.6.0", "highlights": ["a", "b"]})).unwrap();
        assert_eq!(
            version.summary(),
            "InvokeAI service is running. Version: 5.6.0\nHighlights: a, b"
        );

        let bare: AppVersion = serde_json::from_value(json!({})).unwrap();
        assert_eq!(bare.summary(), "InvokeAI service is running. Version: Unknown");
    }

    #[test]
    fn missing_url_is_configuration_error() {
        let config = Config::from_json(r#"{"INVOKEAI_URL": "  "}"#).unwrap();
        let err = InvokeAiBackend::from_config(&config, reqwest::Client::new()).unwrap_err();
        assert!(err.to_string().contains("INVOKEAI_URL is not configured"));
    }
}
