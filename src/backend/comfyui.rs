//! ComfyUI backend.
//!
//! Uploads a normalized copy of the screenshot, queues the bundled Flux
//! Kontext workflow under a fresh client id and follows execution over the
//! websocket until the save node finishes.

use std::path::Path;
use std::sync::OnceLock;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use reqwest::multipart::{Form, Part};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use super::{Artifact, BackendKind, GenerationRequest, ImageBackend, Submission};
use crate::config::Config;
use crate::error::{PluginError, Result};
use crate::http::{self, CONTROL_TIMEOUT, ENQUEUE_TIMEOUT, HEALTH_TIMEOUT, MAINTENANCE_TIMEOUT, TRANSFER_TIMEOUT};
use crate::image_prep::{self, KONTEXT_HEIGHT, KONTEXT_WIDTH};
use crate::monitor::{
    EventStream, ExecutionMonitor, ExecutionSession, ImageRef, MonitorSettings, ResultStore,
    StreamMessage, StreamRead, DEFAULT_TERMINAL_NODE,
};
use crate::workflow::{PatchSet, PatchedWorkflow, WorkflowTemplate};

const KONTEXT_WORKFLOW: &str = include_str!("../../workflows/comfyui_flux_kontext.json");
static KONTEXT_TEMPLATE: OnceLock<WorkflowTemplate> = OnceLock::new();

const PROMPT_CLASS: &str = "NIMFLUXNode";
const IMAGE_CLASS: &str = "LoadImage";
const SAVE_CLASS: &str = "SaveImage";

/// Display name used in user-facing messages.
pub const SERVICE: &str = "ComfyUI";

const GIB: f64 = 1024.0 * 1024.0 * 1024.0;

#[derive(Debug, Deserialize)]
struct UploadResponse {
    name: Option<String>,
}

#[derive(Debug, Serialize)]
struct QueuePrompt<'a, 'w> {
    prompt: &'a PatchedWorkflow<'w>,
    client_id: String,
}

#[derive(Debug, Serialize)]
struct FreeRequest {
    unload_models: bool,
    free_memory: bool,
}

/// `/system_stats` body.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SystemStats {
    #[serde(default)]
    pub system: SystemInfo,
    #[serde(default)]
    pub devices: Vec<DeviceInfo>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SystemInfo {
    pub comfyui_version: Option<String>,
    pub python_version: Option<String>,
    pub pytorch_version: Option<String>,
    pub ram_total: Option<f64>,
    pub ram_free: Option<f64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct DeviceInfo {
    pub name: Option<String>,
    pub vram_total: Option<f64>,
    pub vram_free: Option<f64>,
}

fn memory_line(label: &str, total: f64, free: f64) -> String {
    format!(
        "{label}: {:.1} / {:.1} GB (Free: {:.1} GB)",
        (total - free) / GIB,
        total / GIB,
        free / GIB
    )
}

impl SystemStats {
    /// Multi-line status report, one fact per line.
    pub fn summary(&self) -> String {
        let mut lines = vec!["ComfyUI service is running and responding.".to_string()];
        let system = &self.system;

        if let Some(version) = &system.comfyui_version {
            lines.push(format!("Version: {version}"));
        }
        if let Some(python) = &system.python_version {
            lines.push(format!("Python: {}", python.split_whitespace().next().unwrap_or_default()));
        }
        if let Some(torch) = &system.pytorch_version {
            lines.push(format!("PyTorch: {}", torch.split('+').next().unwrap_or_default()));
        }
        if let (Some(total), Some(free)) = (system.ram_total, system.ram_free) {
            lines.push(memory_line("RAM", total, free));
        }

        if let Some(device) = self.devices.first() {
            if let (Some(total), Some(free)) = (device.vram_total, device.vram_free) {
                lines.push(memory_line("VRAM", total, free));
            }
            if let Some(name) = &device.name {
                let name = name.split(':').nth(1).map_or(name.as_str(), str::trim);
                lines.push(format!("GPU: {name}"));
            }
        }
        lines.join("\n")
    }
}

/// Message for a successful `/free` call.
pub fn free_summary(unload_models: bool, free_memory: bool) -> String {
    let actions: Vec<&str> = [(unload_models, "unload models"), (free_memory, "free memory")]
        .into_iter()
        .filter_map(|(on, action)| on.then_some(action))
        .collect();
    if actions.is_empty() {
        "ComfyUI free endpoint called successfully (no actions requested)".into()
    } else {
        format!("ComfyUI has been instructed to {} successfully", actions.join(" and "))
    }
}

/// REST and websocket client for one ComfyUI server and client id.
#[derive(Debug, Clone)]
pub struct ComfyClient {
    http: reqwest::Client,
    base_url: String,
    client_id: Uuid,
}

impl ComfyClient {
    pub fn new(http: reqwest::Client, base_url: &str, client_id: Uuid) -> Self {
        Self {
            http,
            base_url: http::normalize_base(base_url),
            client_id,
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub const fn client_id(&self) -> Uuid {
        self.client_id
    }

    /// Upload `path` to the input folder and return its server-side name.
    pub async fn upload_image(&self, path: &Path) -> Result<String> {
        let bytes = tokio::fs::read(path)
            .await
            .map_err(|e| PluginError::filesystem(format!("Cannot read {}", path.display()), e))?;
        let file_name = path
            .file_name()
            .map_or_else(|| "image.png".into(), |n| n.to_string_lossy().into_owned());

        let part = Part::bytes(bytes)
            .file_name(file_name)
            .mime_str("image/png")
            .map_err(|e| PluginError::network("Invalid upload MIME type", e))?;
        let request = self
            .http
            .post(format!("{}/upload/image", self.base_url))
            .multipart(Form::new().part("image", part));
        let response: UploadResponse =
            http::send_json(request, TRANSFER_TIMEOUT, "ComfyUI image upload").await?;

        response
            .name
            .ok_or_else(|| PluginError::protocol("ComfyUI upload response has no name"))
    }

    /// Queue a workflow and return its prompt id.
    pub async fn queue_prompt(&self, workflow: &PatchedWorkflow<'_>) -> Result<String> {
        let body = QueuePrompt {
            prompt: workflow,
            client_id: self.client_id.to_string(),
        };
        let request = self.http.post(format!("{}/prompt", self.base_url)).json(&body);
        let response: Value = http::send_json(request, ENQUEUE_TIMEOUT, "ComfyUI API request").await?;

        if let Some(errors) = response.get("node_errors").and_then(Value::as_object) {
            if !errors.is_empty() {
                return Err(PluginError::protocol(format!(
                    "ComfyUI rejected the workflow: {}",
                    Value::Object(errors.clone())
                )));
            }
        }

        response
            .get("prompt_id")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| PluginError::protocol("No prompt_id received from ComfyUI"))
    }

    /// `ws://host/ws?clientId=...` for this client.
    pub fn events_url(&self) -> String {
        let ws_base = if let Some(rest) = self.base_url.strip_prefix("https://") {
            format!("wss://{rest}")
        } else if let Some(rest) = self.base_url.strip_prefix("http://") {
            format!("ws://{rest}")
        } else {
            self.base_url.clone()
        };
        format!("{ws_base}/ws?clientId={}", self.client_id)
    }

    /// Open the execution event stream.
    pub async fn connect_events(&self) -> Result<WsEventStream> {
        let url = self.events_url();
        debug!(%url, "Connecting to ComfyUI websocket");
        let (socket, _) = tokio::time::timeout(CONTROL_TIMEOUT, tokio_tungstenite::connect_async(url.as_str()))
            .await
            .map_err(|_| PluginError::protocol(format!("Timed out connecting to {url}")))?
            .map_err(|e| PluginError::protocol(format!("WebSocket connection to {url} failed: {e}")))?;
        Ok(WsEventStream { socket })
    }

    /// `GET /` liveness check.
    pub async fn ping_root(&self) -> Result<()> {
        let request = self.http.get(&self.base_url);
        http::send(request, CONTROL_TIMEOUT, "ComfyUI request").await?;
        Ok(())
    }

    pub async fn system_stats(&self) -> Result<SystemStats> {
        let request = self.http.get(format!("{}/system_stats", self.base_url));
        http::send_json(request, HEALTH_TIMEOUT, "ComfyUI request").await
    }

    pub async fn free_memory(&self, unload_models: bool, free_memory: bool) -> Result<()> {
        let request = self
            .http
            .post(format!("{}/free", self.base_url))
            .json(&FreeRequest {
                unload_models,
                free_memory,
            });
        http::send(request, MAINTENANCE_TIMEOUT, "ComfyUI free endpoint request").await?;
        Ok(())
    }
}

#[async_trait]
impl ResultStore for ComfyClient {
    async fn history_images(&self, prompt_id: &str, node_id: &str) -> Result<Option<Vec<ImageRef>>> {
        let request = self.http.get(format!("{}/history/{prompt_id}", self.base_url));
        let history: Value = http::send_json(request, TRANSFER_TIMEOUT, "ComfyUI history request").await?;

        let Some(entry) = history.get(prompt_id) else {
            return Ok(None);
        };
        let images = entry
            .pointer(&format!("/outputs/{node_id}/images"))
            .map(ImageRef::list)
            .unwrap_or_default();
        Ok(Some(images))
    }

    async fn fetch_image(&self, image: &ImageRef) -> Result<Vec<u8>> {
        let url = reqwest::Url::parse_with_params(
            &format!("{}/view", self.base_url),
            &[
                ("filename", image.filename.as_str()),
                ("type", image.kind.as_str()),
                ("subfolder", image.subfolder.as_str()),
            ],
        )
        .map_err(|e| PluginError::protocol(format!("Bad image URL: {e}")))?;
        http::send_bytes(self.http.get(url), TRANSFER_TIMEOUT, "ComfyUI image download").await
    }
}

/// Execution events from ComfyUI's websocket.
pub struct WsEventStream {
    socket: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

#[async_trait]
impl EventStream for WsEventStream {
    async fn next_message(&mut self, timeout: Duration) -> StreamRead {
        match tokio::time::timeout(timeout, self.socket.next()).await {
            Err(_) => StreamRead::Idle,
            Ok(None) | Ok(Some(Ok(Message::Close(_)))) => StreamRead::Closed,
            Ok(Some(Ok(Message::Text(text)))) => StreamRead::Message(StreamMessage::Text(text)),
            Ok(Some(Ok(Message::Binary(bytes)))) => StreamRead::Message(StreamMessage::Binary(bytes)),
            Ok(Some(Ok(_))) => StreamRead::Idle,
            Ok(Some(Err(e))) => StreamRead::Failed(e.to_string()),
        }
    }

    async fn close(&mut self) {
        if let Err(e) = self.socket.send(Message::Close(None)).await {
            debug!(error = %e, "WebSocket close failed");
        }
    }
}

/// The bundled Flux Kontext workflow.
pub fn kontext_template() -> Result<&'static WorkflowTemplate> {
    WorkflowTemplate::cached(&KONTEXT_TEMPLATE, "ComfyUI Flux Kontext", KONTEXT_WORKFLOW)
}

fn node_of(template: &WorkflowTemplate, class_type: &str) -> Result<String> {
    template.node_by_class(class_type).map(str::to_string).ok_or_else(|| {
        PluginError::protocol(format!(
            "{} workflow has no {class_type} node",
            template.name()
        ))
    })
}

/// Patch prompt, step count and input image into the workflow.
pub fn kontext_workflow(prompt: &str, image_name: &str, steps: u32) -> Result<PatchedWorkflow<'static>> {
    let template = kontext_template()?;
    let flux = node_of(template, PROMPT_CLASS)?;
    let loader = node_of(template, IMAGE_CLASS)?;
    template.apply(
        PatchSet::new()
            .set([flux.as_str(), "inputs", "prompt"], prompt)
            .set([flux.as_str(), "inputs", "steps"], steps)
            .set([loader.as_str(), "inputs", "image"], image_name),
    )
}

/// Node whose completion ends the session.
pub fn terminal_node() -> String {
    kontext_template()
        .ok()
        .and_then(|template| template.node_by_class(SAVE_CLASS))
        .unwrap_or(DEFAULT_TERMINAL_NODE)
        .to_string()
}

/// Streaming-graph backend.
#[derive(Debug, Clone)]
pub struct ComfyBackend {
    http: reqwest::Client,
    base_url: String,
    monitor: MonitorSettings,
}

impl ComfyBackend {
    pub fn from_config(config: &Config, http: reqwest::Client, monitor: MonitorSettings) -> Result<Self> {
        let url = config.comfyui_url().ok_or_else(|| {
            PluginError::config(
                "FLUX_KONTEXT_INFERENCE_BACKEND is set to 'COMFYUI' but COMFYUI_URL is not configured. Please set COMFYUI_URL in config.json",
            )
        })?;
        Ok(Self {
            http,
            base_url: http::normalize_base(url),
            monitor,
        })
    }
}

#[async_trait]
impl ImageBackend for ComfyBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::StreamingGraph
    }

    #[instrument(skip_all, fields(request_id = %request.id, url = %self.base_url))]
    async fn submit(&self, request: &GenerationRequest) -> Result<Submission> {
        let source = request
            .source_image
            .clone()
            .ok_or_else(|| PluginError::config("No source image provided for ComfyUI"))?;
        let client = ComfyClient::new(self.http.clone(), &self.base_url, Uuid::new_v4());

        // Removed from disk when dropped
        let normalized = tokio::task::spawn_blocking(move || {
            image_prep::png_temp_file(&source, KONTEXT_WIDTH, KONTEXT_HEIGHT)
        })
        .await??;

        let image_name = client.upload_image(&normalized).await?;
        info!(%image_name, "Uploaded source image");

        let workflow = kontext_workflow(&request.prompt, &image_name, request.steps)?;
        let prompt_id = client.queue_prompt(&workflow).await?;
        info!(%prompt_id, client_id = %client.client_id(), "Workflow queued");

        let mut session = ExecutionSession::new(
            client.client_id(),
            prompt_id,
            terminal_node(),
            self.monitor.deadline,
        );
        let stream = client.connect_events().await;
        let resolution = ExecutionMonitor::new(&client, self.monitor.clone())
            .run(&mut session, stream)
            .await;
        info!(
            state = ?resolution.state,
            source = ?resolution.source,
            images = resolution.images.len(),
            "Execution resolved"
        );
        if let Some(error) = &resolution.error {
            warn!(%error, "Execution reported an error");
        }

        let artifacts = resolution
            .into_images()?
            .into_iter()
            .enumerate()
            .map(|(i, bytes)| {
                Artifact::new(bytes, BackendKind::StreamingGraph, "comfyui_flux_kontext").with_sequence(i)
            })
            .collect();
        drop(normalized);
        Ok(Submission::Produced(artifacts))
    }
}
