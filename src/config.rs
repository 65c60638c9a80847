//! Configuration snapshot loaded from the host's `config.json`.
//!
//! The file is re-read at the start of every command. Each read produces an
//! immutable [`Config`] that is handed down the call chain and captured by
//! background jobs, so a reload never changes values under a running job.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use tracing::{debug, error, warn};

use crate::backend::BackendKind;
use crate::error::{PluginError, Result};

/// Hosted FLUX.1-dev endpoint. Used verbatim, no `/v1/infer` suffix.
pub const HOSTED_FLUX_NIM_URL: &str =
    "https://ai.api.nvidia.com/v1/genai/black-forest-labs/flux.1-dev";

const HOSTED_NIM_PREFIX: &str = "https://ai.api.nvidia.com";

/// Environment variable that overrides the config file location.
pub const CONFIG_PATH_ENV: &str = "FLUX_PLUGIN_CONFIG";

/// Top-level plugin configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct Config {
    /// Directory scanned (recursively) for the most recent screenshot.
    #[serde(default)]
    pub gallery_directory: Option<PathBuf>,

    /// Key for the hosted NIM endpoint (`nvapi-...`).
    #[serde(default)]
    pub nvidia_api_key: Option<String>,

    /// NGC key passed to locally started NIM containers.
    #[serde(default)]
    pub ngc_api_key: Option<String>,

    /// Hugging Face token passed to locally started NIM containers.
    #[serde(default)]
    pub hf_token: Option<String>,

    /// Host path mounted as the NIM model cache.
    #[serde(default)]
    pub local_nim_cache: Option<String>,

    /// Where generated images are written.
    #[serde(default = "default_output_directory")]
    pub output_directory: PathBuf,

    #[serde(default = "default_flux_nim_url")]
    pub flux_nim_url: Option<String>,

    #[serde(default = "default_invokeai_url")]
    pub invokeai_url: Option<String>,

    #[serde(default = "default_flux_kontext_nim_url")]
    pub flux_kontext_nim_url: Option<String>,

    #[serde(default = "default_comfyui_url")]
    pub comfyui_url: Option<String>,

    /// Backend used by `generate_image_using_kontext`: NIM, INVOKEAI or COMFYUI.
    #[serde(default = "default_inference_backend")]
    pub flux_kontext_inference_backend: String,

    /// Optional InvokeAI board that uploads are filed under.
    #[serde(default)]
    pub board_id: Option<String>,

    /// argv prefix for the container runtime (`ps`, `run`, `kill` are appended).
    #[serde(default = "default_container_runtime")]
    pub container_runtime: Vec<String>,

    /// Upper bound on a single container runtime invocation.
    #[serde(default = "default_container_timeout")]
    pub container_timeout_seconds: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            gallery_directory: None,
            nvidia_api_key: None,
            ngc_api_key: None,
            hf_token: None,
            local_nim_cache: None,
            output_directory: default_output_directory(),
            flux_nim_url: default_flux_nim_url(),
            invokeai_url: default_invokeai_url(),
            flux_kontext_nim_url: default_flux_kontext_nim_url(),
            comfyui_url: default_comfyui_url(),
            flux_kontext_inference_backend: default_inference_backend(),
            board_id: None,
            container_runtime: default_container_runtime(),
            container_timeout_seconds: default_container_timeout(),
        }
    }
}

impl Config {
    /// Default location of `config.json`.
    ///
    /// Priority: `FLUX_PLUGIN_CONFIG` > `%PROGRAMDATA%` plugin directory > `./config.json`.
    pub fn default_path() -> PathBuf {
        if let Ok(path) = std::env::var(CONFIG_PATH_ENV) {
            return PathBuf::from(path);
        }
        std::env::var("PROGRAMDATA").map_or_else(
            |_| PathBuf::from("config.json"),
            |root| {
                PathBuf::from(root)
                    .join("NVIDIA Corporation")
                    .join("nvtopps")
                    .join("rise")
                    .join("plugins")
                    .join("flux")
                    .join("config.json")
            },
        )
    }

    /// Read and parse the config file.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            PluginError::filesystem(format!("Cannot read config file {}", path.display()), e)
        })?;
        let config: Self = serde_json::from_str(&raw)?;
        Ok(config)
    }

    /// Read the config file, falling back to defaults when it is missing or malformed.
    pub fn load_or_default(path: &Path) -> Self {
        match Self::load(path) {
            Ok(config) => {
                debug!(path = %path.display(), "Configuration loaded");
                config
            }
            Err(PluginError::Filesystem { source, .. })
                if source.kind() == std::io::ErrorKind::NotFound =>
            {
                warn!(path = %path.display(), "Config file not found, using defaults");
                Self::default()
            }
            Err(e) => {
                error!(path = %path.display(), error = %e, "Error loading config, using defaults");
                Self::default()
            }
        }
    }

    /// Create a config from a JSON string.
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn flux_nim_url(&self) -> Option<&str> {
        non_empty(self.flux_nim_url.as_deref())
    }

    pub fn invokeai_url(&self) -> Option<&str> {
        non_empty(self.invokeai_url.as_deref())
    }

    pub fn flux_kontext_nim_url(&self) -> Option<&str> {
        non_empty(self.flux_kontext_nim_url.as_deref())
    }

    pub fn comfyui_url(&self) -> Option<&str> {
        non_empty(self.comfyui_url.as_deref())
    }

    pub fn board_id(&self) -> Option<&str> {
        non_empty(self.board_id.as_deref())
    }

    /// Gallery directory, if configured and non-empty.
    pub fn gallery_directory(&self) -> Option<&Path> {
        self.gallery_directory
            .as_deref()
            .filter(|p| !p.as_os_str().is_empty())
    }

    /// Whether the text-to-image endpoint is NVIDIA's hosted service.
    pub fn uses_hosted_flux_nim(&self) -> bool {
        self.flux_nim_url()
            .is_some_and(|url| url.starts_with(HOSTED_NIM_PREFIX))
    }

    /// NVIDIA API key, when set to something other than the template placeholder.
    pub fn nvidia_api_key(&self) -> Option<&str> {
        configured(self.nvidia_api_key.as_deref(), "YOUR_NVIDIA_API_KEY_HERE")
    }

    pub fn ngc_api_key(&self) -> Option<&str> {
        configured(self.ngc_api_key.as_deref(), "YOUR_NGC_API_KEY_HERE")
    }

    pub fn hf_token(&self) -> Option<&str> {
        configured(self.hf_token.as_deref(), "YOUR_HF_TOKEN_HERE")
    }

    pub fn local_nim_cache(&self) -> Option<&str> {
        configured(self.local_nim_cache.as_deref(), "/path/to/your/nim/cache")
    }

    /// Bound applied to each container runtime invocation.
    pub const fn container_timeout(&self) -> Duration {
        Duration::from_secs(self.container_timeout_seconds)
    }

    /// Resolve the backend selected for conditioned generation.
    pub fn kontext_backend(&self) -> Result<BackendKind> {
        match self.flux_kontext_inference_backend.to_uppercase().as_str() {
            "NIM" => Ok(BackendKind::DirectInfer),
            "INVOKEAI" => Ok(BackendKind::QueuedGraph),
            "COMFYUI" => Ok(BackendKind::StreamingGraph),
            _ => Err(PluginError::config(format!(
                "Invalid FLUX_KONTEXT_INFERENCE_BACKEND value: '{}'. Must be one of: NIM, INVOKEAI, COMFYUI",
                self.flux_kontext_inference_backend
            ))),
        }
    }
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

fn configured<'a>(value: Option<&'a str>, placeholder: &str) -> Option<&'a str> {
    non_empty(value).filter(|v| *v != placeholder)
}

fn default_output_directory() -> PathBuf {
    let home = std::env::var("USERPROFILE")
        .or_else(|_| std::env::var("HOME"))
        .unwrap_or_else(|_| ".".into());
    PathBuf::from(home).join("flux_output")
}

#[allow(clippy::unnecessary_wraps)]
fn default_flux_nim_url() -> Option<String> {
    Some(HOSTED_FLUX_NIM_URL.into())
}

#[allow(clippy::unnecessary_wraps)]
fn default_invokeai_url() -> Option<String> {
    Some("http://localhost:9090".into())
}

#[allow(clippy::unnecessary_wraps)]
fn default_flux_kontext_nim_url() -> Option<String> {
    Some("http://localhost:8011".into())
}

#[allow(clippy::unnecessary_wraps)]
fn default_comfyui_url() -> Option<String> {
    Some("http://localhost:8188".into())
}

fn default_inference_backend() -> String {
    "NIM".into()
}

fn default_container_runtime() -> Vec<String> {
    ["wsl", "-d", "NVIDIA-Workbench", "podman"]
        .iter()
        .map(ToString::to_string)
        .collect()
}

const fn default_container_timeout() -> u64 {
    30
}
