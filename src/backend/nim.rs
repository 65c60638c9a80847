//! NVIDIA NIM backends: FLUX.1-dev text-to-image and FLUX.1 Kontext.
//!
//! Both are a single synchronous POST returning the image base64-encoded in
//! `artifacts[0].base64`.

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument};

use super::{Artifact, BackendKind, GenerationRequest, ImageBackend, Submission};
use crate::config::Config;
use crate::error::{PluginError, Result};
use crate::http::{self, GENERATION_TIMEOUT, HEALTH_TIMEOUT};
use crate::image_prep::{self, KONTEXT_HEIGHT, KONTEXT_WIDTH};

/// Text-to-image request body.
#[derive(Debug, Serialize)]
struct TextToImage<'a> {
    height: u32,
    width: u32,
    cfg_scale: u32,
    mode: &'static str,
    samples: u32,
    seed: u64,
    steps: u32,
    prompt: &'a str,
}

/// Image-conditioned request body.
#[derive(Debug, Serialize)]
struct Kontext<'a> {
    prompt: &'a str,
    /// `data:image/png;base64,...`
    image: String,
    cfg_scale: f32,
    aspect_ratio: &'static str,
    samples: u32,
    seed: u64,
    steps: u32,
}

#[derive(Debug, Deserialize)]
struct InferResponse {
    #[serde(default)]
    artifacts: Vec<InferArtifact>,
}

#[derive(Debug, Deserialize)]
struct InferArtifact {
    base64: String,
}

/// Health probes for a locally running NIM.
#[derive(Debug, Clone)]
pub struct NimClient {
    http: reqwest::Client,
    base_url: String,
}

impl NimClient {
    pub fn new(http: reqwest::Client, base_url: &str) -> Self {
        Self {
            http,
            base_url: http::normalize_base(base_url),
        }
    }

    /// Probe `/v1/health/live` then `/v1/health/ready`.
    ///
    /// The error message names the probe that failed.
    pub async fn check_health(&self) -> std::result::Result<(), String> {
        for probe in ["live", "ready"] {
            let url = format!("{}/v1/health/{probe}", self.base_url);
            debug!(%url, "Probing health endpoint");
            let capitalized = if probe == "live" { "Live" } else { "Ready" };

            let response = self
                .http
                .get(&url)
                .timeout(HEALTH_TIMEOUT)
                .send()
                .await
                .map_err(|e| format!("{capitalized} endpoint error: {e}"))?;
            let status = response.status().as_u16();
            if status != 200 {
                return Err(format!("{capitalized} endpoint returned status {status}"));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
enum Model {
    Flux { api_key: Option<String> },
    Kontext,
}

/// Direct-inference backend.
#[derive(Debug, Clone)]
pub struct NimBackend {
    http: reqwest::Client,
    endpoint: String,
    model: Model,
}

impl NimBackend {
    /// Text-to-image backend from `FLUX_NIM_URL`.
    ///
    /// The hosted endpoint is used verbatim and requires an `nvapi-` key; a
    /// local server gets `/v1/infer` appended and no key.
    pub fn flux(config: &Config, http: reqwest::Client) -> Result<Self> {
        let url = config.flux_nim_url().ok_or_else(|| {
            PluginError::config("FLUX_NIM_URL not configured. Please set FLUX_NIM_URL in config.json")
        })?;

        let (endpoint, api_key) = if config.uses_hosted_flux_nim() {
            let key = config
                .nvidia_api_key()
                .filter(|key| key.starts_with("nvapi-"))
                .ok_or_else(|| {
                    PluginError::config(
                        "NVIDIA API key not configured or invalid. Please set a valid NVIDIA_API_KEY (starting with \"nvapi-\") in config.json",
                    )
                })?;
            (url.to_string(), Some(key.to_string()))
        } else {
            (
                format!("{}/v1/infer", http::normalize_base(url)),
                config.nvidia_api_key().map(str::to_string),
            )
        };

        Ok(Self {
            http,
            endpoint,
            model: Model::Flux { api_key },
        })
    }

    /// Kontext backend from `FLUX_KONTEXT_NIM_URL`.
    pub fn kontext(config: &Config, http: reqwest::Client) -> Result<Self> {
        let url = config.flux_kontext_nim_url().ok_or_else(|| {
            PluginError::config(
                "FLUX_KONTEXT_INFERENCE_BACKEND is set to 'NIM' but FLUX_KONTEXT_NIM_URL is not configured. Please set FLUX_KONTEXT_NIM_URL in config.json",
            )
        })?;
        Ok(Self {
            http,
            endpoint: format!("{}/v1/infer", http::normalize_base(url)),
            model: Model::Kontext,
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn service_name(&self) -> &'static str {
        match self.model {
            Model::Flux { .. } => "Flux",
            Model::Kontext => "Flux Kontext NIM",
        }
    }

    async fn infer<T: Serialize + Sync>(&self, body: &T, api_key: Option<&str>) -> Result<Vec<u8>> {
        let mut request = self
            .http
            .post(&self.endpoint)
            .header(reqwest::header::ACCEPT, "application/json")
            .json(body);
        if let Some(key) = api_key {
            request = request.bearer_auth(key);
        }

        let context = format!("{} API request", self.service_name());
        let response: InferResponse = http::send_json(request, GENERATION_TIMEOUT, &context).await?;
        let artifact = response.artifacts.into_iter().next().ok_or_else(|| {
            PluginError::protocol(format!("No artifacts found in {} response", self.service_name()))
        })?;

        BASE64
            .decode(artifact.base64.trim())
            .map_err(|e| PluginError::protocol(format!("Artifact is not valid base64: {e}")))
    }
}

#[async_trait]
impl ImageBackend for NimBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::DirectInfer
    }

    #[instrument(skip_all, fields(request_id = %request.id, endpoint = %self.endpoint))]
    async fn submit(&self, request: &GenerationRequest) -> Result<Submission> {
        let (bytes, stem) = match &self.model {
            Model::Flux { api_key } => {
                let body = TextToImage {
                    height: 768,
                    width: 1344,
                    cfg_scale: 5,
                    mode: "base",
                    samples: 1,
                    seed: 0,
                    steps: request.steps,
                    prompt: &request.prompt,
                };
                info!(prompt = %request.prompt, "Sending text-to-image request");
                (self.infer(&body, api_key.as_deref()).await?, "flux_image")
            }
            Model::Kontext => {
                let source = request.source_image.clone().ok_or_else(|| {
                    PluginError::config("No source image provided for Flux Kontext NIM")
                })?;
                let image = tokio::task::spawn_blocking(move || {
                    image_prep::png_data_uri(&source, KONTEXT_WIDTH, KONTEXT_HEIGHT)
                })
                .await??;

                let body = Kontext {
                    prompt: &request.prompt,
                    image,
                    cfg_scale: 3.5,
                    aspect_ratio: "match_input_image",
                    samples: 1,
                    seed: 0,
                    steps: request.steps,
                };
                info!(
                    prompt = %request.prompt,
                    steps = request.steps,
                    image_len = body.image.len(),
                    "Sending Kontext request"
                );
                (self.infer(&body, None).await?, "flux_kontext_nim")
            }
        };

        Ok(Submission::Produced(vec![Artifact::new(
            bytes,
            BackendKind::DirectInfer,
            stem,
        )]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HOSTED_FLUX_NIM_URL;

    #[test]
    fn hosted_flux_requires_nvapi_key() {
        let http = reqwest::Client::new();

        let config = Config::from_json(r#"{"NVIDIA_API_KEY": "sk-wrong"}"#).unwrap();
        let err = NimBackend::flux(&config, http.clone()).unwrap_err();
        assert!(err.to_string().contains("starting with \"nvapi-\""));

        let config = Config::from_json(r#"{"NVIDIA_API_KEY": "nvapi-123"}"#).unwrap();
        let backend = NimBackend::flux(&config, http).unwrap();
        assert_eq!(backend.endpoint(), HOSTED_FLUX_NIM_URL);
    }

    #[test]
    fn local_flux_appends_infer_path_and_needs_no_key() {
        let config = Config::from_json(r#"{"FLUX_NIM_URL": "http://localhost:8000/"}"#).unwrap();
        let backend = NimBackend::flux(&config, reqwest::Client::new()).unwrap();
        assert_eq!(backend.endpoint(), "http://localhost:8000/v1/infer");
    }

    #[test]
    fn kontext_uses_local_infer_endpoint() {
        let config = Config::from_json(r#"{"FLUX_KONTEXT_NIM_URL": "http://127.0.0.1:8011"}"#).unwrap();
        let backend = NimBackend::kontext(&config, reqwest::Client::new()).unwrap();
        assert_eq!(backend.endpoint(), "http://127.0.0.1:8011/v1/infer");
        assert_eq!(backend.kind(), BackendKind::DirectInfer);
    }

    #[test]
    fn text_to_image_payload_shape() {
        let body = TextToImage {
            height: 768,
            width: 1344,
            cfg_scale: 5,
            mode: "base",
            samples: 1,
            seed: 0,
            steps: 50,
            prompt: "mountains",
        };
        assert_eq!(
            serde_json::to_value(&body).unwrap(),
            serde_json::json!({
                "height": 768, "width": 1344, "cfg_scale": 5, "mode": "base",
                "samples": 1, "seed": 0, "steps": 50, "prompt": "mountains"
            })
        );
    }

    #[test]
    fn response_without_artifacts_parses_empty() {
        let parsed: InferResponse = serde_json::from_str(r#"{"id": "x"}"#).unwrap();
        assert!(parsed.artifacts.is_empty());
    }

    #[tokio::test]
    async fn kontext_without_source_image_fails() {
        let config = Config::default();
        let backend = NimBackend::kontext(&config, reqwest::Client::new()).unwrap();
        let request = GenerationRequest::new("anime", 30, BackendKind::DirectInfer);
        let err = backend.submit(&request).await.unwrap_err();
        assert!(matches!(err, PluginError::Configuration(_)));
    }
}
