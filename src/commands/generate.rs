//! Generation commands.
//!
//! Both validate synchronously, hand a [`GenerationJob`] to the supervisor
//! and acknowledge straight away. The job's outcome only reaches the log.

use serde_json::{Map, Value};
use tracing::info;

use crate::backend::{self, BackendKind, GenerationRequest, NimBackend};
use crate::commands::{prompt_param, steps_param};
use crate::config::Config;
use crate::generation::{GenerationJob, SourceSelection};
use crate::plugin::Plugin;
use crate::storage;
use crate::transport::Response;

pub const DEFAULT_PROMPT: &str = "A beautiful landscape with mountains and a lake";
pub const DEFAULT_KONTEXT_PROMPT: &str = "make it in the style of studio ghibli anime";

/// Fixed step count of the text-to-image model.
const TEXT_TO_IMAGE_STEPS: u32 = 50;

/// Text-to-image through the Flux NIM.
pub fn generate_image(plugin: &Plugin, config: &Config, params: &Map<String, Value>) -> Response {
    let backend = match NimBackend::flux(config, plugin.http().clone()) {
        Ok(backend) => backend,
        Err(e) => return Response::failure(e.to_string()),
    };

    let prompt = match prompt_param(params) {
        "" => {
            info!(prompt = DEFAULT_PROMPT, "No prompt provided, using default");
            DEFAULT_PROMPT
        }
        prompt => prompt,
    };

    if let Err(e) = storage::ensure_output_directory(&config.output_directory) {
        return Response::failure(e.to_string());
    }

    let job = GenerationJob::new(
        GenerationRequest::new(prompt, TEXT_TO_IMAGE_STEPS, BackendKind::DirectInfer),
        SourceSelection::None,
        config.output_directory.clone(),
        Box::new(backend),
        plugin.wallpaper(),
    );
    plugin.supervisor().spawn(job.label(), job.run());

    Response::processing(format!(
        "Your image generation request is in progress! Prompt: \"{prompt}\""
    ))
}

/// Screenshot-conditioned generation on the configured Kontext backend.
pub fn generate_using_kontext(plugin: &Plugin, config: &Config, params: &Map<String, Value>) -> Response {
    let Some(gallery) = config.gallery_directory() else {
        return Response::failure(
            "GALLERY_DIRECTORY not configured. Please set GALLERY_DIRECTORY in config.json",
        );
    };
    let user_prompt = prompt_param(params);
    let steps = match steps_param(params) {
        Ok(steps) => steps,
        Err(message) => return Response::failure(message),
    };

    let kind = match config.kontext_backend() {
        Ok(kind) => kind,
        Err(e) => return Response::failure(e.to_string()),
    };
    let backend =
        match backend::kontext_backend(kind, config, plugin.http(), plugin.monitor_settings()) {
            Ok(backend) => backend,
            Err(e) => return Response::failure(e.to_string()),
        };

    let prompt = if user_prompt.is_empty() {
        DEFAULT_KONTEXT_PROMPT
    } else {
        user_prompt
    };
    let job = GenerationJob::new(
        GenerationRequest::new(prompt, steps, kind),
        SourceSelection::MostRecentIn(gallery.to_path_buf()),
        config.output_directory.clone(),
        backend,
        plugin.wallpaper(),
    );
    info!(backend = %kind, steps, prompt, "Starting Kontext generation");
    plugin.supervisor().spawn(job.label(), job.run());

    let label = kind.kontext_label();
    let dir = gallery.display();
    Response::processing(if user_prompt.is_empty() {
        format!("Your {label} generation request is in progress! Using screenshot from: {dir}")
    } else {
        format!(
            "Your {label} generation request is in progress! Using screenshot from: {dir} with prompt: \"{user_prompt}\""
        )
    })
}
