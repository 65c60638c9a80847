//! ComfyUI status and memory commands.

use serde_json::{Map, Value};
use tracing::{error, info};
use uuid::Uuid;

use crate::backend::comfyui::{free_summary, SERVICE};
use crate::backend::ComfyClient;
use crate::commands::flag_param;
use crate::config::Config;
use crate::error::PluginError;
use crate::http;
use crate::plugin::Plugin;
use crate::transport::Response;

fn client(plugin: &Plugin, config: &Config) -> Option<ComfyClient> {
    config
        .comfyui_url()
        .map(|url| ComfyClient::new(plugin.http().clone(), url, Uuid::new_v4()))
}

fn not_configured() -> Response {
    Response::failure("COMFYUI_URL not configured. Please set COMFYUI_URL in config.json")
}

fn failure(client: &ComfyClient, err: &PluginError) -> Response {
    let message = http::describe_failure(SERVICE, client.base_url(), err);
    error!(error = %err, "{message}");
    Response::failure(message)
}

/// Root liveness plus a summary of `/system_stats`.
pub async fn status(plugin: &Plugin, config: &Config) -> Response {
    let Some(client) = client(plugin, config) else {
        return not_configured();
    };
    if let Err(e) = client.ping_root().await {
        return failure(&client, &e);
    }
    match client.system_stats().await {
        Ok(stats) => {
            let message = stats.summary();
            info!(url = %client.base_url(), "ComfyUI status retrieved");
            Response::success(message)
        }
        Err(e) => failure(&client, &e),
    }
}

pub async fn free_memory(plugin: &Plugin, config: &Config, params: &Map<String, Value>) -> Response {
    let Some(client) = client(plugin, config) else {
        return not_configured();
    };
    let unload_models = flag_param(params, "unload_models", true);
    let free_memory = flag_param(params, "free_memory", true);

    match client.free_memory(unload_models, free_memory).await {
        Ok(()) => {
            info!(unload_models, free_memory, "ComfyUI memory release requested");
            Response::success(free_summary(unload_models, free_memory))
        }
        Err(e) => failure(&client, &e),
    }
}
