//! NIM readiness checks.

use tracing::info;

use crate::backend::NimClient;
use crate::config::Config;
use crate::plugin::Plugin;
use crate::transport::Response;

pub async fn flux_nim_ready_check(plugin: &Plugin, config: &Config) -> Response {
    let Some(url) = config.flux_nim_url() else {
        return Response::failure("FLUX_NIM_URL not configured. Please set FLUX_NIM_URL in config.json");
    };
    if config.uses_hosted_flux_nim() {
        info!("Using NVIDIA hosted Flux service, no health check needed");
        return Response::success("Using NVIDIA hosted Flux service");
    }
    probe(plugin, url, "Service is live and ready!").await
}

pub async fn flux_kontext_nim_ready_check(plugin: &Plugin, config: &Config) -> Response {
    let Some(url) = config.flux_kontext_nim_url() else {
        return Response::failure(
            "FLUX_KONTEXT_NIM_URL not configured. Please set FLUX_KONTEXT_NIM_URL in config.json",
        );
    };
    probe(plugin, url, "Flux Kontext NIM service is live and ready!").await
}

async fn probe(plugin: &Plugin, url: &str, ready_message: &str) -> Response {
    match NimClient::new(plugin.http().clone(), url).check_health().await {
        Ok(()) => {
            info!(%url, "Both health endpoints are working");
            Response::success(ready_message)
        }
        Err(message) => Response::failure(message),
    }
}
