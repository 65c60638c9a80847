//! InvokeAI status and maintenance commands.

use tracing::{error, info};

use crate::backend::invokeai::SERVICE;
use crate::backend::InvokeAiClient;
use crate::config::Config;
use crate::error::Result;
use crate::http;
use crate::plugin::Plugin;
use crate::transport::Response;

fn client(plugin: &Plugin, config: &Config) -> Option<InvokeAiClient> {
    config
        .invokeai_url()
        .map(|url| InvokeAiClient::new(plugin.http().clone(), url))
}

fn not_configured() -> Response {
    Response::failure("INVOKEAI_URL not configured. Please set INVOKEAI_URL in config.json")
}

fn reply(client: &InvokeAiClient, result: Result<String>) -> Response {
    match result {
        Ok(message) => {
            info!(url = %client.base_url(), "{message}");
            Response::success(message)
        }
        Err(e) => {
            let message = http::describe_failure(SERVICE, client.base_url(), &e);
            error!(error = %e, "{message}");
            Response::failure(message)
        }
    }
}

pub async fn status(plugin: &Plugin, config: &Config) -> Response {
    let Some(client) = client(plugin, config) else {
        return not_configured();
    };
    let result = client.version().await.map(|version| version.summary());
    reply(&client, result)
}

pub async fn pause(plugin: &Plugin, config: &Config) -> Response {
    let Some(client) = client(plugin, config) else {
        return not_configured();
    };
    let result = client
        .pause_processor()
        .await
        .map(|()| "InvokeAI processor has been paused successfully".to_string());
    reply(&client, result)
}

pub async fn resume(plugin: &Plugin, config: &Config) -> Response {
    let Some(client) = client(plugin, config) else {
        return not_configured();
    };
    let result = client
        .resume_processor()
        .await
        .map(|()| "InvokeAI processor has been resumed successfully".to_string());
    reply(&client, result)
}

pub async fn empty_model_cache(plugin: &Plugin, config: &Config) -> Response {
    let Some(client) = client(plugin, config) else {
        return not_configured();
    };
    let result = client
        .empty_model_cache()
        .await
        .map(|()| "InvokeAI model cache has been emptied successfully".to_string());
    reply(&client, result)
}
