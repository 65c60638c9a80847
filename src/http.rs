//! Shared HTTP plumbing for backend clients.

use std::time::Duration;

use reqwest::{RequestBuilder, Response};
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::error::{PluginError, Result};

/// Liveness probes.
pub const HEALTH_TIMEOUT: Duration = Duration::from_secs(5);
/// Status, pause and resume calls.
pub const CONTROL_TIMEOUT: Duration = Duration::from_secs(10);
/// Model cache release and memory freeing.
pub const MAINTENANCE_TIMEOUT: Duration = Duration::from_secs(30);
/// Uploads, history lookups and image downloads.
pub const TRANSFER_TIMEOUT: Duration = Duration::from_secs(30);
/// Queue submission.
pub const ENQUEUE_TIMEOUT: Duration = Duration::from_secs(60);
/// Synchronous inference.
pub const GENERATION_TIMEOUT: Duration = Duration::from_secs(300);

/// Strip trailing slashes so paths can be appended with `format!`.
pub fn normalize_base(url: &str) -> String {
    url.trim().trim_end_matches('/').to_string()
}

/// Send a request and require a 2xx status.
///
/// `context` names the call in error messages, e.g. "InvokeAI API request".
pub async fn send(request: RequestBuilder, timeout: Duration, context: &str) -> Result<Response> {
    let response = request
        .timeout(timeout)
        .send()
        .await
        .map_err(|e| PluginError::network(context, e))?;

    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        debug!(%status, context, body = %truncate(&body, 500), "Non-success response");
        return Err(PluginError::HttpStatus {
            context: context.to_string(),
            status: status.as_u16(),
            body,
        });
    }
    Ok(response)
}

/// Send a request, require a 2xx status and decode the JSON body.
pub async fn send_json<T: DeserializeOwned>(
    request: RequestBuilder,
    timeout: Duration,
    context: &str,
) -> Result<T> {
    let response = send(request, timeout, context).await?;
    let body = response
        .bytes()
        .await
        .map_err(|e| PluginError::network(format!("{context}: failed to read response body"), e))?;
    serde_json::from_slice(&body).map_err(|e| {
        PluginError::protocol(format!(
            "{context}: invalid response body: {e} ({})",
            truncate(&String::from_utf8_lossy(&body), 200)
        ))
    })
}

/// Send a request, require a 2xx status and return the raw body.
pub async fn send_bytes(request: RequestBuilder, timeout: Duration, context: &str) -> Result<Vec<u8>> {
    let response = send(request, timeout, context).await?;
    let bytes = response
        .bytes()
        .await
        .map_err(|e| PluginError::network(format!("{context}: failed to read body"), e))?;
    Ok(bytes.to_vec())
}

/// Cut a string to at most `max` bytes on a char boundary, for logging.
pub fn truncate(text: &str, max: usize) -> &str {
    if text.len() <= max {
        return text;
    }
    let mut end = max;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}

/// Turn a transport-level failure into the message shown to the user.
///
/// `service` is the display name ("InvokeAI", "ComfyUI") and `url` the base
/// URL that was contacted.
pub fn describe_failure(service: &str, url: &str, err: &PluginError) -> String {
    match err {
        e if e.is_timeout() => format!("Request to {service} server timed out"),
        e if e.is_connect() => {
            format!("Could not connect to {service} server at {url}. Is the service running?")
        }
        PluginError::HttpStatus { status, .. } => {
            format!("{service} API request failed with status code {status}")
        }
        other => format!("Unexpected error from {service}: {other}"),
    }
}
