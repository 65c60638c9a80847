//! Status, start and stop for the local NIM containers.

use tracing::{error, info};

use crate::config::Config;
use crate::container::{ContainerControl, NimService, StartOutcome};
use crate::error::PluginError;
use crate::plugin::Plugin;
use crate::transport::Response;

/// `what` completes "Error ...", e.g. "stopping NIM server".
fn runtime_failure(what: &str, err: &PluginError) -> Response {
    error!(error = %err, "Error {what}");
    match err {
        PluginError::RuntimeNotFound(_) => Response::failure("WSL or podman command not found"),
        PluginError::Configuration(message) => Response::failure(message.clone()),
        other => Response::failure(format!("Error {what}: {other}")),
    }
}

pub async fn status(plugin: &Plugin, config: &Config, service: NimService) -> Response {
    let control = ContainerControl::new(plugin.containers(), config, service);
    match control.running().await {
        Ok(Some(names)) => {
            Response::success(format!("{} is running. Container: {names}", service.label))
        }
        Ok(None) => Response::failure(format!("{} is not running.", service.label)),
        Err(e) => runtime_failure(&format!("checking {} status", service.label), &e),
    }
}

pub async fn stop(plugin: &Plugin, config: &Config, service: NimService) -> Response {
    let control = ContainerControl::new(plugin.containers(), config, service);
    match control.stop().await {
        Ok(()) => Response::success(format!("{} stopped successfully.", service.label)),
        Err(e) => runtime_failure(&format!("stopping {}", service.label), &e),
    }
}

pub async fn start(plugin: &Plugin, config: &Config, service: NimService) -> Response {
    let control = ContainerControl::new(plugin.containers(), config, service);
    match control.start().await {
        Ok(StartOutcome::Started) => {
            info!(service = service.label, "Started");
            Response::success(format!("{} started successfully.", service.label))
        }
        Ok(StartOutcome::AlreadyRunning(_)) => {
            Response::failure(format!("{} is already running.", service.running_label))
        }
        Err(e) => runtime_failure(&format!("starting {}", service.label), &e),
    }
}
