//! `initialize` and `shutdown`.

use tracing::{info, warn};

use crate::config::Config;
use crate::storage;
use crate::transport::Response;

/// Validate the output and gallery directories.
///
/// Always succeeds; problems are listed as warnings in the message.
pub fn initialize(config: &Config) -> Response {
    let mut warnings = Vec::new();

    if let Err(e) = storage::probe_output_directory(&config.output_directory) {
        warn!(dir = %config.output_directory.display(), error = %e, "Output directory is not usable");
        warnings.push("OUTPUT_DIRECTORY configuration is invalid");
    }
    if config.gallery_directory().is_none() {
        warnings.push("GALLERY_DIRECTORY not configured");
    }

    if warnings.is_empty() {
        info!("Plugin initialized successfully with all configurations valid");
        Response::success("initialize success.")
    } else {
        let message = format!("Plugin initialized with warnings: {}", warnings.join("; "));
        warn!("{message}");
        Response::success(format!("initialize success. {message}"))
    }
}

/// Nothing is held that needs releasing; background jobs are left running.
pub fn shutdown() -> Response {
    info!("Shutting down plugin");
    Response::success("shutdown success.")
}
