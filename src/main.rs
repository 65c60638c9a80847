//! flux-plugin daemon
//!
//! Reads framed JSON commands on stdin and answers on stdout. Configuration
//! is read from `config.json` at the start of every command.

use std::fs::OpenOptions;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use clap::{ArgAction, Parser};
use tracing::info;
use tracing_subscriber::EnvFilter;

use flux_plugin_daemon::{
    config::Config, desktop::CommandWallpaper, plugin::Plugin, router, transport::PipeTransport,
};

#[derive(Parser, Debug)]
#[command(name = "flux-plugin-daemon")]
#[command(about = "Image generation plugin for NIM, InvokeAI and ComfyUI backends")]
struct Args {
    /// Path to config.json (defaults to FLUX_PLUGIN_CONFIG, then the plugin directory)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Write logs to this file instead of stderr
    #[arg(long)]
    log_file: Option<PathBuf>,

    /// Wallpaper command, one argument per flag; the image path is appended
    #[arg(long = "wallpaper-cmd", action = ArgAction::Append, allow_hyphen_values = true)]
    wallpaper_cmd: Vec<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // stdout carries the protocol, so logs go to stderr or a file
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));
    let subscriber = tracing_subscriber::fmt().with_env_filter(filter);
    if let Some(path) = &args.log_file {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("Failed to open log file {}", path.display()))?;
        subscriber.with_writer(Mutex::new(file)).with_ansi(false).init();
    } else {
        subscriber.with_writer(std::io::stderr).init();
    }

    let config_path = args.config.unwrap_or_else(Config::default_path);
    let mut plugin = Plugin::new(config_path.clone()).context("Failed to initialize plugin")?;
    if !args.wallpaper_cmd.is_empty() {
        let wallpaper =
            CommandWallpaper::new(args.wallpaper_cmd).context("Invalid --wallpaper-cmd")?;
        plugin = plugin.with_wallpaper(Arc::new(wallpaper));
    }

    info!(config = %config_path.display(), "Loaded plugin");

    let mut transport = PipeTransport::stdio();
    router::serve(&plugin, &mut transport).await;

    let pending = plugin.supervisor().in_flight();
    if pending > 0 {
        info!(pending, "Exiting with background jobs still running");
    }
    Ok(())
}
