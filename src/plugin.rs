//! Long-lived plugin state shared by every command.
//!
//! Configuration is not held here: each command loads its own snapshot from
//! `config_path`, so edits to `config.json` apply to the next command.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::config::Config;
use crate::container::{ContainerRuntime, ProcessRuntime};
use crate::desktop::{NoWallpaper, Wallpaper};
use crate::error::{PluginError, Result};
use crate::monitor::MonitorSettings;
use crate::supervisor::TaskSupervisor;

/// Collaborators and background job tracking.
pub struct Plugin {
    config_path: PathBuf,
    http: reqwest::Client,
    containers: Arc<dyn ContainerRuntime>,
    wallpaper: Arc<dyn Wallpaper>,
    supervisor: TaskSupervisor,
    monitor: MonitorSettings,
}

impl Plugin {
    /// Plugin with the real container runtime and no wallpaper command.
    pub fn new(config_path: impl Into<PathBuf>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .build()
            .map_err(|e| PluginError::network("Failed to build HTTP client", e))?;
        Ok(Self {
            config_path: config_path.into(),
            http,
            containers: Arc::new(ProcessRuntime::new()),
            wallpaper: Arc::new(NoWallpaper),
            supervisor: TaskSupervisor::default(),
            monitor: MonitorSettings::default(),
        })
    }

    #[must_use]
    pub fn with_container_runtime(mut self, runtime: Arc<dyn ContainerRuntime>) -> Self {
        self.containers = runtime;
        self
    }

    #[must_use]
    pub fn with_wallpaper(mut self, wallpaper: Arc<dyn Wallpaper>) -> Self {
        self.wallpaper = wallpaper;
        self
    }

    #[must_use]
    pub fn with_monitor_settings(mut self, settings: MonitorSettings) -> Self {
        self.monitor = settings;
        self
    }

    #[must_use]
    pub fn with_supervisor(mut self, supervisor: TaskSupervisor) -> Self {
        self.supervisor = supervisor;
        self
    }

    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    /// Fresh configuration snapshot for one command.
    pub fn load_config(&self) -> Config {
        Config::load_or_default(&self.config_path)
    }

    pub const fn http(&self) -> &reqwest::Client {
        &self.http
    }

    pub fn containers(&self) -> &dyn ContainerRuntime {
        self.containers.as_ref()
    }

    pub fn wallpaper(&self) -> Arc<dyn Wallpaper> {
        Arc::clone(&self.wallpaper)
    }

    pub const fn supervisor(&self) -> &TaskSupervisor {
        &self.supervisor
    }

    pub const fn monitor_settings(&self) -> &MonitorSettings {
        &self.monitor
    }
}
