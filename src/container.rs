//! Local NIM container control through an external container runtime.
//!
//! The runtime is invoked as an argv prefix (by default
//! `wsl -d NVIDIA-Workbench podman`) followed by `ps`, `run` or `kill`.
//! Every invocation is bounded; a runtime that hangs is killed.

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tracing::{debug, info, instrument, warn};

use crate::config::Config;
use crate::error::{PluginError, Result};

/// Captured result of one runtime invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl RuntimeOutput {
    pub const fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Something that can run container runtime commands.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Run `program` followed by `args`, killing it after `timeout`.
    async fn run(&self, program: &[String], args: &[String], timeout: Duration) -> Result<RuntimeOutput>;
}

/// Runs the container runtime as a child process.
#[derive(Debug, Default, Clone)]
pub struct ProcessRuntime;

impl ProcessRuntime {
    pub const fn new() -> Self {
        Self
    }
}

#[async_trait]
impl ContainerRuntime for ProcessRuntime {
    #[instrument(skip(self, program), fields(cmd = ?args.first()))]
    async fn run(&self, program: &[String], args: &[String], timeout: Duration) -> Result<RuntimeOutput> {
        let (exe, prefix) = program
            .split_first()
            .ok_or_else(|| PluginError::config("CONTAINER_RUNTIME is empty"))?;

        let mut cmd = Command::new(exe);
        cmd.args(prefix)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                PluginError::RuntimeNotFound(exe.clone())
            } else {
                PluginError::Container(format!("Failed to spawn {exe}: {e}"))
            }
        })?;

        let mut child_stdout = child
            .stdout
            .take()
            .ok_or_else(|| PluginError::Container("Failed to open stdout".into()))?;
        let mut child_stderr = child
            .stderr
            .take()
            .ok_or_else(|| PluginError::Container("Failed to open stderr".into()))?;

        // `child` stays out of this future so it can be killed on timeout
        let read_all = async {
            let mut stdout_buf = Vec::new();
            let mut stderr_buf = Vec::new();
            let (r1, r2) = tokio::join!(
                child_stdout.read_to_end(&mut stdout_buf),
                child_stderr.read_to_end(&mut stderr_buf),
            );
            r1.and(r2)
                .map_err(|e| PluginError::Container(format!("Failed to read {exe} output: {e}")))?;
            Ok::<_, PluginError>((stdout_buf, stderr_buf))
        };

        let (stdout_buf, stderr_buf) =
            if let Ok(result) = tokio::time::timeout(timeout, read_all).await {
                result?
            } else {
                let _ = child.kill().await;
                return Err(PluginError::Container(format!(
                    "{exe} timed out after {}s",
                    timeout.as_secs()
                )));
            };

        let status = child
            .wait()
            .await
            .map_err(|e| PluginError::Container(format!("Failed to wait for {exe}: {e}")))?;

        let output = RuntimeOutput {
            exit_code: status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&stdout_buf).trim().to_string(),
            stderr: String::from_utf8_lossy(&stderr_buf).trim().to_string(),
        };
        debug!(exit_code = output.exit_code, "Runtime command finished");
        Ok(output)
    }
}

/// A NIM service that can be run as a local container.
#[derive(Clone, Copy)]
pub struct NimService {
    /// Container name, also used as the `ps` filter.
    pub container: &'static str,
    pub image: &'static str,
    /// Name used in status, start and stop messages.
    pub label: &'static str,
    /// Name used when refusing to start a running service.
    pub running_label: &'static str,
    /// Config key holding the service URL; its port is published.
    pub url_key: &'static str,
    url: fn(&Config) -> Option<&str>,
}

pub const FLUX_NIM: NimService = NimService {
    container: "nim-server",
    image: "nvcr.io/nim/black-forest-labs/flux.1-dev:1.0.0",
    label: "NIM server",
    running_label: "Flux NIM server",
    url_key: "FLUX_NIM_URL",
    url: Config::flux_nim_url,
};

pub const FLUX_KONTEXT_NIM: NimService = NimService {
    container: "FLUX_KONTEXT",
    image: "nvcr.io/nim/black-forest-labs/flux.1-kontext-dev:latest",
    label: "Flux Kontext NIM server",
    running_label: "Flux Kontext NIM server",
    url_key: "FLUX_KONTEXT_NIM_URL",
    url: Config::flux_kontext_nim_url,
};

/// Host port published for the service: the explicit port of its URL.
pub fn published_port(url: &str) -> Result<u16> {
    reqwest::Url::parse(url)
        .ok()
        .and_then(|parsed| parsed.port())
        .ok_or_else(|| PluginError::config(format!("Cannot determine port from URL '{url}'")))
}

/// Result of a start request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartOutcome {
    Started,
    /// Matching containers were already running; nothing was started.
    AlreadyRunning(String),
}

/// Status, start and stop for one NIM service under one config snapshot.
pub struct ContainerControl<'a> {
    runtime: &'a dyn ContainerRuntime,
    config: &'a Config,
    service: NimService,
}

impl<'a> ContainerControl<'a> {
    pub fn new(runtime: &'a dyn ContainerRuntime, config: &'a Config, service: NimService) -> Self {
        Self {
            runtime,
            config,
            service,
        }
    }

    async fn invoke(&self, args: &[String]) -> Result<RuntimeOutput> {
        let output = self
            .runtime
            .run(&self.config.container_runtime, args, self.config.container_timeout())
            .await?;
        if !output.success() {
            return Err(PluginError::Container(format!(
                "exit code {}: {}",
                output.exit_code, output.stderr
            )));
        }
        Ok(output)
    }

    /// Names of running containers matching the service, if any.
    pub async fn running(&self) -> Result<Option<String>> {
        let args = to_args(&[
            "ps",
            "--filter",
            &format!("name={}", self.service.container),
            "--format",
            "{{.Names}}",
        ]);
        let output = self.invoke(&args).await?;
        debug!(container = self.service.container, names = %output.stdout, "Container status");
        Ok(Some(output.stdout).filter(|names| !names.is_empty()))
    }

    pub async fn stop(&self) -> Result<()> {
        let output = self.invoke(&to_args(&["kill", self.service.container])).await?;
        info!(container = self.service.container, result = %output.stdout, "Container stopped");
        Ok(())
    }

    /// Validate credentials, refuse if already running, then start detached.
    pub async fn start(&self) -> Result<StartOutcome> {
        let ngc_key = self.config.ngc_api_key().ok_or_else(|| {
            PluginError::config("NGC API key not configured. Please set NGC_API_KEY in config.json")
        })?;
        let hf_token = self.config.hf_token().ok_or_else(|| {
            PluginError::config("HF Token not configured. Please set HF_TOKEN in config.json")
        })?;
        let cache = self.config.local_nim_cache().ok_or_else(|| {
            PluginError::config(
                "Local NIM cache path not configured. Please set LOCAL_NIM_CACHE in config.json",
            )
        })?;
        let url = (self.service.url)(self.config).ok_or_else(|| {
            PluginError::config(format!(
                "{key} not configured. Please set {key} in config.json",
                key = self.service.url_key
            ))
        })?;
        let port = published_port(url)?;

        match self.running().await {
            Ok(Some(names)) => {
                info!(container = self.service.container, %names, "Already running, not starting");
                return Ok(StartOutcome::AlreadyRunning(names));
            }
            Ok(None) => {}
            Err(e) => warn!(error = %e, "Status check before start failed, starting anyway"),
        }

        let args = to_args(&[
            "run",
            "-d",
            "--rm",
            &format!("--name={}", self.service.container),
            "--device",
            "nvidia.com/gpu=all",
            "-e",
            &format!("NGC_API_KEY={ngc_key}"),
            "-e",
            &format!("HF_TOKEN={hf_token}"),
            "-p",
            &format!("{port}:8000"),
            "-v",
            &format!("{cache}:/opt/nim/.cache/"),
            self.service.image,
        ]);
        let output = self.invoke(&args).await?;
        info!(container = self.service.container, id = %output.stdout, "Container started");
        Ok(StartOutcome::Started)
    }
}

fn to_args(args: &[&str]) -> Vec<String> {
    args.iter().map(ToString::to_string).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Records invocations and answers `ps` with a fixed listing.
    struct FakeRuntime {
        ps_output: String,
        calls: Mutex<Vec<Vec<String>>>,
    }

    impl FakeRuntime {
        fn new(ps_output: &str) -> Self {
            Self {
                ps_output: ps_output.into(),
                calls: Mutex::new(Vec::new()),
            }
        }

        fn calls(&self) -> Vec<Vec<String>> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl ContainerRuntime for FakeRuntime {
        async fn run(&self, _program: &[String], args: &[String], _timeout: Duration) -> Result<RuntimeOutput> {
            self.calls.lock().unwrap().push(args.to_vec());
            let stdout = if args[0] == "ps" {
                self.ps_output.clone()
            } else {
                "abc123".into()
            };
            Ok(RuntimeOutput {
                exit_code: 0,
                stdout,
                stderr: String::new(),
            })
        }
    }

    fn local_config() -> Config {
        Config::from_json(
            r#"{
                "NGC_API_KEY": "ngc-key",
                "HF_TOKEN": "hf-token",
                "LOCAL_NIM_CACHE": "/home/me/.cache/nim",
                "FLUX_NIM_URL": "http://localhost:8000",
                "FLUX_KONTEXT_NIM_URL": "http://localhost:8011"
            }"#,
        )
        .unwrap()
    }

    #[tokio::test]
    async fn start_runs_detached_container_with_credentials() {
        let runtime = FakeRuntime::new("");
        let config = local_config();

        let outcome = ContainerControl::new(&runtime, &config, FLUX_KONTEXT_NIM)
            .start()
            .await
            .unwrap();
        assert_eq!(outcome, StartOutcome::Started);

        let calls = runtime.calls();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0][..3], to_args(&["ps", "--filter", "name=FLUX_KONTEXT"]));
        let run = &calls[1];
        assert_eq!(run[0], "run");
        assert!(run.contains(&"--name=FLUX_KONTEXT".to_string()));
        assert!(run.contains(&"NGC_API_KEY=ngc-key".to_string()));
        assert!(run.contains(&"8011:8000".to_string()));
        assert!(run.contains(&"/home/me/.cache/nim:/opt/nim/.cache/".to_string()));
        assert_eq!(run.last().unwrap(), FLUX_KONTEXT_NIM.image);
    }

    #[tokio::test]
    async fn start_refuses_when_running() {
        let runtime = FakeRuntime::new("nim-server");
        let config = local_config();

        let outcome = ContainerControl::new(&runtime, &config, FLUX_NIM)
            .start()
            .await
            .unwrap();

        assert_eq!(outcome, StartOutcome::AlreadyRunning("nim-server".into()));
        assert_eq!(runtime.calls().len(), 1);
    }

    #[tokio::test]
    async fn start_requires_credentials_before_touching_runtime() {
        let runtime = FakeRuntime::new("");
        let config = Config::from_json(r#"{"NGC_API_KEY": "YOUR_NGC_API_KEY_HERE"}"#).unwrap();

        let err = ContainerControl::new(&runtime, &config, FLUX_NIM)
            .start()
            .await
            .unwrap_err();

        assert!(err.to_string().starts_with("NGC API key not configured"));
        assert!(runtime.calls().is_empty());
    }

    #[tokio::test]
    async fn status_reports_container_names() {
        let runtime = FakeRuntime::new("nim-server");
        let config = local_config();
        let control = ContainerControl::new(&runtime, &config, FLUX_NIM);
        assert_eq!(control.running().await.unwrap().as_deref(), Some("nim-server"));

        let runtime = FakeRuntime::new("");
        let control = ContainerControl::new(&runtime, &config, FLUX_NIM);
        assert!(control.running().await.unwrap().is_none());
    }

    #[test]
    fn port_comes_from_url() {
        assert_eq!(published_port("http://localhost:8011").unwrap(), 8011);
        assert_eq!(published_port("http://127.0.0.1:9000/").unwrap(), 9000);
        assert!(published_port("https://ai.api.nvidia.com/v1/genai").is_err());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn process_runtime_captures_output() {
        let program = to_args(&["sh", "-c"]);
        let output = ProcessRuntime::new()
            .run(&program, &to_args(&["echo hello; echo oops >&2"]), Duration::from_secs(5))
            .await
            .unwrap();
        assert!(output.success());
        assert_eq!(output.stdout, "hello");
        assert_eq!(output.stderr, "oops");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn process_runtime_kills_on_timeout() {
        let program = to_args(&["sh", "-c"]);
        let started = std::time::Instant::now();
        let err = ProcessRuntime::new()
            .run(&program, &to_args(&["sleep 5"]), Duration::from_millis(200))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("timed out"));
        assert!(started.elapsed() < Duration::from_secs(4));
    }

    #[tokio::test]
    async fn missing_program_is_reported() {
        let program = to_args(&["definitely-not-a-container-runtime"]);
        let err = ProcessRuntime::new()
            .run(&program, &to_args(&["ps"]), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "definitely-not-a-container-runtime command not found"
        );
    }
}
