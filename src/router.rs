//! Command dispatch and the serve loop.

use std::fmt;

use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, info, warn};

use crate::commands::{comfyui, containers, generate, health, invokeai, lifecycle};
use crate::container::{FLUX_KONTEXT_NIM, FLUX_NIM};
use crate::plugin::Plugin;
use crate::transport::{Call, Command, PipeTransport, Response};

const ERROR_PREFIX: &str = "Plugin Error!";

/// Every command the plugin answers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Handler {
    Initialize,
    Shutdown,
    FluxNimReadyCheck,
    FluxKontextNimReadyCheck,
    CheckNimStatus,
    StartNim,
    StopNim,
    CheckFluxKontextNimStatus,
    StartFluxKontextNim,
    StopFluxKontextNim,
    GenerateImage,
    GenerateImageUsingKontext,
    InvokeAiStatus,
    PauseInvokeAiProcessor,
    ResumeInvokeAiProcessor,
    InvokeAiEmptyModelCache,
    ComfyUiStatus,
    ComfyUiFreeMemory,
}

impl Handler {
    pub const ALL: [Self; 18] = [
        Self::Initialize,
        Self::Shutdown,
        Self::FluxNimReadyCheck,
        Self::FluxKontextNimReadyCheck,
        Self::CheckNimStatus,
        Self::StartNim,
        Self::StopNim,
        Self::CheckFluxKontextNimStatus,
        Self::StartFluxKontextNim,
        Self::StopFluxKontextNim,
        Self::GenerateImage,
        Self::GenerateImageUsingKontext,
        Self::InvokeAiStatus,
        Self::PauseInvokeAiProcessor,
        Self::ResumeInvokeAiProcessor,
        Self::InvokeAiEmptyModelCache,
        Self::ComfyUiStatus,
        Self::ComfyUiFreeMemory,
    ];

    pub const fn name(self) -> &'static str {
        match self {
            Self::Initialize => "initialize",
            Self::Shutdown => "shutdown",
            Self::FluxNimReadyCheck => "flux_nim_ready_check",
            Self::FluxKontextNimReadyCheck => "flux_kontext_nim_ready_check",
            Self::CheckNimStatus => "check_nim_status",
            Self::StartNim => "start_nim",
            Self::StopNim => "stop_nim",
            Self::CheckFluxKontextNimStatus => "check_flux_kontext_nim_status",
            Self::StartFluxKontextNim => "start_flux_kontext_nim",
            Self::StopFluxKontextNim => "stop_flux_kontext_nim",
            Self::GenerateImage => "generate_image",
            Self::GenerateImageUsingKontext => "generate_image_using_kontext",
            Self::InvokeAiStatus => "invokeai_status",
            Self::PauseInvokeAiProcessor => "pause_invokeai_processor",
            Self::ResumeInvokeAiProcessor => "resume_invokeai_processor",
            Self::InvokeAiEmptyModelCache => "invokeai_empty_model_cache",
            Self::ComfyUiStatus => "comfyui_status",
            Self::ComfyUiFreeMemory => "comfyui_free_memory",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|handler| handler.name() == name)
    }
}

impl fmt::Display for Handler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl Plugin {
    /// Run one command against a fresh configuration snapshot.
    ///
    /// Everything except `initialize` and `shutdown` re-runs the initialize
    /// checks first; their result is only logged.
    pub async fn dispatch(&self, command: &Command) -> Response {
        let Some(handler) = Handler::from_name(&command.name) else {
            warn!(command = %command.name, "Unknown command");
            return Response::failure(format!("{ERROR_PREFIX} Unknown command: {}", command.name));
        };
        info!(command = %handler, "Processing command");

        let config = self.load_config();
        let params = &command.parameters;
        if !matches!(handler, Handler::Initialize | Handler::Shutdown) {
            let checked = lifecycle::initialize(&config);
            debug!(message = ?checked.message, "Pre-command checks");
        }

        match handler {
            Handler::Initialize => lifecycle::initialize(&config),
            Handler::Shutdown => lifecycle::shutdown(),
            Handler::FluxNimReadyCheck => health::flux_nim_ready_check(self, &config).await,
            Handler::FluxKontextNimReadyCheck => {
                health::flux_kontext_nim_ready_check(self, &config).await
            }
            Handler::CheckNimStatus => containers::status(self, &config, FLUX_NIM).await,
            Handler::StartNim => containers::start(self, &config, FLUX_NIM).await,
            Handler::StopNim => containers::stop(self, &config, FLUX_NIM).await,
            Handler::CheckFluxKontextNimStatus => {
                containers::status(self, &config, FLUX_KONTEXT_NIM).await
            }
            Handler::StartFluxKontextNim => containers::start(self, &config, FLUX_KONTEXT_NIM).await,
            Handler::StopFluxKontextNim => containers::stop(self, &config, FLUX_KONTEXT_NIM).await,
            Handler::GenerateImage => generate::generate_image(self, &config, params),
            Handler::GenerateImageUsingKontext => generate::generate_using_kontext(self, &config, params),
            Handler::InvokeAiStatus => invokeai::status(self, &config).await,
            Handler::PauseInvokeAiProcessor => invokeai::pause(self, &config).await,
            Handler::ResumeInvokeAiProcessor => invokeai::resume(self, &config).await,
            Handler::InvokeAiEmptyModelCache => invokeai::empty_model_cache(self, &config).await,
            Handler::ComfyUiStatus => comfyui::status(self, &config).await,
            Handler::ComfyUiFreeMemory => comfyui::free_memory(self, &config, params).await,
        }
    }
}

/// Answer frames until the host sends `shutdown` or closes the pipe.
///
/// Every call in a frame is dispatched in order and the last response is
/// sent. Frames that cannot be read are skipped without a reply.
pub async fn serve<R, W>(plugin: &Plugin, transport: &mut PipeTransport<R, W>)
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    info!("Plugin started");
    loop {
        let frame = match transport.receive().await {
            Ok(Some(frame)) => frame,
            Ok(None) => {
                info!("Command pipe closed");
                break;
            }
            Err(e) => {
                warn!(error = %e, "Error reading command");
                continue;
            }
        };

        let mut response = Response::failure(format!("{ERROR_PREFIX} Malformed input."));
        let mut last_command = None;
        for call in frame.into_calls() {
            match call {
                Call::Command(command) => {
                    response = plugin.dispatch(&command).await;
                    last_command = Some(command.name);
                }
                Call::Malformed => {
                    warn!("Malformed input: missing function property");
                    response = Response::failure(format!("{ERROR_PREFIX} Malformed input."));
                }
            }
        }

        debug!(success = response.success, message = ?response.message, "Sending response");
        transport.send(&response).await;

        if last_command.as_deref() == Some(Handler::Shutdown.name()) {
            info!("Shutdown command received, terminating plugin");
            break;
        }
    }
}
