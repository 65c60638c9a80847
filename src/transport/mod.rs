//! Pipe transport between the host and the plugin.
//!
//! Frames are whole JSON documents. Inbound frames are read in fixed-size
//! chunks until a short chunk arrives; outbound responses are terminated
//! by a literal sentinel instead of a length prefix.

pub mod protocol;

pub use protocol::{Call, Command, CommandFrame, Response, Status};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, error};

use crate::error::{PluginError, Result};

/// Size of a single pipe read.
pub const CHUNK_SIZE: usize = 4096;

/// Maximum inbound frame size (16 MB). Safety valve against a runaway writer.
const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Appended to every outbound response.
pub const SENTINEL: &str = "<<END>>";

/// Read one frame's raw bytes.
///
/// Keeps reading while each read fills a whole chunk and stops at the first
/// short or empty read. All chunks are concatenated. Returns `None` when the
/// pipe is closed before any byte of a new frame arrives.
pub async fn recv_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Option<Vec<u8>>> {
    let mut frame = Vec::new();
    let mut chunk = vec![0u8; CHUNK_SIZE];

    loop {
        let n = reader
            .read(&mut chunk)
            .await
            .map_err(|e| PluginError::Transport(format!("Error reading from command pipe: {e}")))?;
        frame.extend_from_slice(&chunk[..n]);

        if frame.len() > MAX_FRAME_SIZE {
            return Err(PluginError::Transport(format!(
                "Frame exceeds max size: {} > {MAX_FRAME_SIZE}",
                frame.len()
            )));
        }
        if n < CHUNK_SIZE {
            break;
        }
    }

    if frame.is_empty() {
        return Ok(None);
    }
    Ok(Some(frame))
}

/// Write a payload followed by [`SENTINEL`] in a single write.
pub async fn send_frame<W: AsyncWrite + Unpin>(writer: &mut W, payload: &[u8]) -> Result<()> {
    let mut message = Vec::with_capacity(payload.len() + SENTINEL.len());
    message.extend_from_slice(payload);
    message.extend_from_slice(SENTINEL.as_bytes());

    writer
        .write_all(&message)
        .await
        .map_err(|e| PluginError::Transport(format!("Failed to write response: {e}")))?;
    writer
        .flush()
        .await
        .map_err(|e| PluginError::Transport(format!("Failed to flush response: {e}")))?;
    Ok(())
}

/// Reads command frames from one byte stream and writes responses to another.
pub struct PipeTransport<R, W> {
    reader: R,
    writer: W,
}

impl PipeTransport<tokio::io::Stdin, tokio::io::Stdout> {
    /// Transport over the process's own stdin/stdout.
    pub fn stdio() -> Self {
        Self::new(tokio::io::stdin(), tokio::io::stdout())
    }
}

impl<R: AsyncRead + Unpin, W: AsyncWrite + Unpin> PipeTransport<R, W> {
    pub const fn new(reader: R, writer: W) -> Self {
        Self { reader, writer }
    }

    /// Receive and decode the next frame.
    ///
    /// `Ok(None)` means the host closed the pipe. A `Transport` error means
    /// this frame produced no command; the caller should keep looping.
    pub async fn receive(&mut self) -> Result<Option<CommandFrame>> {
        let Some(bytes) = recv_frame(&mut self.reader).await? else {
            return Ok(None);
        };
        debug!(len = bytes.len(), "Received frame");

        let text = std::str::from_utf8(&bytes)
            .map_err(|e| PluginError::Transport(format!("Frame is not valid UTF-8: {e}")))?;
        let frame = serde_json::from_str(text)
            .map_err(|e| PluginError::Transport(format!("Failed to decode JSON input: {e}")))?;
        Ok(Some(frame))
    }

    /// Send a response. Failures are logged, never returned.
    pub async fn send(&mut self, response: &Response) {
        let payload = match serde_json::to_vec(response) {
            Ok(payload) => payload,
            Err(e) => {
                error!(error = %e, "Failed to serialize response");
                return;
            }
        };
        if let Err(e) = send_frame(&mut self.writer, &payload).await {
            error!(error = %e, "Failed to write response");
        }
    }

    pub const fn writer(&self) -> &W {
        &self.writer
    }
}
