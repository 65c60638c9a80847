//! Execution monitor for event-streaming backends.
//!
//! After a graph is enqueued, the monitor follows the backend's event stream
//! until the prompt finishes, fails or runs out of time, collecting any
//! images pushed over the stream. When the stream yields nothing usable it
//! falls back to a single history lookup, which covers both a dropped stream
//! and a run that finished before the stream was attached.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{PluginError, Result};

/// Node id of the save step in the bundled ComfyUI workflow.
pub const DEFAULT_TERMINAL_NODE: &str = "1";

/// Monitor timing knobs.
#[derive(Debug, Clone)]
pub struct MonitorSettings {
    /// Wall-clock budget of a session, counted from its creation.
    pub deadline: Duration,
    /// How long a single read may idle before the deadline is re-checked.
    pub read_timeout: Duration,
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self {
            deadline: Duration::from_secs(300),
            read_timeout: Duration::from_secs(5),
        }
    }
}

/// Lifecycle of one enqueued prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Queued,
    Monitoring,
    Completed,
    TimedOut,
    Failed,
}

impl SessionState {
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::TimedOut | Self::Failed)
    }
}

/// Tracking record for one enqueued prompt.
#[derive(Debug)]
pub struct ExecutionSession {
    pub client_id: Uuid,
    pub prompt_id: String,
    /// Node whose outputs are the final images.
    pub terminal_node: String,
    /// Wall-clock end of monitoring, fixed when the session is created.
    deadline: Instant,
    state: SessionState,
}

impl ExecutionSession {
    pub fn new(
        client_id: Uuid,
        prompt_id: impl Into<String>,
        terminal_node: impl Into<String>,
        budget: Duration,
    ) -> Self {
        Self {
            client_id,
            prompt_id: prompt_id.into(),
            terminal_node: terminal_node.into(),
            deadline: Instant::now() + budget,
            state: SessionState::Queued,
        }
    }

    pub const fn state(&self) -> SessionState {
        self.state
    }

    pub const fn deadline(&self) -> Instant {
        self.deadline
    }

    /// Move to `next`. Terminal states are final; later transitions are ignored.
    fn transition(&mut self, next: SessionState) -> bool {
        if self.state.is_terminal() {
            warn!(
                prompt_id = %self.prompt_id,
                from = ?self.state,
                to = ?next,
                "Ignoring transition out of terminal state"
            );
            return false;
        }
        debug!(prompt_id = %self.prompt_id, from = ?self.state, to = ?next, "Session transition");
        self.state = next;
        true
    }
}

/// Location of an image held by the backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageRef {
    pub filename: String,
    pub subfolder: String,
    pub kind: String,
}

impl ImageRef {
    /// Parse one entry of an `images` output array.
    pub fn from_value(value: &Value) -> Option<Self> {
        let filename = value.get("filename")?.as_str()?;
        Some(Self {
            filename: filename.to_string(),
            subfolder: value
                .get("subfolder")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            kind: value
                .get("type")
                .and_then(Value::as_str)
                .unwrap_or("output")
                .to_string(),
        })
    }

    /// Parse an `images` output array, skipping unusable entries.
    pub fn list(images: &Value) -> Vec<Self> {
        images
            .as_array()
            .map(|items| items.iter().filter_map(Self::from_value).collect())
            .unwrap_or_default()
    }
}

/// A message received from the event stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamMessage {
    Text(String),
    Binary(Vec<u8>),
}

/// Outcome of one bounded read from the event stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamRead {
    Message(StreamMessage),
    /// Nothing arrived within the read timeout.
    Idle,
    Closed,
    Failed(String),
}

/// Source of execution events for one client id.
#[async_trait]
pub trait EventStream: Send {
    /// Wait at most `timeout` for the next message.
    async fn next_message(&mut self, timeout: Duration) -> StreamRead;

    async fn close(&mut self) {}
}

/// Lookup of finished results, used when the stream path yields nothing.
#[async_trait]
pub trait ResultStore: Send + Sync {
    /// Images recorded for `node_id` of `prompt_id`, or `None` if the prompt
    /// has no history entry yet.
    async fn history_images(&self, prompt_id: &str, node_id: &str) -> Result<Option<Vec<ImageRef>>>;

    async fn fetch_image(&self, image: &ImageRef) -> Result<Vec<u8>>;
}

/// Where the resolved images came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageSource {
    /// Binary frames pushed over the stream.
    Stream,
    /// Descriptors carried by the terminal node's `executed` event.
    ExecutedEvent,
    /// History lookup after the stream finished.
    History,
    None,
}

/// Final result of monitoring one session.
#[derive(Debug)]
pub struct Resolution {
    pub state: SessionState,
    pub images: Vec<Vec<u8>>,
    pub source: ImageSource,
    /// Error reported by the backend or the stream, if any.
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum StreamVerdict {
    Finished,
    TimedOut,
    Failed(String),
}

#[derive(Debug)]
struct StreamPhase {
    verdict: StreamVerdict,
    binary: Vec<Vec<u8>>,
    executed: Vec<ImageRef>,
}

impl StreamPhase {
    const fn ended(verdict: StreamVerdict) -> Self {
        Self {
            verdict,
            binary: Vec::new(),
            executed: Vec::new(),
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
enum Event {
    Finished,
    Executed(Vec<ImageRef>),
    ExecutionError(String),
    Progress(u64, u64),
    Other,
}

/// Classify a text message for `session`. Messages for other prompts are `Other`.
fn classify(text: &str, session: &ExecutionSession) -> Event {
    let Ok(message) = serde_json::from_str::<Value>(text) else {
        return Event::Other;
    };
    let kind = message.get("type").and_then(Value::as_str).unwrap_or_default();
    let Some(data) = message.get("data") else {
        return Event::Other;
    };
    let prompt_id = data.get("prompt_id").and_then(Value::as_str);
    let ours = prompt_id == Some(session.prompt_id.as_str());

    match kind {
        "executing" if ours => match data.get("node") {
            None | Some(Value::Null) => Event::Finished,
            Some(Value::String(node)) if node.is_empty() => Event::Finished,
            _ => Event::Other,
        },
        // Older servers omit prompt_id on `executed`
        "executed" if ours || prompt_id.is_none() => {
            let node = data.get("node").and_then(Value::as_str);
            if node != Some(session.terminal_node.as_str()) {
                return Event::Other;
            }
            data.pointer("/output/images")
                .map_or(Event::Other, |images| Event::Executed(ImageRef::list(images)))
        }
        "execution_error" if ours => Event::ExecutionError(
            data.get("exception_message")
                .and_then(Value::as_str)
                .unwrap_or("Unknown error")
                .to_string(),
        ),
        "progress" if ours || prompt_id.is_none() => Event::Progress(
            data.get("value").and_then(Value::as_u64).unwrap_or(0),
            data.get("max").and_then(Value::as_u64).unwrap_or(0),
        ),
        _ => Event::Other,
    }
}

const PNG_MAGIC: &[u8] = b"\x89PNG";
const JPEG_MAGIC: &[u8] = b"\xFF\xD8\xFF";

/// Image payload of a binary frame.
///
/// ComfyUI prefixes image frames with an 8-byte header (event type, format).
/// The header is stripped when the payload after it is a recognizable image;
/// anything else is kept as-is.
pub fn frame_payload(frame: Vec<u8>) -> Vec<u8> {
    let is_image = |bytes: &[u8]| bytes.starts_with(PNG_MAGIC) || bytes.starts_with(JPEG_MAGIC);
    if frame.len() > 8 && !is_image(&frame) && is_image(&frame[8..]) {
        return frame[8..].to_vec();
    }
    frame
}

/// Follows one session to a terminal state.
pub struct ExecutionMonitor<'a, S: ?Sized> {
    store: &'a S,
    settings: MonitorSettings,
}

impl<'a, S: ResultStore + ?Sized> ExecutionMonitor<'a, S> {
    pub const fn new(store: &'a S, settings: MonitorSettings) -> Self {
        Self { store, settings }
    }

    /// Monitor `session` over `stream` and resolve its images.
    ///
    /// `stream` is the result of attaching to the event stream; an attach
    /// failure goes straight to the history fallback.
    pub async fn run<E: EventStream>(
        &self,
        session: &mut ExecutionSession,
        stream: Result<E>,
    ) -> Resolution {
        session.transition(SessionState::Monitoring);

        let phase = match stream {
            Ok(mut stream) => {
                let phase = self.watch(session, &mut stream).await;
                stream.close().await;
                phase
            }
            Err(e) => {
                warn!(prompt_id = %session.prompt_id, error = %e, "Event stream unavailable");
                StreamPhase::ended(StreamVerdict::Failed(e.to_string()))
            }
        };

        if phase.verdict == StreamVerdict::Finished {
            session.transition(SessionState::Completed);
        }

        let (images, source) = self.resolve_images(session, phase.binary, &phase.executed).await;

        if !session.state().is_terminal() {
            let next = match (&phase.verdict, images.is_empty()) {
                (_, false) => SessionState::Completed,
                (StreamVerdict::TimedOut, true) => SessionState::TimedOut,
                _ => SessionState::Failed,
            };
            session.transition(next);
        }

        let stream_error = match phase.verdict {
            StreamVerdict::Failed(message) => Some(message),
            StreamVerdict::TimedOut => Some(format!(
                "No completion within {}s",
                self.settings.deadline.as_secs()
            )),
            StreamVerdict::Finished => None,
        };
        // A stream problem the fallback recovered from is not an error
        let error = if session.state() == SessionState::Completed {
            if let Some(message) = &stream_error {
                debug!(prompt_id = %session.prompt_id, %message, "Stream phase ended early, recovered");
            }
            None
        } else {
            stream_error
        };

        info!(
            prompt_id = %session.prompt_id,
            state = ?session.state(),
            images = images.len(),
            ?source,
            "Monitoring finished"
        );

        Resolution {
            state: session.state(),
            images,
            source,
            error,
        }
    }

    async fn watch<E: EventStream>(&self, session: &ExecutionSession, stream: &mut E) -> StreamPhase {
        let deadline = session.deadline;
        let mut binary = Vec::new();
        let mut executed = Vec::new();

        let verdict = loop {
            let now = Instant::now();
            if now >= deadline {
                warn!(prompt_id = %session.prompt_id, "Deadline reached while monitoring");
                break StreamVerdict::TimedOut;
            }
            let wait = self.settings.read_timeout.min(deadline - now);

            match stream.next_message(wait).await {
                StreamRead::Idle => {}
                StreamRead::Closed => {
                    break StreamVerdict::Failed("Event stream closed before completion".into());
                }
                StreamRead::Failed(e) => break StreamVerdict::Failed(e),
                StreamRead::Message(StreamMessage::Binary(frame)) => {
                    let payload = frame_payload(frame);
                    debug!(prompt_id = %session.prompt_id, len = payload.len(), "Received image frame");
                    binary.push(payload);
                }
                StreamRead::Message(StreamMessage::Text(text)) => match classify(&text, session) {
                    Event::Finished => break StreamVerdict::Finished,
                    Event::Executed(images) => {
                        debug!(prompt_id = %session.prompt_id, count = images.len(), "Terminal node executed");
                        if !images.is_empty() {
                            executed = images;
                            break StreamVerdict::Finished;
                        }
                    }
                    Event::ExecutionError(message) => {
                        break StreamVerdict::Failed(format!("Execution error: {message}"));
                    }
                    Event::Progress(value, max) => {
                        debug!(prompt_id = %session.prompt_id, value, max, "Progress");
                    }
                    Event::Other => {}
                },
            }
        };

        StreamPhase {
            verdict,
            binary,
            executed,
        }
    }

    /// Stream bytes win, then executed-event descriptors, then history.
    async fn resolve_images(
        &self,
        session: &ExecutionSession,
        binary: Vec<Vec<u8>>,
        executed: &[ImageRef],
    ) -> (Vec<Vec<u8>>, ImageSource) {
        if !binary.is_empty() {
            return (binary, ImageSource::Stream);
        }
        if !executed.is_empty() {
            let images = self.download(executed).await;
            if !images.is_empty() {
                return (images, ImageSource::ExecutedEvent);
            }
        }

        info!(prompt_id = %session.prompt_id, "Looking up results in history");
        match self
            .store
            .history_images(&session.prompt_id, &session.terminal_node)
            .await
        {
            Ok(Some(refs)) => {
                let images = self.download(&refs).await;
                let source = if images.is_empty() {
                    ImageSource::None
                } else {
                    ImageSource::History
                };
                (images, source)
            }
            Ok(None) => {
                warn!(prompt_id = %session.prompt_id, "Prompt not found in history");
                (Vec::new(), ImageSource::None)
            }
            Err(e) => {
                warn!(prompt_id = %session.prompt_id, error = %e, "History lookup failed");
                (Vec::new(), ImageSource::None)
            }
        }
    }

    async fn download(&self, refs: &[ImageRef]) -> Vec<Vec<u8>> {
        let mut images = Vec::with_capacity(refs.len());
        for image in refs {
            match self.store.fetch_image(image).await {
                Ok(bytes) => images.push(bytes),
                Err(e) => warn!(filename = %image.filename, error = %e, "Failed to download image"),
            }
        }
        images
    }
}

impl Resolution {
    /// Images, or an error describing why there are none.
    pub fn into_images(self) -> Result<Vec<Vec<u8>>> {
        if !self.images.is_empty() {
            return Ok(self.images);
        }
        let reason = self.error.map_or_else(String::new, |e| format!(" ({e})"));
        Err(PluginError::protocol(format!(
            "No output images received from workflow, session {:?}{reason}",
            self.state
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::{HashMap, VecDeque};
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Replays scripted reads. An exhausted script idles for the full timeout.
    struct ScriptedStream {
        script: VecDeque<StreamRead>,
    }

    impl ScriptedStream {
        fn new(script: impl IntoIterator<Item = StreamRead>) -> Self {
            Self {
                script: script.into_iter().collect(),
            }
        }
    }

    #[async_trait]
    impl EventStream for ScriptedStream {
        async fn next_message(&mut self, timeout: Duration) -> StreamRead {
            if let Some(read) = self.script.pop_front() {
                return read;
            }
            tokio::time::sleep(timeout).await;
            StreamRead::Idle
        }
    }

    #[derive(Default)]
    struct FakeStore {
        history: HashMap<String, Vec<ImageRef>>,
        files: HashMap<String, Vec<u8>>,
        history_calls: AtomicUsize,
        fetch_calls: AtomicUsize,
    }

    impl FakeStore {
        fn with_output(prompt_id: &str, filename: &str, bytes: &[u8]) -> Self {
            let mut store = Self::default();
            store.history.insert(prompt_id.into(), vec![image_ref(filename)]);
            store.files.insert(filename.into(), bytes.to_vec());
            store
        }
    }

    #[async_trait]
    impl ResultStore for FakeStore {
        async fn history_images(&self, prompt_id: &str, _node_id: &str) -> Result<Option<Vec<ImageRef>>> {
            self.history_calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.history.get(prompt_id).cloned())
        }

        async fn fetch_image(&self, image: &ImageRef) -> Result<Vec<u8>> {
            self.fetch_calls.fetch_add(1, Ordering::SeqCst);
            self.files
                .get(&image.filename)
                .cloned()
                .ok_or_else(|| PluginError::protocol("missing file"))
        }
    }

    fn image_ref(filename: &str) -> ImageRef {
        ImageRef {
            filename: filename.into(),
            subfolder: String::new(),
            kind: "output".into(),
        }
    }

    fn text(value: Value) -> StreamRead {
        StreamRead::Message(StreamMessage::Text(value.to_string()))
    }

    fn session() -> ExecutionSession {
        ExecutionSession::new(Uuid::new_v4(), "P", DEFAULT_TERMINAL_NODE, fast().deadline)
    }

    fn fast() -> MonitorSettings {
        MonitorSettings {
            deadline: Duration::from_millis(200),
            read_timeout: Duration::from_millis(20),
        }
    }

    #[tokio::test]
    async fn completion_with_streamed_bytes_skips_history() {
        let store = FakeStore::default();
        let stream = ScriptedStream::new([
            text(json!({"type": "executing", "data": {"node": "3", "prompt_id": "P"}})),
            StreamRead::Message(StreamMessage::Binary(b"\x89PNGdata".to_vec())),
            text(json!({"type": "executing", "data": {"node": null, "prompt_id": "P"}})),
        ]);

        let mut session = session();
        let resolution = ExecutionMonitor::new(&store, fast()).run(&mut session, Ok(stream)).await;

        assert_eq!(session.state(), SessionState::Completed);
        assert_eq!(resolution.source, ImageSource::Stream);
        assert_eq!(resolution.images, vec![b"\x89PNGdata".to_vec()]);
        assert_eq!(store.history_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn completion_without_bytes_reads_history() {
        let store = FakeStore::with_output("P", "out.png", b"img");
        let stream = ScriptedStream::new([text(
            json!({"type": "executing", "data": {"node": null, "prompt_id": "P"}}),
        )]);

        let mut session = session();
        let resolution = ExecutionMonitor::new(&store, fast()).run(&mut session, Ok(stream)).await;

        assert_eq!(resolution.state, SessionState::Completed);
        assert_eq!(resolution.source, ImageSource::History);
        assert_eq!(resolution.images, vec![b"img".to_vec()]);
    }

    #[tokio::test]
    async fn silent_stream_times_out_then_falls_back() {
        let store = FakeStore::with_output("P", "late.png", b"late");
        let started = std::time::Instant::now();
        let mut session = session();

        let resolution = ExecutionMonitor::new(&store, fast())
            .run(&mut session, Ok(ScriptedStream::new([])))
            .await;

        assert!(started.elapsed() >= Duration::from_millis(200));
        assert_eq!(store.history_calls.load(Ordering::SeqCst), 1);
        // Fallback found the image, so the session still completes
        assert_eq!(resolution.state, SessionState::Completed);
        assert_eq!(resolution.source, ImageSource::History);
        assert_eq!(resolution.error, None);
    }

    #[tokio::test]
    async fn partial_history_download_still_completes() {
        let mut store = FakeStore::default();
        store.history.insert(
            "P".into(),
            vec![image_ref("a.png"), image_ref("gone.png"), image_ref("c.png")],
        );
        store.files.insert("a.png".into(), b"a".to_vec());
        store.files.insert("c.png".into(), b"c".to_vec());
        let mut session = session();

        let resolution = ExecutionMonitor::new(&store, fast())
            .run(&mut session, Ok(ScriptedStream::new([])))
            .await;

        assert_eq!(resolution.state, SessionState::Completed);
        assert_eq!(resolution.source, ImageSource::History);
        assert_eq!(resolution.images, vec![b"a".to_vec(), b"c".to_vec()]);
        assert_eq!(store.fetch_calls.load(Ordering::SeqCst), 3);
        assert_eq!(resolution.error, None);
    }

    #[tokio::test]
    async fn deadline_runs_from_session_creation() {
        let store = FakeStore::default();
        let mut session = session();
        tokio::time::sleep(Duration::from_millis(150)).await;

        let started = std::time::Instant::now();
        let resolution = ExecutionMonitor::new(&store, fast())
            .run(&mut session, Ok(ScriptedStream::new([])))
            .await;

        // 200ms budget, 150ms of it spent before monitoring began
        assert!(started.elapsed() < Duration::from_millis(150));
        assert_eq!(resolution.state, SessionState::TimedOut);
    }

    #[tokio::test]
    async fn silent_stream_with_empty_history_times_out() {
        let store = FakeStore::default();
        let mut session = session();

        let resolution = ExecutionMonitor::new(&store, fast())
            .run(&mut session, Ok(ScriptedStream::new([])))
            .await;

        assert_eq!(resolution.state, SessionState::TimedOut);
        assert_eq!(store.history_calls.load(Ordering::SeqCst), 1);
        assert!(resolution.into_images().is_err());
    }

    #[tokio::test]
    async fn other_prompts_are_ignored() {
        let store = FakeStore::default();
        let stream = ScriptedStream::new([
            text(json!({"type": "executing", "data": {"node": null, "prompt_id": "OTHER"}})),
            text(json!({"type": "execution_error", "data": {"prompt_id": "OTHER", "exception_message": "boom"}})),
        ]);
        let mut session = session();

        let resolution = ExecutionMonitor::new(&store, fast()).run(&mut session, Ok(stream)).await;

        assert_eq!(resolution.state, SessionState::TimedOut);
    }

    #[tokio::test]
    async fn execution_error_fails_the_stream() {
        let store = FakeStore::default();
        let stream = ScriptedStream::new([text(json!({
            "type": "execution_error",
            "data": {"prompt_id": "P", "exception_message": "CUDA out of memory"}
        }))]);
        let mut session = session();

        let resolution = ExecutionMonitor::new(&store, fast()).run(&mut session, Ok(stream)).await;

        assert_eq!(resolution.state, SessionState::Failed);
        assert!(resolution.error.as_deref().unwrap().contains("CUDA out of memory"));
        assert_eq!(store.history_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn executed_event_downloads_descriptors() {
        let store = FakeStore::with_output("unused", "final.png", b"final");
        let stream = ScriptedStream::new([
            text(json!({
                "type": "executed",
                "data": {"node": "1", "prompt_id": "P", "output": {"images": [
                    {"filename": "final.png", "subfolder": "", "type": "output"}
                ]}}
            })),
            text(json!({"type": "executing", "data": {"node": null, "prompt_id": "P"}})),
        ]);
        let mut session = session();

        let resolution = ExecutionMonitor::new(&store, fast()).run(&mut session, Ok(stream)).await;

        assert_eq!(resolution.source, ImageSource::ExecutedEvent);
        assert_eq!(resolution.images, vec![b"final".to_vec()]);
        assert_eq!(store.history_calls.load(Ordering::SeqCst), 0);
        assert_eq!(store.fetch_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn executed_event_ends_the_stream_phase() {
        let store = FakeStore::with_output("unused", "final.png", b"final");
        let stream = ScriptedStream::new([text(json!({
            "type": "executed",
            "data": {"node": "1", "prompt_id": "P", "output": {"images": [
                {"filename": "final.png", "subfolder": "", "type": "output"}
            ]}}
        }))]);
        let settings = MonitorSettings {
            deadline: Duration::from_secs(3),
            read_timeout: Duration::from_millis(100),
        };
        let mut session = ExecutionSession::new(Uuid::new_v4(), "P", DEFAULT_TERMINAL_NODE, settings.deadline);
        let started = std::time::Instant::now();

        let resolution = ExecutionMonitor::new(&store, settings).run(&mut session, Ok(stream)).await;

        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(resolution.state, SessionState::Completed);
        assert_eq!(resolution.source, ImageSource::ExecutedEvent);
        assert_eq!(resolution.images, vec![b"final".to_vec()]);
        assert_eq!(resolution.error, None);
        assert_eq!(store.history_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn attach_failure_goes_to_history() {
        let store = FakeStore::with_output("P", "out.png", b"img");
        let mut session = session();

        let resolution = ExecutionMonitor::new(&store, fast())
            .run::<ScriptedStream>(&mut session, Err(PluginError::protocol("refused")))
            .await;

        assert_eq!(resolution.state, SessionState::Completed);
        assert_eq!(resolution.source, ImageSource::History);
    }

    #[tokio::test]
    async fn closed_stream_without_results_fails() {
        let store = FakeStore::default();
        let mut session = session();

        let resolution = ExecutionMonitor::new(&store, fast())
            .run(&mut session, Ok(ScriptedStream::new([StreamRead::Closed])))
            .await;

        assert_eq!(resolution.state, SessionState::Failed);
    }

    #[test]
    fn terminal_state_is_final() {
        let mut session = session();
        assert!(session.transition(SessionState::Monitoring));
        assert!(session.transition(SessionState::Completed));
        assert!(!session.transition(SessionState::Failed));
        assert_eq!(session.state(), SessionState::Completed);
    }

    #[test]
    fn frame_header_is_stripped_only_before_images() {
        let mut framed = vec![0, 0, 0, 1, 0, 0, 0, 2];
        framed.extend_from_slice(b"\x89PNGrest");
        assert_eq!(frame_payload(framed), b"\x89PNGrest".to_vec());

        let raw = b"\x89PNGalready-raw".to_vec();
        assert_eq!(frame_payload(raw.clone()), raw);

        let opaque = vec![1, 2, 3, 4, 5, 6, 7, 8, 9, 10];
        assert_eq!(frame_payload(opaque.clone()), opaque);
    }

    #[test]
    fn empty_node_string_finishes() {
        let session = session();
        let event = classify(
            &json!({"type": "executing", "data": {"node": "", "prompt_id": "P"}}).to_string(),
            &session,
        );
        assert_eq!(event, Event::Finished);
        assert_eq!(classify("not json", &session), Event::Other);
    }
}
