use std::{collections::HashMap, sync::Arc};

use metrics::counter;
use thiserror::Error;
use tidewatch_proto::{Command, CommandVerb, Status};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    capture::{CaptureConfig, CaptureSource},
    connection::{Connection, TransportError},
    error::CommandError,
    files::FileService,
    recording::{run_recording, Recorder, RecordingDuration},
    transfer::stream_file,
};

#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
    #[error("{0}")]
    Failed(String),
}

/// What a command answers with immediately.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Status(Status),
    /// Sent verbatim, e.g. `PONG` or an echo.
    Text(String),
}

impl Reply {
    pub fn into_text(self) -> serde_json::Result<String> {
        match self {
            Reply::Status(status) => serde_json::to_string(&status),
            Reply::Text(text) => Ok(text),
        }
    }

    fn error(err: &CommandError) -> Self {
        Reply::Status(err.to_status())
    }

    fn info(message: impl Into<String>) -> Self {
        Reply::Status(Status::info(message))
    }
}

/// Synchronous command handler. Runs on the receive loop, so it must return
/// on an OS-call timescale.
pub trait Handler: Send + Sync {
    fn handle(&self, arg: &str) -> Result<Reply, HandlerError>;
}

impl<F> Handler for F
where
    F: Fn(&str) -> Result<Reply, HandlerError> + Send + Sync,
{
    fn handle(&self, arg: &str) -> Result<Reply, HandlerError> {
        self(arg)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct PingHandler;

impl Handler for PingHandler {
    fn handle(&self, _arg: &str) -> Result<Reply, HandlerError> {
        Ok(Reply::Text("PONG".into()))
    }
}

/// Per-connection state the router needs.
#[derive(Debug, Clone)]
pub struct PeerSession {
    connection: Arc<Connection>,
    recorder: Arc<Recorder>,
}

impl PeerSession {
    pub fn new(connection: Arc<Connection>) -> Self {
        Self {
            connection,
            recorder: Arc::new(Recorder::new()),
        }
    }

    pub fn connection(&self) -> &Arc<Connection> {
        &self.connection
    }

    pub fn recorder(&self) -> &Arc<Recorder> {
        &self.recorder
    }
}

/// Maps verbs to handlers and producers.
pub struct Router {
    handlers: HashMap<String, Arc<dyn Handler>>,
    files: Arc<FileService>,
    camera: Arc<dyn CaptureSource>,
    capture: CaptureConfig,
}

impl Router {
    pub fn new(files: Arc<FileService>, camera: Arc<dyn CaptureSource>) -> Self {
        Self {
            handlers: HashMap::new(),
            files,
            camera,
            capture: CaptureConfig::default(),
        }
    }

    pub fn with_capture_config(mut self, capture: CaptureConfig) -> Self {
        self.capture = capture;
        self
    }

    pub fn with_handler(mut self, verb: impl Into<String>, handler: impl Handler + 'static) -> Self {
        self.register(verb, handler);
        self
    }

    pub fn register(&mut self, verb: impl Into<String>, handler: impl Handler + 'static) {
        self.handlers.insert(verb.into(), Arc::new(handler));
    }

    pub fn files(&self) -> &FileService {
        &self.files
    }

    pub fn camera_name(&self) -> &str {
        self.camera.name()
    }

    /// Dispatches one inbound text message and sends the immediate reply.
    pub async fn handle_message(
        &self,
        session: &PeerSession,
        text: &str,
    ) -> Result<(), TransportError> {
        let Some(reply) = self.dispatch(session, text) else {
            return Ok(());
        };
        let text = reply.into_text()?;
        session.connection.send_text(text).await
    }

    /// Parses `text` and either answers it inline or launches a producer and
    /// acknowledges it. Unknown verbs are echoed. Returns `None` for blank
    /// input.
    pub fn dispatch(&self, session: &PeerSession, text: &str) -> Option<Reply> {
        let command = Command::parse(text)?;
        let verb = command.known_verb();
        counter!(
            "tidewatch_commands_total",
            1,
            "verb" => verb.map(CommandVerb::as_str).unwrap_or("other")
        );
        debug!(
            connection_id = %session.connection.id(),
            verb = command.verb,
            "dispatching command"
        );

        let result = match verb {
            Some(CommandVerb::ListDir) => self.start_listing(session, command.arg),
            Some(CommandVerb::DownloadFile) => self.start_download(session, command.arg),
            Some(CommandVerb::StartCam) => self.start_recording(session, command.arg),
            Some(CommandVerb::StopCam) => session
                .recorder
                .stop()
                .map(|()| Reply::info("Stopping recording...")),
            Some(CommandVerb::Ping) | None => match self.handlers.get(command.verb) {
                Some(handler) => handler.handle(command.arg).map_err(CommandError::from),
                None => Ok(Reply::Text(text.to_string())),
            },
        };

        Some(result.unwrap_or_else(|err| {
            info!(
                connection_id = %session.connection.id(),
                verb = command.verb,
                kind = err.kind(),
                error = %err,
                "command rejected"
            );
            counter!("tidewatch_command_errors_total", 1, "kind" => err.kind());
            Reply::error(&err)
        }))
    }

    fn start_listing(&self, session: &PeerSession, arg: &str) -> Result<Reply, CommandError> {
        if arg.is_empty() {
            return Err(CommandError::missing_argument(CommandVerb::ListDir.as_str()));
        }
        let connection = Arc::clone(&session.connection);
        let files = Arc::clone(&self.files);
        let path = arg.to_string();
        spawn_producer(session.connection.lifetime(), async move {
            match files.list_dir(&path).await {
                Ok(listing) => {
                    let _ = connection.send(&listing).await;
                }
                Err(err) => {
                    let _ = connection.send(&CommandError::from(err).to_status()).await;
                }
            }
        });
        Ok(Reply::info("Listing directory..."))
    }

    fn start_download(&self, session: &PeerSession, arg: &str) -> Result<Reply, CommandError> {
        if arg.is_empty() {
            return Err(CommandError::missing_argument(
                CommandVerb::DownloadFile.as_str(),
            ));
        }
        let connection = Arc::clone(&session.connection);
        let files = Arc::clone(&self.files);
        let key = arg.to_string();
        let cancel = session.connection.lifetime().child_token();
        tokio::spawn(async move {
            let outcome = stream_file(&connection, &files, &key, &cancel).await;
            debug!(connection_id = %connection.id(), key, ?outcome, "download producer finished");
        });
        Ok(Reply::info("Starting download..."))
    }

    fn start_recording(&self, session: &PeerSession, arg: &str) -> Result<Reply, CommandError> {
        let duration = RecordingDuration::parse(arg)?;
        let ticket = session.recorder.begin(session.connection.lifetime())?;
        // Dropping the ticket on failure puts the recorder back to Idle.
        let device = self.camera.open(&self.capture)?;

        let connection = Arc::clone(&session.connection);
        tokio::spawn(async move {
            let connection_id = connection.id();
            let outcome = run_recording(connection, ticket, device, duration).await;
            debug!(%connection_id, ?outcome, "recording producer finished");
        });
        Ok(Reply::info(format!(
            "Starting camera ({}s)...",
            duration.secs()
        )))
    }
}

/// Runs `work` until it completes or the connection's lifetime ends.
fn spawn_producer<F>(lifetime: &CancellationToken, work: F)
where
    F: std::future::Future<Output = ()> + Send + 'static,
{
    let cancel = lifetime.child_token();
    tokio::spawn(async move {
        tokio::select! {
            _ = cancel.cancelled() => warn!("producer cancelled with its connection"),
            _ = work => {}
        }
    });
}
