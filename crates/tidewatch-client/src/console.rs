use tidewatch_proto::{FileEntry, Handshake, ServerEvent, ServerMessage, Status};
use tracing::{debug, warn};

use crate::{
    player::FramePlayer,
    reassembler::{CompletedDownload, DecodeError, Reassembler},
};

/// Something the operator should see.
#[derive(Debug)]
pub enum ConsoleEvent {
    Handshake(Handshake),
    Status(Status),
    Listing {
        path: String,
        items: Vec<FileEntry>,
    },
    DownloadStarted {
        path: String,
        size: u64,
        content_type: String,
    },
    DownloadComplete(CompletedDownload),
    DownloadFailed {
        path: String,
        error: DecodeError,
    },
    RecordingStarted,
    RecordingLoading {
        count: u64,
    },
    RecordingReady {
        frames: usize,
    },
    RecordingEmpty,
    /// Plain text that is not an envelope: `PONG`, echoes.
    Echo(String),
}

/// Demultiplexes inbound messages into the reassembler and frame player.
#[derive(Debug, Default)]
pub struct Console {
    reassembler: Reassembler,
    player: FramePlayer,
}

impl Console {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn player(&self) -> &FramePlayer {
        &self.player
    }

    pub fn player_mut(&mut self) -> &mut FramePlayer {
        &mut self.player
    }

    pub fn reassembler(&self) -> &Reassembler {
        &self.reassembler
    }

    /// Feeds one inbound text message. Chunk and batch envelopes only update
    /// state and yield nothing unless they fail.
    pub fn handle_text(&mut self, text: &str) -> Option<ConsoleEvent> {
        let Some(message) = ServerMessage::parse(text) else {
            return Some(ConsoleEvent::Echo(text.to_string()));
        };
        match message {
            ServerMessage::Status(status) => Some(ConsoleEvent::Status(status)),
            ServerMessage::Event(event) => self.handle_event(event),
        }
    }

    fn handle_event(&mut self, event: ServerEvent) -> Option<ConsoleEvent> {
        match event {
            ServerEvent::Handshake(handshake) => Some(ConsoleEvent::Handshake(handshake)),
            ServerEvent::FileList { path, items } => Some(ConsoleEvent::Listing { path, items }),
            ServerEvent::FileStart {
                path,
                size,
                content_type,
            } => {
                self.reassembler.on_start(&path, size, &content_type);
                Some(ConsoleEvent::DownloadStarted {
                    path,
                    size,
                    content_type,
                })
            }
            ServerEvent::FileChunk { path, index, data } => {
                match self.reassembler.on_chunk(&path, index, &data) {
                    Ok(()) => None,
                    Err(error) => {
                        warn!(path, index, error = %error, "dropping chunk");
                        Some(ConsoleEvent::DownloadFailed { path, error })
                    }
                }
            }
            ServerEvent::FileEnd { path, total_chunks } => {
                match self.reassembler.on_end(&path, total_chunks) {
                    Ok(download) => Some(ConsoleEvent::DownloadComplete(download)),
                    Err(error) => Some(ConsoleEvent::DownloadFailed { path, error }),
                }
            }
            ServerEvent::RecStarted => Some(ConsoleEvent::RecordingStarted),
            ServerEvent::VideoStart { count } => {
                self.player.on_video_start(count);
                Some(ConsoleEvent::RecordingLoading { count })
            }
            ServerEvent::VideoBatch { frames } => {
                debug!(frames = frames.len(), "video batch");
                self.player.on_video_batch(frames);
                None
            }
            ServerEvent::VideoEnd => {
                if self.player.on_video_end() {
                    Some(ConsoleEvent::RecordingReady {
                        frames: self.player.frame_count(),
                    })
                } else {
                    Some(ConsoleEvent::RecordingEmpty)
                }
            }
        }
    }
}
