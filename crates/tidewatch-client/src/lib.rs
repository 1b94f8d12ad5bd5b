//! Console side of the tidewatch protocol: rebuilds downloads from chunk
//! envelopes, plays back recorded frames and talks to a server over
//! WebSocket.

mod client;
mod console;
mod export;
mod player;
mod reassembler;

pub use client::{ClientError, ConsoleClient};
pub use console::{Console, ConsoleEvent};
pub use export::{export_gif, ExportError};
pub use player::{format_clock, FramePlayer, PlayerState};
pub use reassembler::{CompletedDownload, DecodeError, Reassembler, MISSING_SAMPLE};
