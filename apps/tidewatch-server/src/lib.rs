//! Tidewatch server: a WebSocket command endpoint that answers short commands
//! inline and streams long results (directory listings, file downloads,
//! camera recordings) as ordered JSON envelopes.

pub mod capture;
pub mod config;
pub mod connection;
pub mod error;
pub mod files;
pub mod recording;
pub mod registry;
pub mod router;
pub mod server;
pub mod telemetry;
pub mod transfer;

pub use config::{CameraSpec, Cli, ServerConfig};
pub use connection::{Connection, PeerRole, TransportError};
pub use error::CommandError;
pub use registry::ConnectionRegistry;
pub use router::{Handler, HandlerError, PeerSession, Reply, Router};
pub use server::{build_router, serve, AppState};
