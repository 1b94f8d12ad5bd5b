use std::{
    fmt,
    pin::Pin,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use futures_util::{Sink, SinkExt};
use metrics::counter;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

/// Upper bound on flushing and closing the sink once a connection closes.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

/// Write half of a peer channel: accepts whole text messages.
pub type OutboundSink = Pin<Box<dyn Sink<String, Error = TransportError> + Send>>;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("connection is closed")]
    Closed,
    #[error("failed to write message: {0}")]
    Send(String),
    #[error("failed to encode message: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Which side of the console a peer is.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, serde::Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PeerRole {
    /// Issues commands and receives envelopes.
    #[default]
    Console,
    /// Receives broadcasts only.
    Observer,
}

impl fmt::Display for PeerRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PeerRole::Console => f.write_str("console"),
            PeerRole::Observer => f.write_str("observer"),
        }
    }
}

/// One logical duplex channel to one peer.
///
/// Every write goes through an exclusive lock and completes before the lock is
/// released, so envelopes from concurrent producers never interleave inside a
/// single message. The lifetime token is cancelled when the connection closes;
/// producers run under child tokens of it.
pub struct Connection {
    id: Uuid,
    role: PeerRole,
    sink: Mutex<OutboundSink>,
    open: AtomicBool,
    lifetime: CancellationToken,
}

impl Connection {
    pub fn new<S>(id: Uuid, role: PeerRole, sink: S) -> Arc<Self>
    where
        S: Sink<String, Error = TransportError> + Send + 'static,
    {
        Arc::new(Self {
            id,
            role,
            sink: Mutex::new(Box::pin(sink)),
            open: AtomicBool::new(true),
            lifetime: CancellationToken::new(),
        })
    }

    /// Connection whose outbound messages land in a local channel. Used by
    /// in-process peers and tests.
    pub fn in_memory(role: PeerRole) -> (Arc<Self>, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel::<String>();
        let sink = futures_util::sink::unfold(tx, |tx, text: String| async move {
            tx.send(text).map_err(|_| TransportError::Closed)?;
            Ok::<_, TransportError>(tx)
        });
        (Self::new(Uuid::new_v4(), role, sink), rx)
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn role(&self) -> PeerRole {
        self.role
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    /// Token cancelled when this connection closes.
    pub fn lifetime(&self) -> &CancellationToken {
        &self.lifetime
    }

    /// Serializes `message` and writes it as one text message.
    pub async fn send<T: Serialize + ?Sized>(&self, message: &T) -> Result<(), TransportError> {
        let text = serde_json::to_string(message)?;
        self.send_text(text).await
    }

    /// Writes one whole text message. A failed write marks the connection
    /// closed; the caller decides whether to keep going.
    ///
    /// Waiting for the lock and the write itself both give up with
    /// [`TransportError::Closed`] once the connection closes, so a peer that
    /// stops reading cannot pin a producer or [`close`](Self::close).
    pub async fn send_text(&self, text: String) -> Result<(), TransportError> {
        if !self.is_open() {
            return Err(TransportError::Closed);
        }

        let bytes = text.len();
        let mut sink = tokio::select! {
            _ = self.lifetime.cancelled() => return Err(TransportError::Closed),
            sink = self.sink.lock() => sink,
        };
        // Re-check under the lock: close() may have won the race.
        if !self.is_open() {
            return Err(TransportError::Closed);
        }
        let result = tokio::select! {
            biased;
            result = sink.send(text) => result,
            _ = self.lifetime.cancelled() => {
                debug!(connection_id = %self.id, "write abandoned; connection closed");
                return Err(TransportError::Closed);
            }
        };
        match result {
            Ok(()) => {
                counter!("tidewatch_messages_sent_total", 1);
                counter!("tidewatch_bytes_sent_total", bytes as u64);
                Ok(())
            }
            Err(err) => {
                drop(sink);
                warn!(
                    connection_id = %self.id,
                    error = %err,
                    "send failed; marking connection closed"
                );
                self.mark_closed();
                Err(err)
            }
        }
    }

    /// Best-effort graceful shutdown. Idempotent, and bounded by
    /// [`CLOSE_TIMEOUT`] even when the peer has stopped reading.
    pub async fn close(&self) {
        let was_open = self.open.swap(false, Ordering::AcqRel);
        self.lifetime.cancel();
        if !was_open {
            return;
        }
        let shutdown = async {
            let mut sink = self.sink.lock().await;
            sink.close().await
        };
        match tokio::time::timeout(CLOSE_TIMEOUT, shutdown).await {
            Ok(Ok(())) => debug!(connection_id = %self.id, "connection closed"),
            Ok(Err(err)) => {
                debug!(connection_id = %self.id, error = %err, "error while closing sink")
            }
            Err(_) => warn!(connection_id = %self.id, "peer not draining; dropped without a clean close"),
        }
    }

    pub(crate) fn mark_closed(&self) {
        self.open.store(false, Ordering::Release);
        self.lifetime.cancel();
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("role", &self.role)
            .field("open", &self.is_open())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tidewatch_proto::Status;

    #[test_timeout::timeout]
    fn peers_without_a_role_are_consoles() {
        #[derive(serde::Deserialize)]
        struct Query {
            #[serde(default)]
            role: PeerRole,
        }
        assert_eq!(PeerRole::default(), PeerRole::Console);
        let query: Query = serde_json::from_str("{}").unwrap();
        assert_eq!(query.role, PeerRole::Console);
        let query: Query = serde_json::from_str(r#"{"role":"observer"}"#).unwrap();
        assert_eq!(query.role, PeerRole::Observer);
    }

    #[test_timeout::tokio_timeout_test]
    async fn send_delivers_whole_messages_in_order() {
        let (connection, mut rx) = Connection::in_memory(PeerRole::Console);
        connection.send(&Status::info("one")).await.unwrap();
        connection.send_text("two".into()).await.unwrap();

        assert_eq!(rx.recv().await.unwrap(), r#"{"status":"info","message":"one"}"#);
        assert_eq!(rx.recv().await.unwrap(), "two");
    }

    #[test_timeout::tokio_timeout_test]
    async fn close_is_idempotent_and_cancels_lifetime() {
        let (connection, _rx) = Connection::in_memory(PeerRole::Console);
        assert!(connection.is_open());
        connection.close().await;
        connection.close().await;
        assert!(!connection.is_open());
        assert!(connection.lifetime().is_cancelled());
        assert!(matches!(
            connection.send_text("late".into()).await,
            Err(TransportError::Closed)
        ));
    }

    #[test_timeout::tokio_timeout_test(10, paused)]
    async fn close_does_not_wait_on_a_stalled_write() {
        // A peer that never drains: every write stays pending.
        let stalled = futures_util::sink::unfold((), |(), _text: String| {
            futures_util::future::pending::<Result<(), TransportError>>()
        });
        let connection = Connection::new(Uuid::new_v4(), PeerRole::Console, stalled);

        let writer = {
            let connection = Arc::clone(&connection);
            tokio::spawn(async move { connection.send_text("chunk".into()).await })
        };
        tokio::task::yield_now().await;
        let second = {
            let connection = Arc::clone(&connection);
            tokio::spawn(async move { connection.send_text("queued".into()).await })
        };
        tokio::task::yield_now().await;

        let started = tokio::time::Instant::now();
        connection.close().await;
        assert!(started.elapsed() <= CLOSE_TIMEOUT);
        assert!(!connection.is_open());
        assert!(matches!(writer.await.unwrap(), Err(TransportError::Closed)));
        assert!(matches!(second.await.unwrap(), Err(TransportError::Closed)));
    }

    #[test_timeout::tokio_timeout_test]
    async fn dropped_receiver_marks_connection_closed() {
        let (connection, rx) = Connection::in_memory(PeerRole::Console);
        drop(rx);
        assert!(connection.send_text("lost".into()).await.is_err());
        assert!(!connection.is_open());
        assert!(connection.lifetime().is_cancelled());
    }

    #[test_timeout::tokio_timeout_test]
    async fn concurrent_writers_never_tear_messages() {
        let (connection, mut rx) = Connection::in_memory(PeerRole::Console);
        let mut writers = Vec::new();
        for writer in 0..4 {
            let connection = Arc::clone(&connection);
            writers.push(tokio::spawn(async move {
                for seq in 0..50 {
                    let body = format!("{writer}:{seq}:{}", "x".repeat(512));
                    connection.send_text(body).await.unwrap();
                }
            }));
        }
        for writer in writers {
            writer.await.unwrap();
        }

        let mut per_writer = [0usize; 4];
        for _ in 0..200 {
            let message = rx.recv().await.unwrap();
            let mut parts = message.splitn(3, ':');
            let writer: usize = parts.next().unwrap().parse().unwrap();
            let seq: usize = parts.next().unwrap().parse().unwrap();
            assert_eq!(parts.next().unwrap().len(), 512);
            assert_eq!(seq, per_writer[writer]);
            per_writer[writer] += 1;
        }
    }
}
