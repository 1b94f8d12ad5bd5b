use std::time::Duration;

use futures_util::{
    stream::{SplitSink, SplitStream},
    SinkExt, StreamExt,
};
use thiserror::Error;
use tidewatch_proto::{Command, CommandVerb, Handshake, ServerEvent, ServerMessage};
use tokio::{net::TcpStream, time::timeout};
use tokio_tungstenite::{
    connect_async,
    tungstenite::{self, Message},
    MaybeTlsStream, WebSocketStream,
};
use tracing::debug;

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("websocket error: {0}")]
    WebSocket(#[from] tungstenite::Error),
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    #[error("connection closed before {0}")]
    Closed(&'static str),
    #[error("expected a handshake, got {0}")]
    UnexpectedHandshake(String),
}

/// WebSocket connection to a tidewatch server.
pub struct ConsoleClient {
    write: SplitSink<Socket, Message>,
    read: SplitStream<Socket>,
    handshake: Handshake,
}

impl ConsoleClient {
    /// Connects to `url` (e.g. `ws://host:8080/ws`) and waits for the
    /// server's handshake.
    pub async fn connect(url: &str, wait: Duration) -> Result<Self, ClientError> {
        debug!(url, "connecting");
        let (stream, _) = timeout(wait, connect_async(url))
            .await
            .map_err(|_| ClientError::Timeout(wait))??;
        let (write, mut read) = stream.split();

        let first = timeout(wait, next_text(&mut read))
            .await
            .map_err(|_| ClientError::Timeout(wait))??
            .ok_or(ClientError::Closed("the handshake"))?;
        let handshake = match ServerMessage::parse(&first) {
            Some(ServerMessage::Event(ServerEvent::Handshake(handshake))) => handshake,
            _ => return Err(ClientError::UnexpectedHandshake(first)),
        };
        debug!(connection_id = %handshake.connection_id, version = %handshake.version, "connected");

        Ok(Self {
            write,
            read,
            handshake,
        })
    }

    pub fn handshake(&self) -> &Handshake {
        &self.handshake
    }

    /// Sends raw command text.
    pub async fn send_text(&mut self, text: &str) -> Result<(), ClientError> {
        self.write.send(Message::Text(text.into())).await?;
        Ok(())
    }

    pub async fn send(&mut self, verb: CommandVerb, arg: &str) -> Result<(), ClientError> {
        self.send_text(&Command::render(verb, arg)).await
    }

    /// Next text message, or `None` once the server closed the connection.
    pub async fn next_text(&mut self) -> Result<Option<String>, ClientError> {
        next_text(&mut self.read).await
    }

    /// Like [`next_text`](Self::next_text) but gives up after `wait`.
    pub async fn next_text_within(&mut self, wait: Duration) -> Result<Option<String>, ClientError> {
        timeout(wait, self.next_text())
            .await
            .map_err(|_| ClientError::Timeout(wait))?
    }

    pub async fn close(mut self) -> Result<(), ClientError> {
        self.write.close().await?;
        Ok(())
    }
}

async fn next_text(read: &mut SplitStream<Socket>) -> Result<Option<String>, ClientError> {
    while let Some(message) = read.next().await {
        match message? {
            Message::Text(text) => return Ok(Some(text.as_str().to_string())),
            Message::Binary(bytes) => {
                if let Ok(text) = std::str::from_utf8(&bytes) {
                    return Ok(Some(text.to_string()));
                }
            }
            Message::Close(_) => return Ok(None),
            _ => {}
        }
    }
    Ok(None)
}
