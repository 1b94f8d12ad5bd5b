use std::io;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use metrics::counter;
use tidewatch_proto::{ServerEvent, Status, CHUNK_SIZE};
use tokio::{
    fs::File,
    io::{AsyncRead, AsyncReadExt},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    connection::{Connection, TransportError},
    error::CommandError,
    files::{FileService, StreamTarget},
};

/// How a transfer ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferOutcome {
    /// `file_end` was sent.
    Completed { total_chunks: u64, bytes: u64 },
    /// Rejected before `file_start`; one error status was sent.
    Rejected,
    /// An I/O error replaced `file_end` with an error status.
    Failed { chunks_sent: u64 },
    /// The connection went away or the transfer was cancelled; nothing more
    /// was sent.
    Aborted { chunks_sent: u64 },
}

/// Streams one file as `file_start`, `file_chunk`* and `file_end`.
///
/// `key` is the path exactly as requested; it is echoed in every envelope so
/// the peer can correlate them. Every error is reported to the peer as one
/// error status and never surfaces to the caller.
pub async fn stream_file(
    connection: &Connection,
    files: &FileService,
    key: &str,
    cancel: &CancellationToken,
) -> TransferOutcome {
    let target = match files.stream_target(key).await {
        Ok(target) => target,
        Err(err) => {
            let err = CommandError::from(err);
            debug!(connection_id = %connection.id(), key, error = %err, "download rejected");
            let _ = connection.send(&err.to_status()).await;
            return TransferOutcome::Rejected;
        }
    };

    let file = match File::open(&target.path).await {
        Ok(file) => file,
        Err(err) => {
            let _ = connection
                .send(&Status::error(format!("Failed to open {key}: {err}")))
                .await;
            return TransferOutcome::Rejected;
        }
    };

    send_stream(connection, key, &target, file, cancel).await
}

/// Sends exactly `target.size` bytes of `reader` under `key`.
///
/// The size was fixed when the target was resolved, and both `file_start` and
/// the streaming ceiling rely on it: bytes appended afterwards are not sent,
/// and a reader that ends early fails the transfer instead of sending
/// `file_end`.
async fn send_stream<R>(
    connection: &Connection,
    key: &str,
    target: &StreamTarget,
    reader: R,
    cancel: &CancellationToken,
) -> TransferOutcome
where
    R: AsyncRead + Unpin,
{
    let start = ServerEvent::FileStart {
        path: key.to_string(),
        size: target.size,
        content_type: target.content_type.to_string(),
    };
    if connection.send(&start).await.is_err() {
        return TransferOutcome::Aborted { chunks_sent: 0 };
    }

    let mut reader = reader.take(target.size);
    let mut buffer = vec![0u8; CHUNK_SIZE];
    let mut index = 0u64;
    let mut bytes = 0u64;
    loop {
        if cancel.is_cancelled() || !connection.is_open() {
            info!(connection_id = %connection.id(), key, chunks = index, "download aborted");
            return TransferOutcome::Aborted { chunks_sent: index };
        }

        let read = match fill_chunk(&mut reader, &mut buffer).await {
            Ok(0) => break,
            Ok(read) => read,
            Err(err) => {
                warn!(connection_id = %connection.id(), key, error = %err, "read failed mid-transfer");
                let _ = connection
                    .send(&Status::error(format!("Failed to read {key}: {err}")))
                    .await;
                return TransferOutcome::Failed { chunks_sent: index };
            }
        };

        let chunk = ServerEvent::FileChunk {
            path: key.to_string(),
            index,
            data: STANDARD.encode(&buffer[..read]),
        };
        match connection.send(&chunk).await {
            Ok(()) => {}
            Err(TransportError::Closed) | Err(TransportError::Send(_)) => {
                return TransferOutcome::Aborted { chunks_sent: index };
            }
            Err(err @ TransportError::Encode(_)) => {
                let _ = connection.send(&Status::error(err.to_string())).await;
                return TransferOutcome::Failed { chunks_sent: index };
            }
        }
        index += 1;
        bytes += read as u64;
        counter!("tidewatch_file_chunks_sent_total", 1);
        counter!("tidewatch_file_bytes_streamed_total", read as u64);
    }

    if bytes < target.size {
        warn!(
            connection_id = %connection.id(),
            key,
            announced = target.size,
            bytes,
            "file shrank mid-transfer"
        );
        let _ = connection
            .send(&Status::error(format!(
                "{key} shrank while streaming ({bytes} of {} bytes)",
                target.size
            )))
            .await;
        return TransferOutcome::Failed { chunks_sent: index };
    }

    let end = ServerEvent::FileEnd {
        path: key.to_string(),
        total_chunks: index,
    };
    if connection.send(&end).await.is_err() {
        return TransferOutcome::Aborted { chunks_sent: index };
    }
    info!(connection_id = %connection.id(), key, chunks = index, bytes, "download complete");
    TransferOutcome::Completed {
        total_chunks: index,
        bytes,
    }
}

/// Reads until `buffer` is full or the file ends, so every chunk but the last
/// carries exactly `buffer.len()` bytes.
async fn fill_chunk<R>(reader: &mut R, buffer: &mut [u8]) -> io::Result<usize>
where
    R: AsyncRead + Unpin,
{
    let mut filled = 0;
    while filled < buffer.len() {
        match reader.read(&mut buffer[filled..]).await {
            Ok(0) => break,
            Ok(read) => filled += read,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(err),
        }
    }
    Ok(filled)
}
