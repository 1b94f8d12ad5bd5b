use std::{
    collections::{BTreeMap, HashMap},
    io,
    path::{Path, PathBuf},
};

use base64::{engine::general_purpose::STANDARD, Engine as _};
use thiserror::Error;
use tidewatch_proto::{normalize_key, CHUNK_SIZE};
use tracing::debug;

/// How many absent indices a [`DecodeError::MissingChunks`] lists.
pub const MISSING_SAMPLE: usize = 8;

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("no transfer in progress for {key}")]
    UnknownTransfer { key: String },
    #[error("chunk {index} of {key} is not valid base64: {source}")]
    InvalidChunk {
        key: String,
        index: u64,
        #[source]
        source: base64::DecodeError,
    },
    #[error("chunk {index} of {key} decodes to {len} bytes, more than one chunk may carry")]
    OversizedChunk { key: String, index: u64, len: usize },
    #[error("{key} is missing {missing} of {total} chunks (first: {first_missing:?})")]
    MissingChunks {
        key: String,
        missing: u64,
        /// The lowest absent indices, at most [`MISSING_SAMPLE`] of them.
        first_missing: Vec<u64>,
        total: u64,
    },
    #[error("{key} decoded to {actual} bytes, expected {expected}")]
    SizeMismatch {
        key: String,
        expected: u64,
        actual: u64,
    },
}

/// A reconstructed download, ready to be saved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedDownload {
    /// Normalized session key.
    pub key: String,
    /// Path as announced in `file_start`.
    pub path: String,
    pub file_name: String,
    pub content_type: String,
    pub bytes: Vec<u8>,
}

impl CompletedDownload {
    /// Writes the bytes into `dir` under the remote file name.
    pub async fn save_to(&self, dir: &Path) -> io::Result<PathBuf> {
        let target = dir.join(&self.file_name);
        tokio::fs::write(&target, &self.bytes).await?;
        Ok(target)
    }
}

#[derive(Debug)]
struct DownloadState {
    path: String,
    size: u64,
    content_type: String,
    /// Decoded chunk payloads by index. Each chunk is decoded on arrival, so
    /// the decode never needs a buffer larger than one chunk's text.
    chunks: BTreeMap<u64, Vec<u8>>,
}

/// Rebuilds downloads from `file_start`, `file_chunk` and `file_end`
/// envelopes, keyed by the normalized path.
#[derive(Debug, Default)]
pub struct Reassembler {
    transfers: HashMap<String, DownloadState>,
}

impl Reassembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts a transfer, replacing any unfinished one for the same key.
    pub fn on_start(&mut self, path: &str, size: u64, content_type: &str) {
        let key = normalize_key(path);
        let replaced = self
            .transfers
            .insert(
                key.clone(),
                DownloadState {
                    path: path.to_string(),
                    size,
                    content_type: content_type.to_string(),
                    chunks: BTreeMap::new(),
                },
            )
            .is_some();
        debug!(key, size, replaced, "download started");
    }

    /// Stores one chunk. A repeated index overwrites the earlier payload.
    pub fn on_chunk(&mut self, path: &str, index: u64, data: &str) -> Result<(), DecodeError> {
        let key = normalize_key(path);
        let Some(state) = self.transfers.get_mut(&key) else {
            return Err(DecodeError::UnknownTransfer { key });
        };
        let bytes = STANDARD
            .decode(data)
            .map_err(|source| DecodeError::InvalidChunk {
                key: key.clone(),
                index,
                source,
            })?;
        if bytes.len() > CHUNK_SIZE {
            return Err(DecodeError::OversizedChunk {
                key,
                index,
                len: bytes.len(),
            });
        }
        state.chunks.insert(index, bytes);
        Ok(())
    }

    /// Finishes a transfer. The state is discarded whether or not the
    /// reconstruction succeeds.
    pub fn on_end(&mut self, path: &str, total_chunks: u64) -> Result<CompletedDownload, DecodeError> {
        let key = normalize_key(path);
        let Some(state) = self.transfers.remove(&key) else {
            return Err(DecodeError::UnknownTransfer { key });
        };

        // `total_chunks` and `size` come off the wire; all work below is
        // bounded by what was actually received.
        let present = state.chunks.range(..total_chunks).count() as u64;
        if present < total_chunks {
            let first_missing = (0..total_chunks)
                .filter(|index| !state.chunks.contains_key(index))
                .take(MISSING_SAMPLE)
                .collect();
            return Err(DecodeError::MissingChunks {
                key,
                missing: total_chunks - present,
                first_missing,
                total: total_chunks,
            });
        }

        let actual: u64 = state
            .chunks
            .range(..total_chunks)
            .map(|(_, chunk)| chunk.len() as u64)
            .sum();
        if actual != state.size {
            return Err(DecodeError::SizeMismatch {
                key,
                expected: state.size,
                actual,
            });
        }

        let mut bytes = Vec::with_capacity(usize::try_from(actual).unwrap_or(0));
        for (_, chunk) in state.chunks.range(..total_chunks) {
            bytes.extend_from_slice(chunk);
        }

        Ok(CompletedDownload {
            file_name: file_name_of(&state.path),
            key,
            path: state.path,
            content_type: state.content_type,
            bytes,
        })
    }

    pub fn in_progress(&self) -> usize {
        self.transfers.len()
    }

    /// Number of distinct chunks held for `path`.
    pub fn received(&self, path: &str) -> Option<usize> {
        self.transfers
            .get(&normalize_key(path))
            .map(|state| state.chunks.len())
    }
}

fn file_name_of(path: &str) -> String {
    path.rsplit(['/', '\\'])
        .find(|segment| !segment.trim().is_empty())
        .map(|segment| segment.trim().to_string())
        .unwrap_or_else(|| "download".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode(bytes: &[u8]) -> String {
        STANDARD.encode(bytes)
    }

    #[test_timeout::timeout]
    fn reassembles_in_index_order_regardless_of_arrival() {
        let mut reassembler = Reassembler::new();
        reassembler.on_start("/srv/a.bin", 6, "application/octet-stream");
        reassembler.on_chunk("/srv/a.bin", 1, &encode(b"def")).unwrap();
        reassembler.on_chunk("/srv/a.bin", 0, &encode(b"abc")).unwrap();
        let done = reassembler.on_end("/srv/a.bin", 2).unwrap();
        assert_eq!(done.bytes, b"abcdef");
        assert_eq!(done.file_name, "a.bin");
        assert_eq!(reassembler.in_progress(), 0);
    }

    #[test_timeout::timeout]
    fn duplicate_chunk_is_last_write_wins() {
        let mut reassembler = Reassembler::new();
        reassembler.on_start("a", 5, "text/plain");
        reassembler.on_chunk("a", 0, &encode(b"hello")).unwrap();
        reassembler.on_chunk("a", 0, &encode(b"hello")).unwrap();
        assert_eq!(reassembler.received("a"), Some(1));
        assert_eq!(reassembler.on_end("a", 1).unwrap().bytes, b"hello");
    }

    #[test_timeout::timeout]
    fn gap_fails_and_discards_state() {
        let mut reassembler = Reassembler::new();
        reassembler.on_start("a", 9, "text/plain");
        reassembler.on_chunk("a", 0, &encode(b"abc")).unwrap();
        reassembler.on_chunk("a", 2, &encode(b"ghi")).unwrap();
        match reassembler.on_end("a", 3) {
            Err(DecodeError::MissingChunks {
                missing,
                first_missing,
                total,
                ..
            }) => {
                assert_eq!(missing, 1);
                assert_eq!(first_missing, [1]);
                assert_eq!(total, 3);
            }
            other => panic!("expected a missing chunk error, got {other:?}"),
        }
        assert_eq!(reassembler.in_progress(), 0);
    }

    #[test_timeout::timeout]
    fn trailing_chunks_lost_to_an_aborted_stream_are_detected() {
        let mut reassembler = Reassembler::new();
        reassembler.on_start("a", 9, "text/plain");
        reassembler.on_chunk("a", 0, &encode(b"abc")).unwrap();
        let err = reassembler.on_end("a", 3).unwrap_err();
        assert!(matches!(
            err,
            DecodeError::MissingChunks { missing: 2, ref first_missing, .. } if first_missing == &[1, 2]
        ));
    }

    #[test_timeout::timeout]
    fn absurd_chunk_count_is_reported_without_walking_it() {
        let mut reassembler = Reassembler::new();
        reassembler.on_start("a", 0, "text/plain");
        match reassembler.on_end("a", u64::MAX) {
            Err(DecodeError::MissingChunks {
                missing,
                first_missing,
                ..
            }) => {
                assert_eq!(missing, u64::MAX);
                assert_eq!(first_missing, (0..MISSING_SAMPLE as u64).collect::<Vec<_>>());
            }
            other => panic!("expected a missing chunk error, got {other:?}"),
        }
    }

    #[test_timeout::timeout]
    fn announced_size_is_not_trusted_for_allocation() {
        let mut reassembler = Reassembler::new();
        reassembler.on_start("a", u64::MAX, "text/plain");
        reassembler.on_chunk("a", 0, &encode(b"abc")).unwrap();
        assert!(matches!(
            reassembler.on_end("a", 1),
            Err(DecodeError::SizeMismatch { actual: 3, .. })
        ));
    }

    #[test_timeout::timeout]
    fn malformed_base64_is_rejected() {
        let mut reassembler = Reassembler::new();
        reassembler.on_start("a", 3, "text/plain");
        let err = reassembler.on_chunk("a", 0, "not*base64").unwrap_err();
        assert!(matches!(err, DecodeError::InvalidChunk { index: 0, .. }));
        // The bad chunk was never stored, so the transfer cannot complete.
        assert!(reassembler.on_end("a", 1).is_err());
    }

    #[test_timeout::timeout]
    fn size_must_match_the_announcement() {
        let mut reassembler = Reassembler::new();
        reassembler.on_start("a", 4, "text/plain");
        reassembler.on_chunk("a", 0, &encode(b"abc")).unwrap();
        assert!(matches!(
            reassembler.on_end("a", 1),
            Err(DecodeError::SizeMismatch {
                expected: 4,
                actual: 3,
                ..
            })
        ));
    }

    #[test_timeout::timeout]
    fn keys_ignore_separator_style_and_case() {
        let mut reassembler = Reassembler::new();
        reassembler.on_start("C:/Logs/app.log", 2, "text/plain");
        reassembler.on_chunk("c:\\logs\\APP.LOG", 0, &encode(b"ok")).unwrap();
        let done = reassembler.on_end("C:\\Logs\\\\app.log", 1).unwrap();
        assert_eq!(done.path, "C:/Logs/app.log");
        assert_eq!(done.file_name, "app.log");
    }

    #[test_timeout::timeout]
    fn chunks_for_unknown_keys_are_refused() {
        let mut reassembler = Reassembler::new();
        assert!(matches!(
            reassembler.on_chunk("ghost", 0, &encode(b"x")),
            Err(DecodeError::UnknownTransfer { .. })
        ));
        assert!(reassembler.on_end("ghost", 0).is_err());
    }

    #[test_timeout::timeout]
    fn empty_transfer_completes_with_no_bytes() {
        let mut reassembler = Reassembler::new();
        reassembler.on_start("/tmp/empty.txt", 0, "text/plain");
        let done = reassembler.on_end("/tmp/empty.txt", 0).unwrap();
        assert!(done.bytes.is_empty());
    }

    #[test_timeout::tokio_timeout_test]
    async fn save_writes_under_the_remote_name() {
        let dir = tempfile::tempdir().unwrap();
        let mut reassembler = Reassembler::new();
        reassembler.on_start("\\share\\report.txt", 2, "text/plain");
        reassembler.on_chunk("/share/report.txt", 0, &encode(b"hi")).unwrap();
        let done = reassembler.on_end("/share/report.txt", 1).unwrap();
        let saved = done.save_to(dir.path()).await.unwrap();
        assert_eq!(saved, dir.path().join("report.txt"));
        assert_eq!(std::fs::read(saved).unwrap(), b"hi");
    }

    #[test_timeout::timeout]
    fn file_name_falls_back_for_bare_separators() {
        assert_eq!(file_name_of("/"), "download");
        assert_eq!(file_name_of("dir/"), "dir");
    }
}
