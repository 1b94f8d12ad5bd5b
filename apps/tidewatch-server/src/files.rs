use std::{
    io,
    path::{Component, Path, PathBuf},
};

use chrono::{DateTime, Utc};
use thiserror::Error;
use tidewatch_proto::{FileEntry, ServerEvent};
use tracing::debug;

#[derive(Debug, Error)]
pub enum ResourceError {
    #[error("Path must not be empty")]
    EmptyPath,
    #[error("Access to path is not allowed: {0}")]
    OutsideRoot(String),
    #[error("Path not found: {0}")]
    NotFound(String),
    #[error("Not a directory: {0}")]
    NotADirectory(String),
    #[error("Not a file: {0}")]
    NotAFile(String),
    #[error("File too large to stream: {size} bytes exceeds the {limit} byte limit")]
    TooLarge { size: u64, limit: u64 },
    #[error("I/O error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: io::Error,
    },
}

impl ResourceError {
    fn io(path: &Path, source: io::Error) -> Self {
        let display = path.display().to_string();
        if source.kind() == io::ErrorKind::NotFound {
            ResourceError::NotFound(display)
        } else {
            ResourceError::Io {
                path: display,
                source,
            }
        }
    }
}

/// What the transfer producer needs to know before it sends `file_start`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamTarget {
    pub path: PathBuf,
    pub size: u64,
    pub content_type: &'static str,
}

/// Filesystem access confined to one root directory.
#[derive(Debug, Clone)]
pub struct FileService {
    root: PathBuf,
    max_stream_bytes: u64,
}

impl FileService {
    pub fn new(root: impl AsRef<Path>, max_stream_bytes: u64) -> Result<Self, ResourceError> {
        let root = root.as_ref();
        let root = std::fs::canonicalize(root).map_err(|err| ResourceError::io(root, err))?;
        if !root.is_dir() {
            return Err(ResourceError::NotADirectory(root.display().to_string()));
        }
        Ok(Self {
            root,
            max_stream_bytes,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn max_stream_bytes(&self) -> u64 {
        self.max_stream_bytes
    }

    /// Maps a requested path onto the filesystem, refusing anything that
    /// escapes the root either lexically or through a symlink.
    pub async fn resolve(&self, requested: &str) -> Result<PathBuf, ResourceError> {
        let requested = requested.trim();
        if requested.is_empty() {
            return Err(ResourceError::EmptyPath);
        }

        let candidate = Path::new(requested);
        let joined = if candidate.is_absolute() {
            candidate.to_path_buf()
        } else {
            self.root.join(candidate)
        };
        let normalized = lexical_normalize(&joined);

        let resolved = match tokio::fs::canonicalize(&normalized).await {
            Ok(real) => real,
            Err(err) if err.kind() == io::ErrorKind::NotFound => normalized,
            Err(err) => return Err(ResourceError::io(&normalized, err)),
        };

        if !resolved.starts_with(&self.root) {
            debug!(requested, resolved = %resolved.display(), "path escapes root");
            return Err(ResourceError::OutsideRoot(requested.to_string()));
        }
        Ok(resolved)
    }

    /// Builds the `file_list` envelope for one directory. Directories come
    /// first, then files, each group sorted by name.
    pub async fn list_dir(&self, requested: &str) -> Result<ServerEvent, ResourceError> {
        let dir = self.resolve(requested).await?;
        let metadata = tokio::fs::metadata(&dir)
            .await
            .map_err(|err| ResourceError::io(&dir, err))?;
        if !metadata.is_dir() {
            return Err(ResourceError::NotADirectory(requested.to_string()));
        }

        let mut reader = tokio::fs::read_dir(&dir)
            .await
            .map_err(|err| ResourceError::io(&dir, err))?;
        let mut items = Vec::new();
        while let Some(entry) = reader
            .next_entry()
            .await
            .map_err(|err| ResourceError::io(&dir, err))?
        {
            let path = entry.path();
            // Dangling symlinks and entries that vanish mid-listing are skipped.
            let Ok(meta) = tokio::fs::metadata(&path).await else {
                continue;
            };
            let is_directory = meta.is_dir();
            items.push(FileEntry {
                name: entry.file_name().to_string_lossy().into_owned(),
                full_path: path.display().to_string(),
                is_directory,
                size: if is_directory { 0 } else { meta.len() },
                last_modified: meta.modified().ok().map(DateTime::<Utc>::from),
            });
        }
        items.sort_by(|a, b| {
            b.is_directory
                .cmp(&a.is_directory)
                .then_with(|| a.name.cmp(&b.name))
        });

        Ok(ServerEvent::FileList {
            path: requested.to_string(),
            items,
        })
    }

    /// Resolves a file for streaming and enforces the size ceiling.
    pub async fn stream_target(&self, requested: &str) -> Result<StreamTarget, ResourceError> {
        let path = self.resolve(requested).await?;
        let metadata = tokio::fs::metadata(&path)
            .await
            .map_err(|err| ResourceError::io(&path, err))?;
        if !metadata.is_file() {
            return Err(ResourceError::NotAFile(requested.to_string()));
        }
        let size = metadata.len();
        if size > self.max_stream_bytes {
            return Err(ResourceError::TooLarge {
                size,
                limit: self.max_stream_bytes,
            });
        }
        let content_type = content_type_for(&path);
        Ok(StreamTarget {
            path,
            size,
            content_type,
        })
    }
}

fn lexical_normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

/// MIME type by file extension.
pub fn content_type_for(path: &Path) -> &'static str {
    let extension = path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(str::to_ascii_lowercase);
    match extension.as_deref() {
        Some("txt" | "log") => "text/plain",
        Some("json") => "application/json",
        Some("html" | "htm") => "text/html",
        Some("jpg" | "jpeg") => "image/jpeg",
        Some("png") => "image/png",
        Some("gif") => "image/gif",
        Some("bmp") => "image/bmp",
        Some("pdf") => "application/pdf",
        Some("zip") => "application/zip",
        Some("csv") => "text/csv",
        Some("xml") => "application/xml",
        Some("mp4") => "video/mp4",
        Some("mp3") => "audio/mpeg",
        _ => "application/octet-stream",
    }
}
