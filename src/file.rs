use std::future::Future;
use std::io;
use std::path::{Component, Path, PathBuf};

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncSeek, AsyncSeekExt};
use tracing::{debug, warn};

use crate::AsyncSeekStart;

/// Random-access source of downloadable files.
pub trait FileStore {
    type Reader: AsyncRead + AsyncSeekStart + Send + 'static;

    /// Opens `path` for reading and captures its length once.
    fn open(
        &self,
        path: &str,
    ) -> impl Future<Output = Result<OpenedFile<Self::Reader>, StoreError>> + Send;
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("no such file: {0}")]
    NotFound(String),
    #[error("path escapes the store root: {0}")]
    OutsideRoot(String),
    #[error("failed to open {path}")]
    Io {
        path: String,
        #[source]
        source: io::Error,
    },
}

impl IntoResponse for StoreError {
    fn into_response(self) -> Response {
        let status = match &self {
            StoreError::NotFound(_) => StatusCode::NOT_FOUND,
            StoreError::OutsideRoot(_) => StatusCode::BAD_REQUEST,
            StoreError::Io { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, self.to_string()).into_response()
    }
}

/// A readable file whose length was fetched exactly once, when it was opened.
///
/// The length is never re-queried during a transfer, so a file that changes
/// underneath a download shows up as a read error rather than a moving target.
pub struct OpenedFile<R> {
    length: u64,
    name: String,
    reader: R,
}

impl<R> std::fmt::Debug for OpenedFile<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenedFile")
            .field("length", &self.length)
            .field("name", &self.name)
            .finish()
    }
}

impl OpenedFile<tokio::fs::File> {
    /// Calls [`tokio::fs::File::metadata`] to determine file size.
    pub async fn file(file: tokio::fs::File, name: impl Into<String>) -> io::Result<Self> {
        let length = file.metadata().await?.len();
        Ok(OpenedFile { length, name: name.into(), reader: file })
    }
}

impl<R: AsyncRead + AsyncSeekStart> OpenedFile<R> {
    /// Construct an [`OpenedFile`] with a length supplied manually.
    pub fn sized(reader: R, length: u64, name: impl Into<String>) -> Self {
        OpenedFile { length, name: name.into(), reader }
    }
}

impl<R: AsyncRead + AsyncSeek + Unpin> OpenedFile<R> {
    /// Determines the length by seeking to the end of `reader`.
    pub async fn seek(mut reader: R, name: impl Into<String>) -> io::Result<Self> {
        let length = reader.seek(io::SeekFrom::End(0)).await?;
        Ok(OpenedFile { length, name: name.into(), reader })
    }
}

impl<R> OpenedFile<R> {
    pub fn length(&self) -> u64 {
        self.length
    }

    /// File name used for `Content-Disposition` when no override is given.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn into_reader(self) -> R {
        self.reader
    }
}

/// [`FileStore`] over a directory on the local filesystem.
///
/// Request paths are relative to the root. Absolute paths and `..`
/// components are refused.
#[derive(Debug, Clone)]
pub struct LocalFileStore {
    root: PathBuf,
}

impl LocalFileStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        LocalFileStore { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, path: &str) -> Result<PathBuf, StoreError> {
        let relative = Path::new(path);
        let mut resolved = self.root.clone();
        for component in relative.components() {
            match component {
                Component::Normal(part) => resolved.push(part),
                Component::CurDir => {}
                Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                    warn!(path, "rejected path outside store root");
                    return Err(StoreError::OutsideRoot(path.to_owned()));
                }
            }
        }
        Ok(resolved)
    }
}

impl FileStore for LocalFileStore {
    type Reader = tokio::fs::File;

    async fn open(&self, path: &str) -> Result<OpenedFile<tokio::fs::File>, StoreError> {
        let full = self.resolve(path)?;
        let io_error = |source: io::Error| match source.kind() {
            io::ErrorKind::NotFound => StoreError::NotFound(path.to_owned()),
            _ => StoreError::Io { path: path.to_owned(), source },
        };

        let file = tokio::fs::File::open(&full).await.map_err(io_error)?;
        let metadata = file.metadata().await.map_err(io_error)?;
        if !metadata.is_file() {
            return Err(StoreError::NotFound(path.to_owned()));
        }

        let name = full
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        debug!(path, length = metadata.len(), "opened file");
        Ok(OpenedFile { length: metadata.len(), name, reader: file })
    }
}
