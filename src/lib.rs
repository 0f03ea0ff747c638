//! # axum-resume
//!
//! Resumable file downloads for [`axum`][1], using HTTP byte ranges.
//!
//! A [`Download`] turns an [`OpenedFile`] and the request's optional `Range`
//! header into a `200 OK`, `206 Partial Content` or `416 Range Not
//! Satisfiable` response. The body is streamed in bounded chunks by a
//! background task. A client that hangs up mid-download, which segmenting
//! download managers do constantly, ends the transfer quietly.
//!
//! Two range grammars are understood, `bytes=<start>-` and
//! `bytes=<start>-<end>`. Anything else is malformed and handled according
//! to [`MalformedRangePolicy`].
//!
//! Any type implementing both [`AsyncRead`] and [`AsyncSeekStart`] can be
//! served. [`AsyncSeekStart`] only allows seeking from the start of a file,
//! and is implemented for every [`AsyncSeek`].
//!
//! ```no_run
//! use axum_resume::{router, DownloadOptions, LocalFileStore};
//!
//! #[tokio::main]
//! async fn main() -> std::io::Result<()> {
//!     let app = router(LocalFileStore::new("/srv/files"), DownloadOptions::default());
//!     let listener = tokio::net::TcpListener::bind("0.0.0.0:3000").await?;
//!     axum::serve(listener, app).await
//! }
//! ```
//!
//! [1]: https://docs.rs/axum

pub mod config;
mod file;
pub mod headers;
mod range;
mod service;
mod stream;
pub mod transfer;

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum_extra::headers::{AcceptRanges, ContentRange};
use axum_extra::TypedHeader;
use serde::Deserialize;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncSeek};
use tokio::sync::mpsc;
use tracing::{debug, error};

pub use file::{FileStore, LocalFileStore, OpenedFile, StoreError};
pub use headers::{BuildOptions, HeaderError};
pub use range::{MalformedRange, RangeNotSatisfiable, RangeSpec, TransferPlan};
pub use service::router;
pub use stream::{ChunkStream, DownloadBody};
pub use transfer::{transfer, ByteSink, TransferError, TransferOutcome, DEFAULT_CHUNK_SIZE};

use crate::transfer::ChannelSink;

/// [`AsyncSeek`] narrowed to only allow seeking from start.
pub trait AsyncSeekStart {
    /// Same semantics as [`AsyncSeek::start_seek`], always passing position as the
    /// `SeekFrom::Start` variant.
    fn start_seek(self: Pin<&mut Self>, position: u64) -> io::Result<()>;

    /// Same semantics as [`AsyncSeek::poll_complete`], returning `()` instead of the new
    /// stream position.
    fn poll_complete(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>>;
}

impl<T: AsyncSeek> AsyncSeekStart for T {
    fn start_seek(self: Pin<&mut Self>, position: u64) -> io::Result<()> {
        AsyncSeek::start_seek(self, io::SeekFrom::Start(position))
    }

    fn poll_complete(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        AsyncSeek::poll_complete(self, cx).map_ok(|_| ())
    }
}

/// What to do with a `Range` header that matches neither supported grammar.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MalformedRangePolicy {
    /// Answer `416 Range Not Satisfiable`.
    #[default]
    Reject,
    /// Pretend no range was sent and serve the whole file with `200 OK`.
    Ignore,
}

/// Per-service knobs for [`Download`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DownloadOptions {
    /// Upper bound on each read, see [`DEFAULT_CHUNK_SIZE`].
    pub chunk_size: usize,
    pub malformed_range: MalformedRangePolicy,
    pub headers: BuildOptions,
    /// Chunks buffered between the reading task and the response body.
    pub channel_depth: usize,
}

impl Default for DownloadOptions {
    fn default() -> Self {
        DownloadOptions {
            chunk_size: DEFAULT_CHUNK_SIZE,
            malformed_range: MalformedRangePolicy::default(),
            headers: BuildOptions::default(),
            channel_depth: 8,
        }
    }
}

/// Everything known about one download before it is planned.
#[derive(Debug)]
pub struct DownloadRequest<R> {
    file: OpenedFile<R>,
    range: Option<String>,
    download_name: Option<String>,
    content_type: Option<String>,
}

impl<R> DownloadRequest<R> {
    pub fn new(file: OpenedFile<R>) -> Self {
        DownloadRequest {
            file,
            range: None,
            download_name: None,
            content_type: None,
        }
    }

    /// Raw `Range` header value, if the client sent one.
    pub fn range(mut self, raw: Option<String>) -> Self {
        self.range = raw;
        self
    }

    /// File name offered to the client instead of the stored name.
    pub fn download_name(mut self, name: impl Into<String>) -> Self {
        self.download_name = Some(name.into());
        self
    }

    /// Overrides the content type guessed from the file name.
    pub fn content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }
}

/// Raw `Range` header from a request.
///
/// Non-UTF-8 bytes are replaced rather than dropped so that a garbled header
/// is treated as malformed instead of as absent.
pub fn raw_range(headers: &HeaderMap) -> Option<String> {
    headers
        .get(axum::http::header::RANGE)
        .map(|value| String::from_utf8_lossy(value.as_bytes()).into_owned())
}

/// The main responder type. Implements [`IntoResponse`].
#[derive(Debug)]
pub struct Download<R> {
    request: DownloadRequest<R>,
    options: DownloadOptions,
}

impl<R: AsyncRead + AsyncSeekStart + Send + 'static> Download<R> {
    pub fn new(request: DownloadRequest<R>, options: DownloadOptions) -> Self {
        Download { request, options }
    }

    /// Plans the response, returning headers and a not yet started body as
    /// [`DownloadResponse`].
    pub fn try_respond(self) -> Result<DownloadResponse<R>, DownloadError> {
        let DownloadRequest { file, range, download_name, content_type } = self.request;
        let file_length = file.length();

        let spec = match RangeSpec::parse(range.as_deref()) {
            Ok(spec) => spec,
            Err(err) => match self.options.malformed_range {
                MalformedRangePolicy::Reject => {
                    debug!(%err, file_length, "rejecting malformed range");
                    return Err(DownloadError::MalformedRange { source: err, file_length });
                }
                MalformedRangePolicy::Ignore => {
                    debug!(%err, "ignoring malformed range, serving full content");
                    RangeSpec::NoRange
                }
            },
        };

        let plan = spec.resolve(file_length).inspect_err(|_| {
            debug!(?spec, file_length, "range not satisfiable");
        })?;

        let content_type = content_type.unwrap_or_else(|| {
            mime_guess::from_path(file.name())
                .first_or_octet_stream()
                .to_string()
        });
        let download_name = download_name.unwrap_or_else(|| file.name().to_owned());
        let headers =
            headers::build_with(&plan, &content_type, &download_name, self.options.headers)?;

        debug!(
            status = %plan.status,
            start = plan.start,
            length = plan.length,
            file_length,
            "download planned"
        );

        Ok(DownloadResponse {
            plan,
            headers,
            reader: file.into_reader(),
            chunk_size: self.options.chunk_size,
            channel_depth: self.options.channel_depth,
        })
    }
}

impl<R: AsyncRead + AsyncSeekStart + Send + 'static> IntoResponse for Download<R> {
    fn into_response(self) -> Response {
        self.try_respond().into_response()
    }
}

impl IntoResponse for RangeNotSatisfiable {
    fn into_response(self) -> Response {
        let status = StatusCode::RANGE_NOT_SATISFIABLE;
        let accept = TypedHeader(AcceptRanges::bytes());
        let range = TypedHeader(ContentRange::unsatisfied_bytes(self.file_length));
        (status, accept, range, ()).into_response()
    }
}

#[derive(Debug, Error)]
pub enum DownloadError {
    #[error("malformed range for a file of {file_length} bytes")]
    MalformedRange {
        #[source]
        source: MalformedRange,
        file_length: u64,
    },
    #[error(transparent)]
    NotSatisfiable(#[from] RangeNotSatisfiable),
    #[error(transparent)]
    Header(#[from] HeaderError),
}

impl IntoResponse for DownloadError {
    fn into_response(self) -> Response {
        match self {
            DownloadError::MalformedRange { file_length, .. } => {
                RangeNotSatisfiable { file_length }.into_response()
            }
            DownloadError::NotSatisfiable(err) => err.into_response(),
            DownloadError::Header(err) => {
                error!(error = %err, "cannot build download headers");
                StatusCode::INTERNAL_SERVER_ERROR.into_response()
            }
        }
    }
}

/// Computed status, headers and body source for a download. Implements [`IntoResponse`].
///
/// Converting into a response spawns the transfer on the tokio runtime; the
/// returned body pulls its chunks from that task.
pub struct DownloadResponse<R> {
    plan: TransferPlan,
    headers: HeaderMap,
    reader: R,
    chunk_size: usize,
    channel_depth: usize,
}

impl<R> std::fmt::Debug for DownloadResponse<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DownloadResponse")
            .field("plan", &self.plan)
            .field("headers", &self.headers)
            .field("chunk_size", &self.chunk_size)
            .finish()
    }
}

impl<R> DownloadResponse<R> {
    pub fn plan(&self) -> &TransferPlan {
        &self.plan
    }

    pub fn status(&self) -> StatusCode {
        self.plan.status
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }
}

impl<R: AsyncRead + AsyncSeekStart> DownloadResponse<R> {
    /// Streams the body into `sink` on the current task.
    pub async fn send_to<S: ByteSink>(
        self,
        sink: &mut S,
    ) -> Result<TransferOutcome, TransferError> {
        transfer(self.reader, sink, &self.plan, self.chunk_size).await
    }
}

impl<R: AsyncRead + AsyncSeekStart + Send + 'static> IntoResponse for DownloadResponse<R> {
    fn into_response(self) -> Response {
        let DownloadResponse { plan, headers, reader, chunk_size, channel_depth } = self;
        let status = plan.status;

        let (tx, rx) = mpsc::channel(channel_depth.max(1));
        let body = DownloadBody::new(rx, plan.length);

        tokio::spawn(async move {
            let mut sink = ChannelSink::new(tx);
            match transfer(reader, &mut sink, &plan, chunk_size).await {
                Ok(outcome) => debug!(?outcome, "download finished"),
                Err(err) => {
                    error!(
                        error = %err,
                        start = plan.start,
                        length = plan.length,
                        "download aborted"
                    );
                    sink.abort(io::Error::other(err)).await;
                }
            }
        });

        (status, headers, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use std::io;

    use assert_matches::assert_matches;
    use axum::http::header::{
        ACCEPT_RANGES, CONTENT_DISPOSITION, CONTENT_LENGTH, CONTENT_RANGE, CONTENT_TYPE,
    };
    use axum::http::{HeaderValue, StatusCode};
    use axum::response::IntoResponse;
    use bytes::Bytes;
    use futures::{pin_mut, Stream, StreamExt};
    use tokio::fs::File;

    use super::*;
    use crate::transfer::WriterSink;

    async fn collect_body_stream(body: impl Stream<Item = Result<Bytes, axum::Error>>) -> String {
        let mut string = String::new();
        pin_mut!(body);
        while let Some(chunk) = body.next().await.transpose().unwrap() {
            string += std::str::from_utf8(&chunk).unwrap();
        }
        string
    }

    async fn body() -> OpenedFile<File> {
        let file = File::open("test/fixture.txt").await.unwrap();
        OpenedFile::file(file, "fixture.txt").await.unwrap()
    }

    async fn download(range: Option<&str>) -> Download<File> {
        let request = DownloadRequest::new(body().await).range(range.map(str::to_owned));
        Download::new(request, DownloadOptions::default())
    }

    async fn send(response: DownloadResponse<File>) -> String {
        let mut sink = WriterSink(Vec::new());
        response.send_to(&mut sink).await.unwrap();
        String::from_utf8(sink.into_inner()).unwrap()
    }

    #[tokio::test]
    async fn test_full_response() {
        let response = download(None).await.into_response();
        assert_eq!(StatusCode::OK, response.status());

        let head = response.headers();
        assert_eq!(Some(&HeaderValue::from_static("bytes")), head.get(ACCEPT_RANGES));
        assert_eq!(Some(&HeaderValue::from_static("54")), head.get(CONTENT_LENGTH));
        assert_eq!(Some(&HeaderValue::from_static("text/plain")), head.get(CONTENT_TYPE));
        assert_eq!(
            Some(&HeaderValue::from_static("attachment; filename=\"fixture.txt\"")),
            head.get(CONTENT_DISPOSITION)
        );
        assert!(head.get(CONTENT_RANGE).is_none());

        let body = collect_body_stream(response.into_body().into_data_stream()).await;
        assert_eq!("Hello world this is a file to test range requests on!\n", body);
    }

    #[tokio::test]
    async fn test_partial_response_1() {
        let response = download(Some("bytes=0-29")).await.try_respond().unwrap();

        assert_eq!(StatusCode::PARTIAL_CONTENT, response.status());
        assert_eq!("bytes 0-29/54", response.headers()[CONTENT_RANGE]);
        assert_eq!("30", response.headers()[CONTENT_LENGTH]);
        assert_eq!("Hello world this is a file to ", send(response).await);
    }

    #[tokio::test]
    async fn test_partial_response_2() {
        let response = download(Some("bytes=30-53")).await.try_respond().unwrap();

        assert_eq!("bytes 30-53/54", response.headers()[CONTENT_RANGE]);
        assert_eq!("test range requests on!\n", send(response).await);
    }

    #[tokio::test]
    async fn test_unbounded_end_response() {
        let response = download(Some("bytes=40-")).await.try_respond().unwrap();

        assert_eq!("bytes 40-53/54", response.headers()[CONTENT_RANGE]);
        assert_eq!(" requests on!\n", send(response).await);
    }

    #[tokio::test]
    async fn test_one_byte_response() {
        let response = download(Some("bytes=30-30")).await.try_respond().unwrap();

        assert_eq!("1", response.headers()[CONTENT_LENGTH]);
        assert_eq!("t", send(response).await);
    }

    #[tokio::test]
    async fn test_partial_response_over_http() {
        let response = download(Some("bytes=6-10")).await.into_response();
        assert_eq!(StatusCode::PARTIAL_CONTENT, response.status());
        assert_eq!("bytes 6-10/54", response.headers()[CONTENT_RANGE]);

        let body = collect_body_stream(response.into_body().into_data_stream()).await;
        assert_eq!("world", body);
    }

    #[tokio::test]
    async fn test_invalid_range() {
        let err = download(Some("bytes=30-29")).await.try_respond().unwrap_err();
        assert_matches!(err, DownloadError::MalformedRange { file_length: 54, .. });
    }

    #[tokio::test]
    async fn test_range_end_exceed_length() {
        let err = download(Some("bytes=30-99")).await.try_respond().unwrap_err();
        assert_matches!(
            err,
            DownloadError::NotSatisfiable(RangeNotSatisfiable { file_length: 54 })
        );
    }

    #[tokio::test]
    async fn test_range_start_exceed_length() {
        let response = download(Some("bytes=99-")).await.into_response();

        assert_eq!(StatusCode::RANGE_NOT_SATISFIABLE, response.status());
        assert_eq!("bytes */54", response.headers()[CONTENT_RANGE]);
    }

    #[tokio::test]
    async fn test_malformed_range_rejected_by_default() {
        for header in ["bytes=-20", "bytes=0-0,-1", "items=0-1"] {
            let response = download(Some(header)).await.into_response();
            assert_eq!(StatusCode::RANGE_NOT_SATISFIABLE, response.status(), "{header}");
            assert_eq!("bytes */54", response.headers()[CONTENT_RANGE]);
        }
    }

    #[tokio::test]
    async fn test_malformed_range_ignored() {
        let options = DownloadOptions {
            malformed_range: MalformedRangePolicy::Ignore,
            ..DownloadOptions::default()
        };
        let request = DownloadRequest::new(body().await).range(Some("bytes=0-0,-1".to_owned()));
        let response = Download::new(request, options).try_respond().unwrap();

        assert_eq!(StatusCode::OK, response.status());
        assert_eq!("54", response.headers()[CONTENT_LENGTH]);
        assert_eq!("Hello world this is a file to test range requests on!\n", send(response).await);
    }

    #[tokio::test]
    async fn test_ignore_policy_still_refuses_unsatisfiable() {
        let options = DownloadOptions {
            malformed_range: MalformedRangePolicy::Ignore,
            ..DownloadOptions::default()
        };
        let request = DownloadRequest::new(body().await).range(Some("bytes=54-".to_owned()));
        let err = Download::new(request, options).try_respond().unwrap_err();
        assert_matches!(err, DownloadError::NotSatisfiable(_));
    }

    #[tokio::test]
    async fn test_name_and_type_overrides() {
        let request = DownloadRequest::new(body().await)
            .download_name("read me.txt")
            .content_type("application/octet-stream");
        let response = Download::new(request, DownloadOptions::default()).try_respond().unwrap();

        assert_eq!("application/octet-stream", response.headers()[CONTENT_TYPE]);
        assert_eq!(
            "attachment; filename=\"read%20me.txt\"",
            response.headers()[CONTENT_DISPOSITION]
        );
    }

    #[tokio::test]
    async fn test_unknown_extension_is_octet_stream() {
        let file = OpenedFile::sized(io::Cursor::new(vec![1u8, 2, 3]), 3, "blob.zzz-unknown");
        let response = Download::new(DownloadRequest::new(file), DownloadOptions::default())
            .try_respond()
            .unwrap();
        assert_eq!("application/octet-stream", response.headers()[CONTENT_TYPE]);
    }

    #[tokio::test]
    async fn test_empty_file() {
        let empty = || OpenedFile::sized(io::Cursor::new(Vec::<u8>::new()), 0, "empty.bin");

        let response = Download::new(DownloadRequest::new(empty()), DownloadOptions::default())
            .into_response();
        assert_eq!(StatusCode::OK, response.status());
        assert_eq!("0", response.headers()[CONTENT_LENGTH]);
        assert_eq!("", collect_body_stream(response.into_body().into_data_stream()).await);

        let request = DownloadRequest::new(empty()).range(Some("bytes=0-".to_owned()));
        let response = Download::new(request, DownloadOptions::default()).into_response();
        assert_eq!(StatusCode::RANGE_NOT_SATISFIABLE, response.status());
        assert_eq!("bytes */0", response.headers()[CONTENT_RANGE]);
    }

    #[tokio::test]
    async fn test_truncated_file_aborts_body() {
        // length captured at open time, the file then shrank
        let file = OpenedFile::sized(io::Cursor::new(vec![b'x'; 10]), 4096, "shrunk.bin");
        let response = Download::new(DownloadRequest::new(file), DownloadOptions::default())
            .into_response();
        assert_eq!(StatusCode::OK, response.status());

        let stream = response.into_body().into_data_stream();
        pin_mut!(stream);
        let mut received = 0;
        let mut failed = false;
        while let Some(chunk) = stream.next().await {
            match chunk {
                Ok(chunk) => received += chunk.len(),
                Err(_) => {
                    failed = true;
                    break;
                }
            }
        }
        assert_eq!(10, received);
        assert!(failed, "a short body must end in an error, not a clean end of stream");
    }

    #[test]
    fn test_raw_range() {
        let mut headers = HeaderMap::new();
        assert_eq!(None, raw_range(&headers));

        headers.insert(axum::http::header::RANGE, HeaderValue::from_static("bytes=1-2"));
        assert_eq!(Some("bytes=1-2".to_owned()), raw_range(&headers));

        headers.insert(axum::http::header::RANGE, HeaderValue::from_bytes(b"bytes=\xff-").unwrap());
        let raw = raw_range(&headers).unwrap();
        assert!(RangeSpec::parse(Some(&raw)).is_err());
    }
}
