use std::future::Future;
use std::io;
use std::num::NonZeroUsize;

use bytes::Bytes;
use futures::{pin_mut, StreamExt};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::range::TransferPlan;
use crate::stream::ChunkStream;
use crate::AsyncSeekStart;

/// Read size used when none is configured.
pub const DEFAULT_CHUNK_SIZE: usize = 1024;

/// Destination for a transfer's bytes, usually a network peer.
pub trait ByteSink {
    /// Writes the whole chunk. Disconnect-class errors (see [`is_disconnect`])
    /// end the transfer quietly, anything else fails it.
    fn write_chunk(&mut self, chunk: Bytes) -> impl Future<Output = io::Result<()>> + Send;

    fn flush(&mut self) -> impl Future<Output = io::Result<()>> + Send;
}

/// [`ByteSink`] over any [`AsyncWrite`].
#[derive(Debug)]
pub struct WriterSink<W>(pub W);

impl<W: AsyncWrite + Unpin + Send> ByteSink for WriterSink<W> {
    async fn write_chunk(&mut self, chunk: Bytes) -> io::Result<()> {
        self.0.write_all(&chunk).await
    }

    async fn flush(&mut self) -> io::Result<()> {
        self.0.flush().await
    }
}

impl<W> WriterSink<W> {
    pub fn into_inner(self) -> W {
        self.0
    }
}

/// [`ByteSink`] feeding a [`DownloadBody`](crate::DownloadBody).
///
/// Dropping the receiving body, which hyper does when the peer goes away,
/// surfaces here as [`io::ErrorKind::BrokenPipe`].
#[derive(Debug)]
pub struct ChannelSink {
    tx: mpsc::Sender<io::Result<Bytes>>,
}

impl ChannelSink {
    pub fn new(tx: mpsc::Sender<io::Result<Bytes>>) -> Self {
        ChannelSink { tx }
    }

    /// Hands a fatal error to the body so the connection is torn down
    /// instead of ending cleanly with a short body.
    pub async fn abort(self, error: io::Error) {
        // a closed receiver already ended the response
        let _ = self.tx.send(Err(error)).await;
    }
}

impl ByteSink for ChannelSink {
    async fn write_chunk(&mut self, chunk: Bytes) -> io::Result<()> {
        self.tx
            .send(Ok(chunk))
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "download body dropped"))
    }

    async fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// How a transfer that did not fail ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferOutcome {
    /// Every byte of the plan was handed to the sink and flushed.
    Completed { delivered: u64 },
    /// The peer went away after `delivered` bytes.
    PeerDisconnected { delivered: u64 },
}

impl TransferOutcome {
    pub fn delivered(&self) -> u64 {
        match *self {
            TransferOutcome::Completed { delivered }
            | TransferOutcome::PeerDisconnected { delivered } => delivered,
        }
    }
}

#[derive(Debug, Error)]
pub enum TransferError {
    #[error("chunk size must be at least one byte")]
    ZeroChunkSize,
    #[error("failed to read source after {delivered} bytes")]
    Read {
        delivered: u64,
        #[source]
        source: io::Error,
    },
    #[error("source ended after {delivered} of {expected} bytes")]
    UnexpectedEof { delivered: u64, expected: u64 },
    #[error("failed to write to sink after {delivered} bytes")]
    Write {
        delivered: u64,
        #[source]
        source: io::Error,
    },
}

/// Errors meaning the peer closed the connection.
pub fn is_disconnect(error: &io::Error) -> bool {
    matches!(
        error.kind(),
        io::ErrorKind::BrokenPipe
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::NotConnected
            | io::ErrorKind::WriteZero
    )
}

/// Streams exactly the span of `plan` from `source` into `sink`.
///
/// `source` is consumed and dropped on every exit path. A peer disconnect
/// is not an error and returns [`TransferOutcome::PeerDisconnected`]; read
/// failures and a source shorter than the plan are fatal.
pub async fn transfer<R, S>(
    source: R,
    sink: &mut S,
    plan: &TransferPlan,
    chunk_size: usize,
) -> Result<TransferOutcome, TransferError>
where
    R: AsyncRead + AsyncSeekStart,
    S: ByteSink,
{
    let chunk_size = NonZeroUsize::new(chunk_size).ok_or(TransferError::ZeroChunkSize)?;
    let chunks = ChunkStream::new(source, plan, chunk_size);
    pin_mut!(chunks);

    let mut delivered = 0u64;
    while let Some(chunk) = chunks.next().await {
        let chunk = chunk.map_err(|source| {
            if source.kind() == io::ErrorKind::UnexpectedEof {
                TransferError::UnexpectedEof { delivered, expected: plan.length }
            } else {
                TransferError::Read { delivered, source }
            }
        })?;

        let len = chunk.len() as u64;
        match sink.write_chunk(chunk).await {
            Ok(()) => delivered += len,
            Err(e) if is_disconnect(&e) => return Ok(disconnected(delivered, plan, &e)),
            Err(source) => return Err(TransferError::Write { delivered, source }),
        }
        trace!(delivered, "chunk written");
    }

    match sink.flush().await {
        Ok(()) => {}
        Err(e) if is_disconnect(&e) => return Ok(disconnected(delivered, plan, &e)),
        Err(source) => return Err(TransferError::Write { delivered, source }),
    }

    debug!(start = plan.start, delivered, "transfer complete");
    Ok(TransferOutcome::Completed { delivered })
}

fn disconnected(delivered: u64, plan: &TransferPlan, error: &io::Error) -> TransferOutcome {
    debug!(
        start = plan.start,
        delivered,
        expected = plan.length,
        %error,
        "peer disconnected during transfer"
    );
    TransferOutcome::PeerDisconnected { delivered }
}
