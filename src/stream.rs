use std::io;
use std::num::NonZeroUsize;
use std::pin::Pin;
use std::task::{Context, Poll};

use axum::response::{IntoResponse, Response};
use bytes::{Bytes, BytesMut};
use futures::Stream;
use http_body::{Body, Frame, SizeHint};
use pin_project::pin_project;
use tokio::io::{AsyncRead, ReadBuf};
use tokio::sync::mpsc;

use crate::range::TransferPlan;
use crate::AsyncSeekStart;

/// Lazily reads exactly the span of a [`TransferPlan`] in bounded chunks.
///
/// Seeks once to the plan's start, then yields chunks of at most
/// `chunk_size` bytes. The final read is clipped to the bytes still owed, so
/// nothing past the span is ever read. A source that ends early yields an
/// [`io::ErrorKind::UnexpectedEof`] error. The stream is fused after the last
/// chunk or the first error.
#[pin_project]
pub struct ChunkStream<R> {
    state: StreamState,
    chunk_size: NonZeroUsize,
    #[pin]
    source: R,
}

#[derive(Debug)]
enum StreamState {
    Seek { start: u64, remaining: u64 },
    Seeking { remaining: u64 },
    Reading { buffer: BytesMut, remaining: u64 },
    Done,
}

impl<R: AsyncRead + AsyncSeekStart> ChunkStream<R> {
    pub fn new(source: R, plan: &TransferPlan, chunk_size: NonZeroUsize) -> Self {
        ChunkStream {
            state: StreamState::Seek { start: plan.start, remaining: plan.length },
            chunk_size,
            source,
        }
    }
}

impl<R> std::fmt::Debug for ChunkStream<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChunkStream")
            .field("state", &self.state)
            .field("chunk_size", &self.chunk_size)
            .finish()
    }
}

impl<R: AsyncRead + AsyncSeekStart> Stream for ChunkStream<R> {
    type Item = io::Result<Bytes>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<io::Result<Bytes>>> {
        let mut this = self.project();

        if let StreamState::Seek { start, remaining } = *this.state {
            if let Err(e) = this.source.as_mut().start_seek(start) {
                *this.state = StreamState::Done;
                return Poll::Ready(Some(Err(e)));
            }
            *this.state = StreamState::Seeking { remaining };
        }

        if let StreamState::Seeking { remaining } = *this.state {
            match this.source.as_mut().poll_complete(cx) {
                Poll::Pending => return Poll::Pending,
                Poll::Ready(Err(e)) => {
                    *this.state = StreamState::Done;
                    return Poll::Ready(Some(Err(e)));
                }
                Poll::Ready(Ok(())) => {
                    let buffer = BytesMut::with_capacity(this.chunk_size.get());
                    *this.state = StreamState::Reading { buffer, remaining };
                }
            }
        }

        if let StreamState::Reading { buffer, remaining } = this.state {
            if *remaining == 0 {
                *this.state = StreamState::Done;
                return Poll::Ready(None);
            }

            // the smaller of the chunk size and the bytes still owed
            let chunk_size = this.chunk_size.get();
            let nbytes = usize::try_from(*remaining).map_or(chunk_size, |r| r.min(chunk_size));

            // reclaims the allocation once every previously split chunk is dropped
            buffer.reserve(nbytes);
            let uninit = buffer.spare_capacity_mut();
            let mut read_buf = ReadBuf::uninit(&mut uninit[..nbytes]);

            match this.source.as_mut().poll_read(cx, &mut read_buf) {
                Poll::Pending => return Poll::Pending,
                Poll::Ready(Err(e)) => {
                    *this.state = StreamState::Done;
                    return Poll::Ready(Some(Err(e)));
                }
                Poll::Ready(Ok(())) => {
                    let n = read_buf.filled().len();
                    if n == 0 {
                        let missing = *remaining;
                        *this.state = StreamState::Done;
                        return Poll::Ready(Some(Err(io::Error::new(
                            io::ErrorKind::UnexpectedEof,
                            format!("source ended with {missing} bytes still to send"),
                        ))));
                    }

                    // SAFETY: poll_read has initialized `n` bytes of spare
                    // capacity, and `buffer` is empty between chunks
                    unsafe { buffer.set_len(buffer.len() + n) };

                    // n <= nbytes <= remaining
                    *remaining -= n as u64;
                    return Poll::Ready(Some(Ok(buffer.split().freeze())));
                }
            }
        }

        Poll::Ready(None)
    }
}

/// Response body fed by a running transfer. Implements [`Body`] and [`IntoResponse`].
///
/// Chunks arrive over a bounded channel, so a slow peer holds back the
/// reads. Dropping the body is how the transfer learns the peer left.
#[derive(Debug)]
pub struct DownloadBody {
    rx: mpsc::Receiver<io::Result<Bytes>>,
    length: u64,
}

impl DownloadBody {
    pub(crate) fn new(rx: mpsc::Receiver<io::Result<Bytes>>, length: u64) -> Self {
        DownloadBody { rx, length }
    }
}

impl Body for DownloadBody {
    type Data = Bytes;
    type Error = io::Error;

    fn size_hint(&self) -> SizeHint {
        SizeHint::with_exact(self.length)
    }

    fn poll_frame(mut self: Pin<&mut Self>, cx: &mut Context<'_>)
        -> Poll<Option<io::Result<Frame<Bytes>>>>
    {
        self.rx
            .poll_recv(cx)
            .map(|item| item.map(|result| result.map(Frame::data)))
    }
}

impl IntoResponse for DownloadBody {
    fn into_response(self) -> Response {
        Response::new(axum::body::Body::new(self))
    }
}
