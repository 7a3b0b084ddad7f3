//! Split one response body between the client and a background consumer.
//!
//! The foreground half is handed to the client and drives the upstream read.
//! Every chunk it yields is first copied into a bounded channel read by the
//! background half, so a slow background consumer slows the client down
//! instead of buffering without limit. If the background half goes away the
//! foreground keeps streaming on its own.
//!
//! A server stops polling a body with a declared `Content-Length` once that
//! many bytes are written, so the stream may never be polled to its end. When
//! the length is known, reaching it counts as completion.

use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use bytes::{Bytes, BytesMut};
use futures_core::Stream;
use futures_util::StreamExt;
use tokio::sync::mpsc;
use tokio_util::sync::PollSender;

use crate::body::{BoxError, ByteStream};

#[derive(Debug, Clone, thiserror::Error)]
pub enum TeeError {
    #[error("response body was abandoned before it completed")]
    Aborted,
    #[error("response body failed: {0}")]
    Source(String),
}

pub fn tee(
    source: ByteStream,
    buffer_chunks: usize,
    expected_len: Option<u64>,
) -> (Foreground, Background) {
    let (tx, rx) = mpsc::channel(buffer_chunks.max(1));
    let complete = Arc::new(AtomicBool::new(false));
    let mut foreground = Foreground {
        source,
        tx: PollSender::new(tx),
        pending: None,
        complete: Arc::clone(&complete),
        finished: false,
        delivered: 0,
        expected_len,
    };
    if expected_len == Some(0) {
        foreground.finish();
    }
    let background = Background {
        rx,
        complete,
        finished: false,
    };
    (foreground, background)
}

pub struct Foreground {
    source: ByteStream,
    tx: PollSender<Result<Bytes, TeeError>>,
    // chunk read from the source but not yet copied to the background
    pending: Option<Bytes>,
    complete: Arc<AtomicBool>,
    finished: bool,
    delivered: u64,
    expected_len: Option<u64>,
}

impl Foreground {
    fn finish(&mut self) {
        self.finished = true;
        self.complete.store(true, Ordering::Release);
        self.tx.close();
    }

    fn reached_expected_len(&self) -> bool {
        self.expected_len.is_some_and(|n| self.delivered >= n)
    }
}

impl Stream for Foreground {
    type Item = Result<Bytes, BoxError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.finished {
            return Poll::Ready(None);
        }

        loop {
            if let Some(chunk) = this.pending.take() {
                if !this.tx.is_closed() {
                    match this.tx.poll_reserve(cx) {
                        Poll::Pending => {
                            this.pending = Some(chunk);
                            return Poll::Pending;
                        }
                        Poll::Ready(Ok(())) => {
                            let _ = this.tx.send_item(Ok(chunk.clone()));
                        }
                        // background dropped its half
                        Poll::Ready(Err(_)) => {}
                    }
                }
                this.delivered += chunk.len() as u64;
                if this.reached_expected_len() {
                    this.finish();
                }
                return Poll::Ready(Some(Ok(chunk)));
            }

            match this.source.as_mut().poll_next(cx) {
                Poll::Ready(Some(Ok(chunk))) if chunk.is_empty() => continue,
                Poll::Ready(Some(Ok(chunk))) => this.pending = Some(chunk),
                Poll::Ready(Some(Err(e))) => {
                    this.finished = true;
                    if let Some(tx) = this.tx.get_ref() {
                        let _ = tx.try_send(Err(TeeError::Source(e.to_string())));
                    }
                    this.tx.close();
                    return Poll::Ready(Some(Err(e)));
                }
                Poll::Ready(None) => {
                    this.finish();
                    return Poll::Ready(None);
                }
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

/// Receiving half of [`tee`]. Yields the same chunks as the foreground, in
/// order, then ends. If the foreground is dropped before the source finished,
/// the last item is `Err(TeeError::Aborted)`.
pub struct Background {
    rx: mpsc::Receiver<Result<Bytes, TeeError>>,
    complete: Arc<AtomicBool>,
    finished: bool,
}

impl Background {
    pub async fn collect(mut self) -> Result<Bytes, TeeError> {
        let mut buf = BytesMut::new();
        while let Some(chunk) = self.next().await {
            buf.extend_from_slice(&chunk?);
        }
        Ok(buf.freeze())
    }

    pub fn boxed(self) -> ByteStream {
        Box::pin(self.map(|r| r.map_err(BoxError::from)))
    }
}

impl Stream for Background {
    type Item = Result<Bytes, TeeError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.finished {
            return Poll::Ready(None);
        }
        match this.rx.poll_recv(cx) {
            Poll::Ready(Some(Ok(chunk))) => Poll::Ready(Some(Ok(chunk))),
            Poll::Ready(Some(Err(e))) => {
                this.finished = true;
                Poll::Ready(Some(Err(e)))
            }
            Poll::Ready(None) => {
                this.finished = true;
                if this.complete.load(Ordering::Acquire) {
                    Poll::Ready(None)
                } else {
                    Poll::Ready(Some(Err(TeeError::Aborted)))
                }
            }
            Poll::Pending => Poll::Pending,
        }
    }
}
