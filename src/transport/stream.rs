//! Shared read/write core used by every transport.
//!
//! The read half is driven by a [`FramedRead`] over [`FrameCodec`], so
//! partial frames stay buffered between reads and batched frames are
//! yielded one at a time. The write half sits behind its own mutex, which
//! lets request senders write while the receive loop is parked on a read.

use bytes::Bytes;
use futures_util::StreamExt;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;
use tokio_util::codec::FramedRead;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::rpc::codec::FrameCodec;
use crate::rpc::message::Message;
use crate::transport::{BoxFuture, Transport};
use crate::{AppError, Result};

/// Read buffer capacity reserved for each underlying read: 64 KiB.
pub const READ_CHUNK_BYTES: usize = 64 * 1024;

type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Framed transport over an arbitrary reader/writer pair.
///
/// Used directly with in-memory pipes (see [`tokio::io::duplex`]) and wrapped
/// by the process and socket transports.
pub struct StreamTransport {
    label: String,
    reader: Mutex<FramedRead<BoxedReader, FrameCodec>>,
    writer: Mutex<Option<BoxedWriter>>,
    closed: CancellationToken,
}

impl std::fmt::Debug for StreamTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamTransport")
            .field("label", &self.label)
            .field("closed", &self.closed.is_cancelled())
            .finish_non_exhaustive()
    }
}

impl StreamTransport {
    /// Wrap a reader/writer pair. `label` tags log lines for this transport.
    pub fn from_io<R, W>(label: impl Into<String>, reader: R, writer: W) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let reader: BoxedReader = Box::new(reader);
        let writer: BoxedWriter = Box::new(writer);
        Self {
            label: label.into(),
            reader: Mutex::new(FramedRead::with_capacity(
                reader,
                FrameCodec::new(),
                READ_CHUNK_BYTES,
            )),
            writer: Mutex::new(Some(writer)),
            closed: CancellationToken::new(),
        }
    }

    /// Label given at construction.
    #[must_use]
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Write `frame` and flush.
    ///
    /// # Errors
    ///
    /// [`AppError::NotConnected`] once closed; [`AppError::ConnectionFailed`]
    /// on a write error.
    pub async fn send_frame(&self, frame: &[u8]) -> Result<()> {
        if self.closed.is_cancelled() {
            return Err(AppError::NotConnected(format!("{} transport is closed", self.label)));
        }

        let mut guard = self.writer.lock().await;
        let Some(writer) = guard.as_mut() else {
            return Err(AppError::NotConnected(format!("{} transport is closed", self.label)));
        };

        tokio::select! {
            biased;

            () = self.closed.cancelled() => {
                Err(AppError::NotConnected(format!("{} transport closed during write", self.label)))
            }

            written = write_and_flush(writer, frame) => {
                written.map_err(|e| AppError::ConnectionFailed(format!("write failed: {e}")))
            }
        }
    }

    /// Wait for the next decoded message.
    ///
    /// # Errors
    ///
    /// [`AppError::ConnectionClosed`] at EOF or once closed;
    /// [`AppError::ConnectionFailed`] on a read error;
    /// [`AppError::InvalidResponse`] on a framing error.
    pub async fn next_message(&self) -> Result<Message> {
        let mut reader = tokio::select! {
            biased;

            () = self.closed.cancelled() => return Err(self.closed_error()),
            guard = self.reader.lock() => guard,
        };

        tokio::select! {
            biased;

            () = self.closed.cancelled() => Err(self.closed_error()),

            item = reader.next() => match item {
                None => {
                    debug!(transport = %self.label, "transport: EOF detected");
                    Err(AppError::ConnectionClosed(format!(
                        "{} peer closed the stream",
                        self.label
                    )))
                }
                Some(Ok(msg)) => Ok(msg),
                Some(Err(AppError::Io(msg))) => {
                    Err(AppError::ConnectionFailed(format!("read failed: {msg}")))
                }
                Some(Err(e)) => Err(e),
            },
        }
    }

    /// Mark the transport closed and shut the write half down.
    ///
    /// Wakes any pending [`next_message`](Self::next_message) or
    /// [`send_frame`](Self::send_frame) call. Idempotent.
    pub async fn shutdown(&self) {
        if self.closed.is_cancelled() {
            return;
        }
        self.closed.cancel();

        let writer = self.writer.lock().await.take();
        if let Some(mut writer) = writer {
            if let Err(e) = writer.shutdown().await {
                debug!(transport = %self.label, error = %e, "transport: writer shutdown failed");
            }
        }
        debug!(transport = %self.label, "transport: closed");
    }

    /// Whether [`shutdown`](Self::shutdown) has been called.
    #[must_use]
    pub fn is_shut_down(&self) -> bool {
        self.closed.is_cancelled()
    }

    fn closed_error(&self) -> AppError {
        AppError::ConnectionClosed(format!("{} transport closed", self.label))
    }
}

impl Transport for StreamTransport {
    fn send(&self, frame: Bytes) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move { self.send_frame(&frame).await })
    }

    fn receive_next(&self) -> BoxFuture<'_, Result<Message>> {
        Box::pin(self.next_message())
    }

    fn close(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            self.shutdown().await;
            Ok(())
        })
    }

    fn is_closed(&self) -> bool {
        self.is_shut_down()
    }
}

async fn write_and_flush(writer: &mut BoxedWriter, frame: &[u8]) -> std::io::Result<()> {
    writer.write_all(frame).await?;
    writer.flush().await
}
