//! Exact-size transfers over byte streams.
//!
//! A single `read` or `write` on a socket may move fewer bytes than asked for.
//! [`ReadOperation`] and [`WriteOperation`] keep reissuing the remainder until
//! the whole buffer has been moved, a chunk makes no progress, or the stream
//! reports an error. Either way they complete exactly once with a
//! [`TransferOutcome`].

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::task::JoinHandle;
use tracing::trace;

use crate::{AppError, AppResult};

/// Cursor over a fixed-size transfer buffer.
#[derive(Debug, Clone, Copy)]
struct Progress {
    size: usize,
    position: usize,
}

impl Progress {
    fn new(size: usize) -> Self {
        Progress { size, position: 0 }
    }

    fn remaining(&self) -> usize {
        self.size - self.position
    }

    fn advance(&mut self, steps: usize) {
        debug_assert!(steps <= self.remaining(), "transfer overflow");
        self.position = (self.position + steps).min(self.size);
    }

    fn stream_closed(&self) -> AppError {
        AppError::StreamClosed {
            transferred: self.position,
            expected: self.size,
        }
    }
}

/// The single completion of a transfer operation.
///
/// The stream is handed back so that the caller can issue the next operation
/// on it. On failure `buffer` still holds whatever was moved before the fault
/// (for reads, the first `transferred` bytes).
#[derive(Debug)]
pub struct TransferOutcome<S> {
    pub stream: S,
    pub buffer: Bytes,
    pub transferred: usize,
    pub fault: Option<AppError>,
}

impl<S> TransferOutcome<S> {
    pub fn is_success(&self) -> bool {
        self.fault.is_none()
    }

    /// Converts the outcome into the transferred buffer, dropping the stream.
    pub fn into_result(self) -> AppResult<Bytes> {
        match self.fault {
            None => Ok(self.buffer),
            Some(fault) => Err(fault),
        }
    }
}

/// Reads exactly `size` bytes from a stream.
#[derive(Debug)]
pub struct ReadOperation<R> {
    stream: R,
    buffer: BytesMut,
    progress: Progress,
}

impl<R> ReadOperation<R>
where
    R: AsyncRead + Unpin,
{
    pub fn new(stream: R, size: usize) -> Self {
        ReadOperation {
            stream,
            buffer: BytesMut::zeroed(size),
            progress: Progress::new(size),
        }
    }

    /// Drives the read to completion.
    ///
    /// A chunk of zero bytes means the peer closed the stream and completes the
    /// operation as [`AppError::StreamClosed`]. A zero-size read completes
    /// immediately without touching the stream.
    pub async fn execute(mut self) -> TransferOutcome<R> {
        let mut fault = None;
        while self.progress.remaining() > 0 {
            let position = self.progress.position;
            match self.stream.read(&mut self.buffer[position..]).await {
                Ok(0) => {
                    fault = Some(self.progress.stream_closed());
                    break;
                }
                Ok(read) => {
                    self.progress.advance(read);
                    trace!(
                        read,
                        remaining = self.progress.remaining(),
                        "read operation progressed"
                    );
                }
                Err(err) => {
                    fault = Some(AppError::IoError(err));
                    break;
                }
            }
        }
        let transferred = self.progress.position;
        self.buffer.truncate(transferred);
        TransferOutcome {
            stream: self.stream,
            buffer: self.buffer.freeze(),
            transferred,
            fault,
        }
    }

    /// Starts the read on the runtime and returns immediately. `on_complete`
    /// is invoked exactly once with the outcome.
    pub fn submit<F>(self, on_complete: F) -> JoinHandle<()>
    where
        R: Send + 'static,
        F: FnOnce(TransferOutcome<R>) + Send + 'static,
    {
        tokio::spawn(async move {
            let outcome = self.execute().await;
            on_complete(outcome);
        })
    }
}

/// Writes a whole buffer to a stream and flushes it.
#[derive(Debug)]
pub struct WriteOperation<W> {
    stream: W,
    buffer: Bytes,
    progress: Progress,
}

impl<W> WriteOperation<W>
where
    W: AsyncWrite + Unpin,
{
    pub fn new(stream: W, buffer: Bytes) -> Self {
        let progress = Progress::new(buffer.len());
        WriteOperation {
            stream,
            buffer,
            progress,
        }
    }

    /// Drives the write to completion, then flushes the stream.
    pub async fn execute(mut self) -> TransferOutcome<W> {
        let mut fault = None;
        while self.progress.remaining() > 0 {
            let position = self.progress.position;
            match self.stream.write(&self.buffer[position..]).await {
                Ok(0) => {
                    fault = Some(self.progress.stream_closed());
                    break;
                }
                Ok(written) => self.progress.advance(written),
                Err(err) => {
                    fault = Some(AppError::IoError(err));
                    break;
                }
            }
        }
        if fault.is_none() {
            if let Err(err) = self.stream.flush().await {
                fault = Some(AppError::IoError(err));
            }
        }
        TransferOutcome {
            stream: self.stream,
            buffer: self.buffer,
            transferred: self.progress.position,
            fault,
        }
    }

    /// Starts the write on the runtime and returns immediately. `on_complete`
    /// is invoked exactly once with the outcome.
    pub fn submit<F>(self, on_complete: F) -> JoinHandle<()>
    where
        W: Send + 'static,
        F: FnOnce(TransferOutcome<W>) + Send + 'static,
    {
        tokio::spawn(async move {
            let outcome = self.execute().await;
            on_complete(outcome);
        })
    }
}
