//! A cheap in-memory [`AsyncRead`] + [`AsyncSeek`] used by [`crate::MemoryCache`]
//! and [`crate::NoopCache`], whose payloads never leave RAM and so never need
//! to actually suspend a task to make progress.

use std::{
    io,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
};

use tokio::io::{AsyncRead, AsyncSeek, ReadBuf};

/// An [`AsyncRead`] + [`AsyncSeek`] view over a shared, immutable byte
/// buffer. Reads and seeks never actually block, so they are serviced
/// synchronously and immediately report `Poll::Ready`.
pub struct BytesReader {
    bytes: Arc<[u8]>,
    position: usize,
}

impl BytesReader {
    /// Creates a new reader over `bytes`, positioned at the start.
    pub fn new(bytes: Arc<[u8]>) -> Self {
        Self { bytes, position: 0 }
    }
}

impl AsyncRead for BytesReader {
    fn poll_read(
        mut self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let remaining = &self.bytes[self.position..];
        let n = remaining.len().min(buf.remaining());
        buf.put_slice(&remaining[..n]);
        self.position += n;
        Poll::Ready(Ok(()))
    }
}

impl AsyncSeek for BytesReader {
    fn start_seek(mut self: Pin<&mut Self>, position: io::SeekFrom) -> io::Result<()> {
        let new_position = match position {
            io::SeekFrom::Start(offset) => offset as i64,
            io::SeekFrom::End(offset) => self.bytes.len() as i64 + offset,
            io::SeekFrom::Current(offset) => self.position as i64 + offset,
        };
        if new_position < 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "attempted to seek before the start of the buffer",
            ));
        }
        self.position = (new_position as usize).min(self.bytes.len());
        Ok(())
    }

    fn poll_complete(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<u64>> {
        Poll::Ready(Ok(self.position as u64))
    }
}
