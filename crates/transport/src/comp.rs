//! Deflate stream codec.
//!
//! [`CompStream`] wraps any async byte stream. Every write is compressed and
//! sync-flushed, so the peer can decode it without waiting for more data.
//! Both ends of a stream must agree on whether compression is on.

use std::io;
use std::pin::Pin;
use std::task::{ready, Context, Poll};

use flate2::{Compress, Compression, Decompress, FlushCompress, FlushDecompress, Status};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

/// Compressed input buffered ahead of the decoder.
const READ_BUF_SIZE: usize = 64 * 1024;

/// Minimum spare output room handed to the encoder per call.
const WRITE_CHUNK: usize = 4096;

pub struct CompStream<S> {
    inner: S,
    encoder: Compress,
    decoder: Decompress,
    /// Compressed bytes not yet written to `inner`.
    pending: Vec<u8>,
    pending_pos: usize,
    input: Box<[u8]>,
    input_start: usize,
    input_end: usize,
    eof: bool,
}

impl<S> CompStream<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            encoder: Compress::new(Compression::fast(), false),
            decoder: Decompress::new(false),
            pending: Vec::new(),
            pending_pos: 0,
            input: vec![0_u8; READ_BUF_SIZE].into_boxed_slice(),
            input_start: 0,
            input_end: 0,
            eof: false,
        }
    }

    pub fn get_ref(&self) -> &S {
        &self.inner
    }
}

fn invalid_data<E: std::fmt::Display>(e: E) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, e.to_string())
}

impl<S: AsyncWrite + Unpin> CompStream<S> {
    /// Write every pending compressed byte to the inner stream.
    fn poll_drain(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        while self.pending_pos < self.pending.len() {
            let chunk = self.pending.get(self.pending_pos..).unwrap_or_default();
            let n = ready!(Pin::new(&mut self.inner).poll_write(cx, chunk))?;
            if n == 0 {
                return Poll::Ready(Err(io::ErrorKind::WriteZero.into()));
            }
            self.pending_pos = self.pending_pos.saturating_add(n);
        }
        self.pending.clear();
        self.pending_pos = 0;
        Poll::Ready(Ok(()))
    }

    /// Compress `buf` with a sync flush, appending to `pending`.
    fn encode(&mut self, buf: &[u8]) -> io::Result<()> {
        let mut consumed = 0_usize;
        loop {
            if self.pending.capacity() - self.pending.len() < WRITE_CHUNK {
                self.pending.reserve(WRITE_CHUNK.max(buf.len() / 2));
            }
            let before = self.encoder.total_in();
            let input = buf.get(consumed..).unwrap_or_default();
            self.encoder
                .compress_vec(input, &mut self.pending, FlushCompress::Sync)
                .map_err(invalid_data)?;
            consumed = consumed.saturating_add((self.encoder.total_in() - before) as usize);

            // The flush is complete once all input is taken and the encoder
            // left spare output room.
            if consumed >= buf.len() && self.pending.len() < self.pending.capacity() {
                return Ok(());
            }
        }
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for CompStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if buf.remaining() == 0 {
            return Poll::Ready(Ok(()));
        }

        loop {
            let input = this
                .input
                .get(this.input_start..this.input_end)
                .unwrap_or_default();
            let in_before = this.decoder.total_in();
            let out_before = this.decoder.total_out();
            let status = this
                .decoder
                .decompress(input, buf.initialize_unfilled(), FlushDecompress::None)
                .map_err(invalid_data)?;
            let consumed = (this.decoder.total_in() - in_before) as usize;
            let produced = (this.decoder.total_out() - out_before) as usize;
            this.input_start = this.input_start.saturating_add(consumed);
            buf.advance(produced);

            if produced > 0 || status == Status::StreamEnd {
                return Poll::Ready(Ok(()));
            }
            if this.eof {
                return Poll::Ready(Ok(()));
            }
            if consumed > 0 && this.input_start < this.input_end {
                continue;
            }

            // Need more compressed input.
            if this.input_start > 0 {
                this.input.copy_within(this.input_start..this.input_end, 0);
                this.input_end -= this.input_start;
                this.input_start = 0;
            }
            let Some(spare) = this.input.get_mut(this.input_end..).filter(|s| !s.is_empty()) else {
                return Poll::Ready(Err(invalid_data("compressed block exceeds read buffer")));
            };
            let mut read_buf = ReadBuf::new(spare);
            ready!(Pin::new(&mut this.inner).poll_read(cx, &mut read_buf))?;
            let n = read_buf.filled().len();
            if n == 0 {
                this.eof = true;
            } else {
                this.input_end = this.input_end.saturating_add(n);
            }
        }
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for CompStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        ready!(this.poll_drain(cx))?;
        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }
        this.encode(buf)?;
        // Push what we can now; the rest goes out on the next write or flush.
        if let Poll::Ready(Err(e)) = this.poll_drain(cx) {
            return Poll::Ready(Err(e));
        }
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        ready!(this.poll_drain(cx))?;
        Pin::new(&mut this.inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        ready!(this.poll_drain(cx))?;
        Pin::new(&mut this.inner).poll_shutdown(cx)
    }
}
