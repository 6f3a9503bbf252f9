//! QUIC sessions over quinn.
//!
//! One `quinn::Connection` is one [`Session`]; each bidirectional stream is
//! one tunnel stream. The client binds a fresh UDP socket per dial so every
//! session has its own 4-tuple; the server shares one socket across all
//! sessions.

use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tracing::{debug, info, warn};

use crate::comp::CompStream;
use crate::error::{Result, TransportError};
use crate::quic_config::{build_client_config, build_server_config, Identity, SERVER_NAME};
use crate::socket::{bind_udp, endpoint, unspecified_for};
use crate::{Dialer, Incoming, Listener, Session, TransportOptions};

/// First byte on every stream; the peer does not see a QUIC stream until
/// data arrives on it.
const OPEN_MARKER: u8 = 0x01;

/// Application error code for a stream refused over a bad open marker.
const BAD_MARKER_CODE: quinn::VarInt = quinn::VarInt::from_u32(1);

// ---------------------------------------------------------------------------
// Dialer
// ---------------------------------------------------------------------------

/// Client-side session factory.
pub struct QuicDialer {
    remote: SocketAddr,
    client_config: quinn::ClientConfig,
    sockbuf: usize,
    dscp: u8,
    compression: bool,
}

impl QuicDialer {
    /// Derive the client identity and build the connection config.
    pub fn new(options: &TransportOptions) -> Result<Self> {
        let identity = Identity::derive(&options.key)?;
        Ok(Self {
            remote: options.addr,
            client_config: build_client_config(&identity, &options.tuning)?,
            sockbuf: options.sockbuf,
            dscp: options.dscp,
            compression: options.compression,
        })
    }

    pub fn remote(&self) -> SocketAddr {
        self.remote
    }
}

#[async_trait]
impl Dialer for QuicDialer {
    type Session = QuicSession;

    async fn dial(&self) -> Result<QuicSession> {
        let socket = bind_udp(unspecified_for(self.remote), self.sockbuf, self.dscp)?;
        let endpoint = endpoint(socket, None)?;
        let connection = endpoint
            .connect_with(self.client_config.clone(), self.remote, SERVER_NAME)?
            .await?;
        debug!(remote = %self.remote, local = ?endpoint.local_addr().ok(), "session established");
        Ok(QuicSession::new(connection, Some(endpoint), self.compression))
    }
}

// ---------------------------------------------------------------------------
// Listener
// ---------------------------------------------------------------------------

/// Server-side endpoint accepting sessions on one UDP socket.
pub struct QuicListener {
    endpoint: quinn::Endpoint,
    compression: bool,
}

impl QuicListener {
    /// Derive the server identity and bind the UDP socket.
    pub fn bind(options: &TransportOptions) -> Result<Self> {
        let identity = Identity::derive(&options.key)?;
        let server_config = build_server_config(&identity, &options.tuning)?;
        let socket = bind_udp(options.addr, options.sockbuf, options.dscp)?;
        let endpoint = endpoint(socket, Some(server_config))?;
        info!(addr = ?endpoint.local_addr().ok(), "listening on UDP");
        Ok(Self {
            endpoint,
            compression: options.compression,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.endpoint.local_addr()?)
    }
}

#[async_trait]
impl Listener for QuicListener {
    type Incoming = QuicIncoming;

    async fn accept(&mut self) -> Result<QuicIncoming> {
        let incoming = self.endpoint.accept().await.ok_or(TransportError::Closed)?;
        Ok(QuicIncoming {
            incoming,
            compression: self.compression,
        })
    }
}

/// A client whose handshake is still in flight.
pub struct QuicIncoming {
    incoming: quinn::Incoming,
    compression: bool,
}

#[async_trait]
impl Incoming for QuicIncoming {
    type Session = QuicSession;

    fn remote_addr(&self) -> SocketAddr {
        self.incoming.remote_address()
    }

    async fn establish(self) -> Result<QuicSession> {
        let connection = self.incoming.accept()?.await?;
        Ok(QuicSession::new(connection, None, self.compression))
    }
}

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

pub struct QuicSession {
    connection: quinn::Connection,
    streams: Arc<AtomicUsize>,
    compression: bool,
    /// Client sessions own their endpoint so the socket lives as long as
    /// the session.
    _endpoint: Option<quinn::Endpoint>,
}

impl QuicSession {
    fn new(connection: quinn::Connection, endpoint: Option<quinn::Endpoint>, compression: bool) -> Self {
        Self {
            connection,
            streams: Arc::new(AtomicUsize::new(0)),
            compression,
            _endpoint: endpoint,
        }
    }

    pub fn remote_address(&self) -> SocketAddr {
        self.connection.remote_address()
    }

    fn wrap(&self, send: quinn::SendStream, recv: quinn::RecvStream) -> QuicStream {
        let stream = BiStream { send, recv };
        let inner = if self.compression {
            StreamInner::Compressed(CompStream::new(stream))
        } else {
            StreamInner::Plain(stream)
        };
        QuicStream {
            inner,
            _guard: StreamGuard::new(Arc::clone(&self.streams)),
        }
    }
}

#[async_trait]
impl Session for QuicSession {
    type Stream = QuicStream;

    async fn open_stream(&self) -> Result<QuicStream> {
        let (mut send, recv) = self.connection.open_bi().await?;
        send.write_all(&[OPEN_MARKER])
            .await
            .map_err(|e| TransportError::Stream(format!("open marker: {e}")))?;
        Ok(self.wrap(send, recv))
    }

    async fn accept_stream(&self) -> Result<QuicStream> {
        loop {
            let (mut send, mut recv) = self.connection.accept_bi().await?;
            let mut marker = [0_u8; 1];
            match recv.read_exact(&mut marker).await {
                Ok(()) if marker == [OPEN_MARKER] => return Ok(self.wrap(send, recv)),
                Ok(()) => {
                    // Refuse this stream only; the session stays up.
                    warn!(marker = marker[0], "rejecting stream with unexpected open marker");
                    let _ = send.reset(BAD_MARKER_CODE);
                    let _ = recv.stop(BAD_MARKER_CODE);
                }
                Err(e) => {
                    if let Some(reason) = self.connection.close_reason() {
                        return Err(reason.into());
                    }
                    // The peer gave up on this stream before it started.
                    debug!(%e, "discarding stream without open marker");
                }
            }
        }
    }

    fn stream_count(&self) -> usize {
        self.streams.load(Ordering::Acquire)
    }

    fn is_closed(&self) -> bool {
        self.connection.close_reason().is_some()
    }

    fn close(&self) {
        self.connection.close(quinn::VarInt::from_u32(0), b"retired");
    }
}

/// Counts a stream as alive until it is dropped.
struct StreamGuard(Arc<AtomicUsize>);

impl StreamGuard {
    fn new(counter: Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::AcqRel);
        Self(counter)
    }
}

impl Drop for StreamGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

// ---------------------------------------------------------------------------
// Stream
// ---------------------------------------------------------------------------

/// Send and receive halves of one QUIC stream as a single duplex.
pub struct BiStream {
    send: quinn::SendStream,
    recv: quinn::RecvStream,
}

impl AsyncRead for BiStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        AsyncRead::poll_read(Pin::new(&mut self.recv), cx, buf)
    }
}

impl AsyncWrite for BiStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        AsyncWrite::poll_write(Pin::new(&mut self.send), cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        AsyncWrite::poll_flush(Pin::new(&mut self.send), cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        AsyncWrite::poll_shutdown(Pin::new(&mut self.send), cx)
    }
}

enum StreamInner {
    Plain(BiStream),
    Compressed(CompStream<BiStream>),
}

/// A tunnel stream on a [`QuicSession`].
pub struct QuicStream {
    inner: StreamInner,
    _guard: StreamGuard,
}

impl AsyncRead for QuicStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match &mut self.inner {
            StreamInner::Plain(s) => Pin::new(s).poll_read(cx, buf),
            StreamInner::Compressed(s) => Pin::new(s).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for QuicStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match &mut self.inner {
            StreamInner::Plain(s) => Pin::new(s).poll_write(cx, buf),
            StreamInner::Compressed(s) => Pin::new(s).poll_write(cx, buf),
        }
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match &mut self.inner {
            StreamInner::Plain(s) => Pin::new(s).poll_flush(cx),
            StreamInner::Compressed(s) => Pin::new(s).poll_flush(cx),
        }
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match &mut self.inner {
            StreamInner::Plain(s) => Pin::new(s).poll_shutdown(cx),
            StreamInner::Compressed(s) => Pin::new(s).poll_shutdown(cx),
        }
    }
}
