//! Secure, multiplexed sessions for quictun.
//!
//! This crate defines the session traits the tunnel engine is written
//! against and provides the QUIC implementation:
//!
//! - [`Session`]: an established multiplexed channel that opens and accepts
//!   byte streams.
//! - [`Dialer`]: the client-side session factory.
//! - [`Listener`] / [`Incoming`]: the server side; `accept()` yields a
//!   pending connection whose handshake completes in `establish()`.
//!
//! The QUIC binding ([`QuicDialer`], [`QuicListener`]) authenticates both
//! peers with a key derived from a pre-shared secret, tunes the connection
//! from KCP-style knobs and optionally deflates every stream.

pub mod comp;
pub mod error;
pub mod quic;
pub mod quic_config;
pub mod socket;
pub mod tuning;

pub use error::{Result, TransportError};
pub use quic::{QuicDialer, QuicIncoming, QuicListener, QuicSession, QuicStream};
pub use tuning::Tuning;

use async_trait::async_trait;
use std::net::SocketAddr;
use tokio::io::{AsyncRead, AsyncWrite};

// ---------------------------------------------------------------------------
// Traits
// ---------------------------------------------------------------------------

/// An established multiplexed session.
///
/// Once `is_closed()` returns `true` it never returns `false` again.
#[async_trait]
pub trait Session: Send + Sync + 'static {
    type Stream: AsyncRead + AsyncWrite + Unpin + Send + 'static;

    /// Open a new outbound stream.
    async fn open_stream(&self) -> Result<Self::Stream>;

    /// Wait for the peer to open a stream.
    async fn accept_stream(&self) -> Result<Self::Stream>;

    /// Number of streams opened or accepted on this session that are still alive.
    fn stream_count(&self) -> usize;

    fn is_closed(&self) -> bool;

    /// Close the session and every stream on it.
    fn close(&self);
}

/// Client-side session factory.
#[async_trait]
pub trait Dialer: Send + Sync + 'static {
    type Session: Session;

    /// Connect to the remote end and complete the handshake.
    async fn dial(&self) -> Result<Self::Session>;
}

/// Server-side source of incoming connections.
#[async_trait]
pub trait Listener: Send + 'static {
    type Incoming: Incoming;

    /// Wait for the next connection attempt.
    ///
    /// Returns [`TransportError::Closed`] once the listener can never yield
    /// another connection.
    async fn accept(&mut self) -> Result<Self::Incoming>;
}

/// A connection attempt whose handshake has not completed yet.
#[async_trait]
pub trait Incoming: Send + 'static {
    type Session: Session;

    fn remote_addr(&self) -> SocketAddr;

    /// Complete the handshake.
    async fn establish(self) -> Result<Self::Session>;
}

// ---------------------------------------------------------------------------
// Options
// ---------------------------------------------------------------------------

/// Everything needed to build a QUIC dialer or listener.
#[derive(Debug, Clone)]
pub struct TransportOptions {
    /// Remote address for a dialer, bind address for a listener.
    pub addr: SocketAddr,
    /// Pre-shared secret both peers derive their identity from.
    pub key: String,
    pub tuning: Tuning,
    /// Wrap every stream in a deflate codec.
    pub compression: bool,
    /// `SO_RCVBUF` / `SO_SNDBUF` in bytes.
    pub sockbuf: usize,
    /// DSCP code point for outgoing packets.
    pub dscp: u8,
}
