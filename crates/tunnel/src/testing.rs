//! In-memory sessions for exercising the engine without a network.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{duplex, DuplexStream};
use tokio::sync::mpsc;
use transport::{Dialer, Incoming, Listener, Result, Session, TransportError};

const STREAM_BUF: usize = 64 * 1024;

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

struct SessionState {
    id: usize,
    closed: AtomicBool,
    busy_streams: AtomicUsize,
    opened: AtomicUsize,
    fail_open: AtomicBool,
    open_delay_ms: AtomicU64,
    /// Far ends of opened streams, kept alive for inspection.
    peers: Mutex<Vec<DuplexStream>>,
    incoming: tokio::sync::Mutex<mpsc::UnboundedReceiver<DuplexStream>>,
}

/// Shared handle to a fake session; clones observe the same state.
#[derive(Clone)]
pub struct MockSession(Arc<SessionState>);

impl MockSession {
    pub fn new(id: usize) -> Self {
        Self::with_incoming(id).0
    }

    /// A session plus the sender that feeds its `accept_stream`.
    pub fn with_incoming(id: usize) -> (Self, mpsc::UnboundedSender<DuplexStream>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let state = SessionState {
            id,
            closed: AtomicBool::new(false),
            busy_streams: AtomicUsize::new(0),
            opened: AtomicUsize::new(0),
            fail_open: AtomicBool::new(false),
            open_delay_ms: AtomicU64::new(0),
            peers: Mutex::new(Vec::new()),
            incoming: tokio::sync::Mutex::new(rx),
        };
        (Self(Arc::new(state)), tx)
    }

    pub fn id(&self) -> usize {
        self.0.id
    }

    /// Pretend `n` streams are alive.
    pub fn set_streams(&self, n: usize) {
        self.0.busy_streams.store(n, Ordering::SeqCst);
    }

    /// Number of successful `open_stream` calls.
    pub fn opened(&self) -> usize {
        self.0.opened.load(Ordering::SeqCst)
    }

    pub fn fail_opens(&self) {
        self.0.fail_open.store(true, Ordering::SeqCst);
    }

    /// Make every `open_stream` take `delay` before it completes.
    pub fn set_open_delay(&self, delay: Duration) {
        let ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
        self.0.open_delay_ms.store(ms, Ordering::SeqCst);
    }

    /// Take the far end of the most recently opened stream.
    pub fn take_peer(&self) -> Option<DuplexStream> {
        self.0.peers.lock().ok()?.pop()
    }
}

#[async_trait]
impl Session for MockSession {
    type Stream = DuplexStream;

    async fn open_stream(&self) -> Result<DuplexStream> {
        let delay = self.0.open_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        if self.0.fail_open.load(Ordering::SeqCst) {
            return Err(TransportError::Stream("refused".into()));
        }
        let (ours, theirs) = duplex(STREAM_BUF);
        if let Ok(mut peers) = self.0.peers.lock() {
            peers.push(theirs);
        }
        self.0.opened.fetch_add(1, Ordering::SeqCst);
        Ok(ours)
    }

    async fn accept_stream(&self) -> Result<DuplexStream> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        self.0
            .incoming
            .lock()
            .await
            .recv()
            .await
            .ok_or(TransportError::Closed)
    }

    fn stream_count(&self) -> usize {
        self.0.busy_streams.load(Ordering::SeqCst)
    }

    fn is_closed(&self) -> bool {
        self.0.closed.load(Ordering::SeqCst)
    }

    fn close(&self) {
        self.0.closed.store(true, Ordering::SeqCst);
    }
}

// ---------------------------------------------------------------------------
// Dialer
// ---------------------------------------------------------------------------

struct DialerState {
    failures_left: AtomicUsize,
    attempts: AtomicUsize,
    dialed: Mutex<Vec<MockSession>>,
}

/// Dialer handing out fresh [`MockSession`]s with increasing ids.
#[derive(Clone)]
pub struct MockDialer(Arc<DialerState>);

impl MockDialer {
    pub fn new() -> Self {
        Self::failing(0)
    }

    /// Fail the first `n` dials.
    pub fn failing(n: usize) -> Self {
        Self(Arc::new(DialerState {
            failures_left: AtomicUsize::new(n),
            attempts: AtomicUsize::new(0),
            dialed: Mutex::new(Vec::new()),
        }))
    }

    pub fn fail_next(&self, n: usize) {
        self.0.failures_left.store(n, Ordering::SeqCst);
    }

    pub fn attempts(&self) -> usize {
        self.0.attempts.load(Ordering::SeqCst)
    }

    /// Every session dialed so far, oldest first.
    pub fn dialed(&self) -> Vec<MockSession> {
        self.0.dialed.lock().map(|d| d.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl Dialer for MockDialer {
    type Session = MockSession;

    async fn dial(&self) -> Result<MockSession> {
        self.0.attempts.fetch_add(1, Ordering::SeqCst);
        let failed = self
            .0
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failed {
            return Err(TransportError::Timeout);
        }
        let mut dialed = self
            .0
            .dialed
            .lock()
            .map_err(|_| TransportError::Stream("poisoned".into()))?;
        let session = MockSession::new(dialed.len());
        dialed.push(session.clone());
        Ok(session)
    }
}

// ---------------------------------------------------------------------------
// Listener
// ---------------------------------------------------------------------------

pub enum MockAccept {
    Session(MockSession),
    HandshakeFailure,
    AcceptError,
}

/// Listener yielding whatever the test feeds it; closed once the sender is
/// dropped.
pub struct MockListener(mpsc::UnboundedReceiver<MockAccept>);

impl MockListener {
    pub fn new() -> (Self, mpsc::UnboundedSender<MockAccept>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self(rx), tx)
    }
}

pub struct MockIncoming(Option<MockSession>);

#[async_trait]
impl Listener for MockListener {
    type Incoming = MockIncoming;

    async fn accept(&mut self) -> Result<MockIncoming> {
        match self.0.recv().await {
            Some(MockAccept::Session(session)) => Ok(MockIncoming(Some(session))),
            Some(MockAccept::HandshakeFailure) => Ok(MockIncoming(None)),
            Some(MockAccept::AcceptError) => Err(TransportError::Timeout),
            None => Err(TransportError::Closed),
        }
    }
}

#[async_trait]
impl Incoming for MockIncoming {
    type Session = MockSession;

    fn remote_addr(&self) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], 40000))
    }

    async fn establish(self) -> Result<MockSession> {
        self.0
            .ok_or_else(|| TransportError::Handshake("bad key".into()))
    }
}
