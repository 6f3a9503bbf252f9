//! Server accept loop: sessions in, target connections out.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, info, info_span, warn, Instrument};
use transport::{Incoming, Listener, Session, TransportError};

use crate::error::Result;
use crate::relay;
use crate::stats::STATS;

/// Time allowed for connecting to the target service.
pub const TARGET_DIAL_TIMEOUT: Duration = Duration::from_secs(5);

pub struct Server<L> {
    listener: L,
    target: Arc<str>,
    quiet: bool,
    dial_timeout: Duration,
}

impl<L: Listener> Server<L> {
    pub fn new(listener: L, target: &str, quiet: bool) -> Self {
        Self {
            listener,
            target: Arc::from(target),
            quiet,
            dial_timeout: TARGET_DIAL_TIMEOUT,
        }
    }

    pub fn with_dial_timeout(mut self, dial_timeout: Duration) -> Self {
        self.dial_timeout = dial_timeout;
        self
    }

    /// Accept sessions until the listener closes.
    ///
    /// Transient accept errors are logged and the loop continues.
    pub async fn run(mut self) -> Result<()> {
        loop {
            let incoming = match self.listener.accept().await {
                Ok(incoming) => incoming,
                Err(TransportError::Closed) => return Err(TransportError::Closed.into()),
                Err(e) => {
                    warn!(%e, "accept failed");
                    continue;
                }
            };

            let remote = incoming.remote_addr();
            let target = Arc::clone(&self.target);
            let quiet = self.quiet;
            let dial_timeout = self.dial_timeout;
            tokio::spawn(
                async move {
                    let session = match incoming.establish().await {
                        Ok(session) => session,
                        Err(e) => {
                            warn!(%e, "session handshake failed");
                            return;
                        }
                    };
                    info!("session established");
                    STATS.session_opened();
                    serve_session(&session, target, quiet, dial_timeout).await;
                    session.close();
                }
                .instrument(info_span!("session", %remote)),
            );
        }
    }
}

/// Bridge every stream the peer opens on `session` to `target`, until the
/// session ends.
pub async fn serve_session<S: Session>(
    session: &S,
    target: Arc<str>,
    quiet: bool,
    dial_timeout: Duration,
) {
    loop {
        let stream = match session.accept_stream().await {
            Ok(stream) => stream,
            Err(e) => {
                info!(%e, "session ended");
                return;
            }
        };
        let target = Arc::clone(&target);
        tokio::spawn(
            async move {
                let mut stream = stream;
                match timeout(dial_timeout, TcpStream::connect(&*target)).await {
                    Ok(Ok(conn)) => {
                        if let Err(e) = conn.set_nodelay(true) {
                            debug!(%e, "failed to set TCP_NODELAY");
                        }
                        relay::bridge(stream, conn, quiet).await;
                    }
                    Ok(Err(e)) => {
                        STATS.target_dial_failed();
                        warn!(addr = %target, %e, "failed to connect to target");
                        let _ = stream.shutdown().await;
                    }
                    Err(_) => {
                        STATS.target_dial_failed();
                        warn!(addr = %target, ?dial_timeout, "timed out connecting to target");
                        let _ = stream.shutdown().await;
                    }
                }
            }
            .in_current_span(),
        );
    }
}
