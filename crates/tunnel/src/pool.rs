//! Client session pool.
//!
//! A fixed number of slots, each holding one current session. Local
//! connections are spread over the slots round robin. A slot's session is
//! replaced only when the slot is about to be used and its session is closed
//! or past its auto-expire deadline; the old session goes to the scavenger
//! so in-flight streams can finish.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{Mutex, MutexGuard};
use tokio::time::Instant;
use tracing::{info, warn, Instrument};
use transport::{Dialer, Session};

use crate::reconnect::{Backoff, Reconnector};
use crate::relay;
use crate::scavenger::ScavengerHandle;

#[derive(Debug, Clone, Copy)]
pub struct PoolOptions {
    pub num_conn: usize,
    /// Replace a session once it is this old; `None` disables expiry.
    pub auto_expire: Option<Duration>,
    pub quiet: bool,
}

impl PoolOptions {
    /// Map the `autoexpire` setting in seconds; zero or negative disables it.
    pub fn auto_expire_from_secs(secs: i64) -> Option<Duration> {
        u64::try_from(secs)
            .ok()
            .filter(|&s| s > 0)
            .map(Duration::from_secs)
    }
}

struct Slot<S> {
    session: Arc<S>,
    expires_at: Instant,
}

pub struct Pool<D: Dialer> {
    slots: Vec<Mutex<Slot<D::Session>>>,
    counter: AtomicUsize,
    reconnector: Reconnector<D>,
    scavenger: ScavengerHandle<D::Session>,
    options: PoolOptions,
}

impl<D: Dialer> Pool<D> {
    /// Establish `num_conn` sessions, retrying each until it succeeds.
    pub async fn new(
        dialer: D,
        backoff: Backoff,
        scavenger: ScavengerHandle<D::Session>,
        options: PoolOptions,
    ) -> Self {
        let reconnector = Reconnector::new(dialer, backoff);
        let num_conn = options.num_conn.max(1);
        let mut slots = Vec::with_capacity(num_conn);
        for slot in 0..num_conn {
            let session = reconnector.wait_conn().await;
            info!(slot, "session ready");
            slots.push(Mutex::new(Slot {
                session: Arc::new(session),
                expires_at: expiry(options.auto_expire),
            }));
        }
        Self {
            slots,
            counter: AtomicUsize::new(0),
            reconnector,
            scavenger,
            options,
        }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Index of the slot the next connection goes to.
    pub fn next_slot(&self) -> usize {
        self.counter.fetch_add(1, Ordering::Relaxed) % self.slots.len()
    }

    /// Send `local` through the next slot.
    pub async fn assign<L>(&self, local: L)
    where
        L: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        self.dispatch(self.next_slot(), local).await;
    }

    /// Open a stream on slot `index` and start relaying `local` over it.
    ///
    /// If the stream cannot be opened the local connection is dropped.
    pub async fn dispatch<L>(&self, index: usize, local: L)
    where
        L: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let Some(slot) = self.checkout(index).await else {
            warn!(slot = index, "no such slot");
            return;
        };
        // The slot stays locked until the stream exists, so a concurrent
        // dispatch cannot retire the session while it still looks drained.
        let opened = slot.session.open_stream().await;
        drop(slot);
        match opened {
            Ok(stream) => {
                let quiet = self.options.quiet;
                tokio::spawn(relay::bridge(local, stream, quiet).in_current_span());
            }
            Err(e) => warn!(slot = index, %e, "failed to open stream, dropping connection"),
        }
    }

    /// Lock slot `index`, replacing its session first if it is closed or
    /// expired.
    async fn checkout(&self, index: usize) -> Option<MutexGuard<'_, Slot<D::Session>>> {
        let mut slot = self.slots.get(index)?.lock().await;
        let closed = slot.session.is_closed();
        let expired = self.options.auto_expire.is_some() && Instant::now() >= slot.expires_at;
        if closed || expired {
            info!(slot = index, closed, expired, "replacing session");
            self.scavenger.retire(Arc::clone(&slot.session));
            slot.session = Arc::new(self.reconnector.wait_conn().await);
            slot.expires_at = expiry(self.options.auto_expire);
        }
        Some(slot)
    }

    /// The session currently in slot `index`.
    #[cfg(test)]
    async fn current(&self, index: usize) -> Arc<D::Session> {
        Arc::clone(&self.slots[index].lock().await.session)
    }
}

fn expiry(auto_expire: Option<Duration>) -> Instant {
    Instant::now() + auto_expire.unwrap_or(Duration::ZERO)
}
