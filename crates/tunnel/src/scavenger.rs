//! Background reclaimer of retired sessions.
//!
//! A retired session keeps serving its in-flight streams. The scavenger
//! closes it once those streams drain, or once it has been retired for
//! longer than the TTL.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};
use transport::Session;

use crate::stats::STATS;

/// Pending retirements the queue holds before `retire` defers to a task.
pub const QUEUE_DEPTH: usize = 128;

const TICK: Duration = Duration::from_secs(1);

/// Map the `scavengettl` setting in seconds; negative disables forced close.
pub fn ttl_from_secs(secs: i64) -> Option<Duration> {
    u64::try_from(secs).ok().map(Duration::from_secs)
}

struct Retired<S> {
    session: Arc<S>,
    retired_at: Instant,
}

/// Sending side of the retirement queue.
pub struct ScavengerHandle<S> {
    tx: mpsc::Sender<Retired<S>>,
}

impl<S> Clone for ScavengerHandle<S> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

impl<S: Session> ScavengerHandle<S> {
    /// Hand a session over for closing. Never blocks.
    pub fn retire(&self, session: Arc<S>) {
        STATS.session_retired();
        let record = Retired {
            session,
            retired_at: Instant::now(),
        };
        match self.tx.try_send(record) {
            Ok(()) => {}
            Err(TrySendError::Full(record)) => {
                warn!("retire queue full, deferring");
                let tx = self.tx.clone();
                tokio::spawn(async move {
                    if let Err(mpsc::error::SendError(record)) = tx.send(record).await {
                        record.session.close();
                    }
                });
            }
            Err(TrySendError::Closed(record)) => record.session.close(),
        }
    }
}

/// Owns the retired sessions until they are closed.
pub struct Scavenger<S> {
    rx: mpsc::Receiver<Retired<S>>,
    pending: Vec<Retired<S>>,
    ttl: Option<Duration>,
}

impl<S: Session> Scavenger<S> {
    /// `ttl` of `None` means busy sessions are never force-closed.
    pub fn new(ttl: Option<Duration>) -> (Self, ScavengerHandle<S>) {
        let (tx, rx) = mpsc::channel(QUEUE_DEPTH);
        let scavenger = Self {
            rx,
            pending: Vec::new(),
            ttl,
        };
        (scavenger, ScavengerHandle { tx })
    }

    /// Run until every handle is dropped and nothing is pending.
    pub async fn run(mut self) {
        let mut ticker = interval(TICK);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut open = true;

        loop {
            tokio::select! {
                record = self.rx.recv(), if open => match record {
                    Some(record) => {
                        debug!(pending = self.pending.len() + 1, "session retired");
                        self.pending.push(record);
                    }
                    None => open = false,
                },
                _ = ticker.tick() => {
                    self.sweep(Instant::now());
                    if !open && self.pending.is_empty() {
                        break;
                    }
                }
            }
        }
        debug!("scavenger stopped");
    }

    /// Close every record that has drained or outlived the TTL, preserving
    /// the order of the rest.
    fn sweep(&mut self, now: Instant) {
        let ttl = self.ttl;
        self.pending.retain(|record| {
            let session = &record.session;
            if session.stream_count() == 0 || session.is_closed() {
                session.close();
                STATS.session_drained();
                info!("session normally closed");
                return false;
            }
            let age = now.saturating_duration_since(record.retired_at);
            if ttl.is_some_and(|ttl| age >= ttl) {
                session.close();
                STATS.session_forced();
                info!(streams = session.stream_count(), age_secs = age.as_secs(), "session reached scavenge ttl");
                return false;
            }
            true
        });
    }

    /// Pop the next queued retirement without running the task.
    #[cfg(test)]
    pub(crate) fn try_next(&mut self) -> Option<Arc<S>> {
        self.rx.try_recv().ok().map(|record| record.session)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockSession;
    use tokio::time::sleep;

    fn busy(id: usize) -> Arc<MockSession> {
        let session = MockSession::new(id);
        session.set_streams(1);
        Arc::new(session)
    }

    #[tokio::test(start_paused = true)]
    async fn drained_session_closes_within_a_tick() {
        for ttl in [None, Some(Duration::ZERO), Some(Duration::from_secs(600))] {
            let (scavenger, handle) = Scavenger::new(ttl);
            tokio::spawn(scavenger.run());

            let session = Arc::new(MockSession::new(1));
            handle.retire(Arc::clone(&session));
            sleep(Duration::from_millis(1100)).await;
            assert!(session.is_closed(), "ttl {ttl:?}");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn busy_session_is_forced_at_ttl() {
        let (scavenger, handle) = Scavenger::new(Some(Duration::from_secs(5)));
        tokio::spawn(scavenger.run());

        let session = busy(1);
        handle.retire(Arc::clone(&session));
        sleep(Duration::from_secs(4)).await;
        assert!(!session.is_closed());
        sleep(Duration::from_secs(2)).await;
        assert!(session.is_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn zero_ttl_closes_busy_session_on_first_tick() {
        let (scavenger, handle) = Scavenger::new(Some(Duration::ZERO));
        tokio::spawn(scavenger.run());

        let session = busy(1);
        handle.retire(Arc::clone(&session));
        sleep(Duration::from_millis(1100)).await;
        assert!(session.is_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn negative_ttl_waits_for_drain() {
        let (scavenger, handle) = Scavenger::new(ttl_from_secs(-1));
        tokio::spawn(scavenger.run());

        let session = busy(1);
        handle.retire(Arc::clone(&session));
        sleep(Duration::from_secs(3600)).await;
        assert!(!session.is_closed());

        session.set_streams(0);
        sleep(Duration::from_millis(1100)).await;
        assert!(session.is_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn closed_busy_session_is_dropped_within_a_tick() {
        for ttl in [None, Some(Duration::from_secs(3600))] {
            let (scavenger, handle) = Scavenger::new(ttl);
            tokio::spawn(scavenger.run());

            let session = busy(1);
            session.close();
            handle.retire(Arc::clone(&session));
            sleep(Duration::from_millis(1100)).await;
            // Only our reference is left once the record is gone.
            assert_eq!(Arc::strong_count(&session), 1, "ttl {ttl:?}");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn stops_after_handles_drop_and_queue_drains() {
        let (scavenger, handle) = Scavenger::new(None);
        let task = tokio::spawn(scavenger.run());

        let session = busy(1);
        handle.retire(Arc::clone(&session));
        drop(handle);

        sleep(Duration::from_secs(10)).await;
        assert!(!task.is_finished());

        session.set_streams(0);
        task.await.unwrap();
        assert!(session.is_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn full_queue_defers_without_losing_sessions() {
        let (scavenger, handle) = Scavenger::new(Some(Duration::from_secs(600)));
        let sessions: Vec<_> = (0..QUEUE_DEPTH + 3).map(|i| Arc::new(MockSession::new(i))).collect();
        for session in &sessions {
            handle.retire(Arc::clone(session));
        }

        tokio::spawn(scavenger.run());
        sleep(Duration::from_secs(3)).await;
        assert!(sessions.iter().all(|s| s.is_closed()));
    }

    #[test]
    fn ttl_mapping() {
        assert_eq!(ttl_from_secs(-1), None);
        assert_eq!(ttl_from_secs(0), Some(Duration::ZERO));
        assert_eq!(ttl_from_secs(600), Some(Duration::from_secs(600)));
    }
}
