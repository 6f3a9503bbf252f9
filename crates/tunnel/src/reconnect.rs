//! Session establishment with retry.

use std::time::Duration;

use common::BackoffKind;
use tokio::time::sleep;
use tracing::{debug, warn};
use transport::Dialer;

use crate::stats::STATS;

const BASE_DELAY: Duration = Duration::from_secs(1);

/// Delay policy between failed dial attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
    Fixed(Duration),
    /// Doubles from `initial` after every failure, capped at `max`.
    Exponential { initial: Duration, max: Duration },
}

impl Default for Backoff {
    fn default() -> Self {
        Self::Fixed(BASE_DELAY)
    }
}

impl Backoff {
    pub fn from_config(kind: BackoffKind, max_secs: u64) -> Self {
        match kind {
            BackoffKind::Fixed => Self::default(),
            BackoffKind::Exponential => Self::Exponential {
                initial: BASE_DELAY,
                max: Duration::from_secs(max_secs).max(BASE_DELAY),
            },
        }
    }

    /// Delay after the `attempt`-th consecutive failure (0-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        match *self {
            Self::Fixed(delay) => delay,
            Self::Exponential { initial, max } => {
                let factor = 1_u32.checked_shl(attempt).unwrap_or(u32::MAX);
                initial.saturating_mul(factor).min(max)
            }
        }
    }
}

/// Where a `wait_conn` call currently stands.
#[derive(Debug)]
pub enum ConnState<S> {
    /// The last dial failed; waiting out the backoff.
    Disconnected { attempt: u32 },
    Connecting { attempt: u32 },
    Connected(S),
}

/// Dials until a session is established.
pub struct Reconnector<D> {
    dialer: D,
    backoff: Backoff,
}

impl<D: Dialer> Reconnector<D> {
    pub fn new(dialer: D, backoff: Backoff) -> Self {
        Self { dialer, backoff }
    }

    /// Block until a session is established. Never fails; dial errors are
    /// logged and retried after the backoff delay.
    pub async fn wait_conn(&self) -> D::Session {
        let mut state = ConnState::Connecting { attempt: 0 };
        loop {
            state = match state {
                ConnState::Connecting { attempt } => match self.dialer.dial().await {
                    Ok(session) => ConnState::Connected(session),
                    Err(e) => {
                        STATS.dial_failed();
                        warn!(attempt, %e, "re-connecting");
                        ConnState::Disconnected { attempt }
                    }
                },
                ConnState::Disconnected { attempt } => {
                    sleep(self.backoff.delay(attempt)).await;
                    ConnState::Connecting {
                        attempt: attempt.saturating_add(1),
                    }
                }
                ConnState::Connected(session) => {
                    STATS.session_opened();
                    debug!("session connected");
                    return session;
                }
            };
        }
    }
}
