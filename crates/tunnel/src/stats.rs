//! Process-wide counters and the periodic stats logger.

use std::fmt::Write as _;
use std::fs::OpenOptions;
use std::io::Write as _;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::{interval, MissedTickBehavior};
use tracing::{info, warn};

/// Global counters, updated by the pool, scavenger, server and relays.
pub static STATS: Stats = Stats::new();

#[derive(Debug)]
pub struct Stats {
    sessions_opened: AtomicU64,
    sessions_retired: AtomicU64,
    sessions_drained: AtomicU64,
    sessions_forced: AtomicU64,
    dial_failures: AtomicU64,
    streams_opened: AtomicU64,
    streams_closed: AtomicU64,
    target_dial_failures: AtomicU64,
    bytes_relayed: AtomicU64,
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

impl Stats {
    const fn new() -> Self {
        Self {
            sessions_opened: AtomicU64::new(0),
            sessions_retired: AtomicU64::new(0),
            sessions_drained: AtomicU64::new(0),
            sessions_forced: AtomicU64::new(0),
            dial_failures: AtomicU64::new(0),
            streams_opened: AtomicU64::new(0),
            streams_closed: AtomicU64::new(0),
            target_dial_failures: AtomicU64::new(0),
            bytes_relayed: AtomicU64::new(0),
        }
    }

    pub fn session_opened(&self) {
        bump(&self.sessions_opened);
    }

    pub fn session_retired(&self) {
        bump(&self.sessions_retired);
    }

    pub fn session_drained(&self) {
        bump(&self.sessions_drained);
    }

    pub fn session_forced(&self) {
        bump(&self.sessions_forced);
    }

    pub fn dial_failed(&self) {
        bump(&self.dial_failures);
    }

    pub fn stream_opened(&self) {
        bump(&self.streams_opened);
    }

    pub fn stream_closed(&self) {
        bump(&self.streams_closed);
    }

    pub fn target_dial_failed(&self) {
        bump(&self.target_dial_failures);
    }

    pub fn add_bytes(&self, n: u64) {
        self.bytes_relayed.fetch_add(n, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> Snapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        Snapshot {
            sessions_opened: load(&self.sessions_opened),
            sessions_retired: load(&self.sessions_retired),
            sessions_drained: load(&self.sessions_drained),
            sessions_forced: load(&self.sessions_forced),
            dial_failures: load(&self.dial_failures),
            streams_opened: load(&self.streams_opened),
            streams_closed: load(&self.streams_closed),
            target_dial_failures: load(&self.target_dial_failures),
            bytes_relayed: load(&self.bytes_relayed),
        }
    }
}

/// Point-in-time copy of [`Stats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub sessions_opened: u64,
    pub sessions_retired: u64,
    pub sessions_drained: u64,
    pub sessions_forced: u64,
    pub dial_failures: u64,
    pub streams_opened: u64,
    pub streams_closed: u64,
    pub target_dial_failures: u64,
    pub bytes_relayed: u64,
}

const CSV_HEADER: &str = "unix,sessions_opened,sessions_retired,sessions_drained,sessions_forced,\
dial_failures,streams_opened,streams_closed,target_dial_failures,bytes_relayed";

impl Snapshot {
    fn csv_row(&self, unix: i64) -> String {
        format!(
            "{unix},{},{},{},{},{},{},{},{},{}",
            self.sessions_opened,
            self.sessions_retired,
            self.sessions_drained,
            self.sessions_forced,
            self.dial_failures,
            self.streams_opened,
            self.streams_closed,
            self.target_dial_failures,
            self.bytes_relayed,
        )
    }
}

// ---------------------------------------------------------------------------
// Periodic logger
// ---------------------------------------------------------------------------

/// Log a snapshot every `period`, appending it to the file named by the
/// strftime `pattern` when one is given. Runs forever; a zero period
/// disables it.
pub async fn run_logger(pattern: Option<String>, period: Duration) {
    if period.is_zero() {
        return;
    }
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately.
    ticker.tick().await;

    loop {
        ticker.tick().await;
        let snapshot = STATS.snapshot();
        info!(
            sessions_opened = snapshot.sessions_opened,
            sessions_retired = snapshot.sessions_retired,
            streams_opened = snapshot.streams_opened,
            streams_closed = snapshot.streams_closed,
            bytes_relayed = snapshot.bytes_relayed,
            "stats"
        );
        if let Some(pattern) = pattern.as_deref() {
            if let Err(e) = append_row(pattern, &snapshot) {
                warn!(pattern, %e, "failed to write stats file");
            }
        }
    }
}

/// Append one CSV row to the file named by `pattern` at the current local
/// time, writing the header first if the file is new.
fn append_row(pattern: &str, snapshot: &Snapshot) -> std::io::Result<()> {
    let now = chrono::Local::now();
    let mut path = String::new();
    write!(path, "{}", now.format(pattern)).map_err(|_| {
        std::io::Error::new(std::io::ErrorKind::InvalidInput, "invalid strftime pattern")
    })?;

    let mut file = OpenOptions::new().create(true).append(true).open(&path)?;
    if file.metadata()?.len() == 0 {
        writeln!(file, "{CSV_HEADER}")?;
    }
    writeln!(file, "{}", snapshot.csv_row(now.timestamp()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_feed_snapshots() {
        let before = STATS.snapshot();
        STATS.session_opened();
        STATS.stream_opened();
        STATS.add_bytes(42);
        let after = STATS.snapshot();

        assert!(after.sessions_opened > before.sessions_opened);
        assert!(after.streams_opened > before.streams_opened);
        assert!(after.bytes_relayed >= before.bytes_relayed + 42);
    }

    #[test]
    fn rows_append_under_one_header() {
        let dir = tempfile::tempdir().unwrap();
        let pattern = format!("{}/snmp-%Y%m%d.log", dir.path().display());
        let snapshot = STATS.snapshot();

        append_row(&pattern, &snapshot).unwrap();
        append_row(&pattern, &snapshot).unwrap();

        let file = std::fs::read_dir(dir.path()).unwrap().next().unwrap().unwrap();
        let name = file.file_name().into_string().unwrap();
        assert!(name.starts_with("snmp-") && !name.contains('%'), "file {name}");

        let contents = std::fs::read_to_string(file.path()).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0], CSV_HEADER);
        assert_eq!(lines[1].split(',').count(), CSV_HEADER.split(',').count());
    }

    #[test]
    fn invalid_pattern_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let pattern = format!("{}/snmp-%Q.log", dir.path().display());
        assert!(append_row(&pattern, &STATS.snapshot()).is_err());
    }

    #[test]
    fn snapshot_serializes_as_json() {
        let json = serde_json::to_value(STATS.snapshot()).unwrap();
        assert!(json.get("streams_opened").is_some());
        assert!(json.get("bytes_relayed").is_some());
    }
}
