//! Command-line and JSON configuration.
//!
//! Both binaries parse their flags with clap, then optionally overlay a JSON
//! file given with `-c`. Keys present in the file replace the command-line
//! values one by one; absent keys keep whatever the command line said. The
//! selected [`Mode`] preset is applied last.

use std::path::{Path, PathBuf};

use clap::{Args, Parser, ValueEnum};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::{Error, Result};

// ---------------------------------------------------------------------------
// Mode presets
// ---------------------------------------------------------------------------

/// Retransmission tuning tuple: `(nodelay, interval, resend, nc)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NoDelay {
    pub nodelay: u32,
    pub interval: u64,
    pub resend: u32,
    pub nc: u32,
}

/// Named transport tuning profile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    Normal,
    Fast,
    Fast2,
    Fast3,
    /// Use the explicit `--nodelay/--interval/--resend/--nc` values.
    Manual,
}

impl Mode {
    /// The tuning tuple for this preset, or `None` for [`Mode::Manual`].
    pub const fn preset(self) -> Option<NoDelay> {
        let (nodelay, interval, resend, nc) = match self {
            Self::Normal => (0, 40, 2, 1),
            Self::Fast => (0, 30, 2, 1),
            Self::Fast2 => (1, 20, 2, 1),
            Self::Fast3 => (1, 10, 2, 1),
            Self::Manual => return None,
        };
        Some(NoDelay {
            nodelay,
            interval,
            resend,
            nc,
        })
    }
}

impl std::fmt::Display for Mode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Normal => write!(f, "normal"),
            Self::Fast => write!(f, "fast"),
            Self::Fast2 => write!(f, "fast2"),
            Self::Fast3 => write!(f, "fast3"),
            Self::Manual => write!(f, "manual"),
        }
    }
}

/// Delay policy between failed session establishment attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackoffKind {
    /// Wait one second between attempts.
    Fixed,
    /// Double the wait after each failure, up to `--backoff-max` seconds.
    Exponential,
}

impl std::fmt::Display for BackoffKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Fixed => write!(f, "fixed"),
            Self::Exponential => write!(f, "exponential"),
        }
    }
}

// ---------------------------------------------------------------------------
// Shared options
// ---------------------------------------------------------------------------

/// Options common to the client and the server.
#[derive(Args, Serialize, Deserialize, Debug, Clone)]
pub struct Config {
    /// Pre-shared secret between client and server
    #[arg(long, env = "QUICTUN_KEY", default_value = "it's a secrect")]
    pub key: String,

    /// Tuning profile: fast3, fast2, fast, normal, manual
    #[arg(long, value_enum, default_value_t = Mode::Fast)]
    pub mode: Mode,

    /// Maximum transmission unit for UDP packets
    #[arg(long, default_value_t = 1350)]
    pub mtu: u16,

    /// Send window size (number of packets)
    #[arg(long, default_value_t = 1024)]
    pub sndwnd: u32,

    /// Receive window size (number of packets)
    #[arg(long, default_value_t = 1024)]
    pub rcvwnd: u32,

    /// Erasure coding data shards (accepted for compatibility, not applied)
    #[arg(long, visible_alias = "ds", default_value_t = 10)]
    pub datashard: u32,

    /// Erasure coding parity shards (accepted for compatibility, not applied)
    #[arg(long, visible_alias = "ps", default_value_t = 3)]
    pub parityshard: u32,

    /// DSCP marking for outgoing packets (6 bits)
    #[arg(long, default_value_t = 0)]
    pub dscp: u8,

    /// Disable stream compression
    #[arg(long)]
    pub nocomp: bool,

    /// Acknowledge every packet immediately
    #[arg(long, hide = true)]
    pub acknodelay: bool,

    #[arg(long, hide = true, default_value_t = 0)]
    pub nodelay: u32,

    #[arg(long, hide = true, default_value_t = 50)]
    pub interval: u64,

    #[arg(long, hide = true, default_value_t = 0)]
    pub resend: u32,

    #[arg(long, hide = true, default_value_t = 0)]
    pub nc: u32,

    /// Per-socket buffer in bytes
    #[arg(long, default_value_t = 4_194_304)]
    pub sockbuf: usize,

    /// Seconds between keep-alive probes
    #[arg(long, default_value_t = 10)]
    pub keepalive: u64,

    /// Log file, defaults to stderr
    #[arg(long)]
    pub log: Option<String>,

    /// Append periodic stats to this file (strftime pattern, e.g. ./snmp-%Y%m%d.log)
    #[arg(long)]
    pub snmplog: Option<String>,

    /// Stats collection period in seconds
    #[arg(long, default_value_t = 60)]
    pub snmpperiod: u64,

    /// Suppress the 'stream open/close' messages
    #[arg(long)]
    pub quiet: bool,

    /// JSON config file whose keys override the command line
    #[arg(short = 'c', long = "config")]
    #[serde(skip)]
    pub config_file: Option<PathBuf>,
}

impl Config {
    /// Overwrite the tuning tuple with the selected mode preset.
    pub fn apply_mode(&mut self) {
        if let Some(preset) = self.mode.preset() {
            self.nodelay = preset.nodelay;
            self.interval = preset.interval;
            self.resend = preset.resend;
            self.nc = preset.nc;
        }
    }

    /// The tuning tuple currently in effect.
    pub const fn no_delay(&self) -> NoDelay {
        NoDelay {
            nodelay: self.nodelay,
            interval: self.interval,
            resend: self.resend,
            nc: self.nc,
        }
    }

    /// Path of the log file, if one is configured.
    pub fn log_file(&self) -> Option<&Path> {
        self.log.as_deref().map(Path::new)
    }

    fn normalize(&mut self) {
        // An empty string in a JSON file means "not set".
        if self.log.as_deref() == Some("") {
            self.log = None;
        }
        if self.snmplog.as_deref() == Some("") {
            self.snmplog = None;
        }
    }

    fn validate(&self) -> Result<()> {
        if self.key.is_empty() {
            return Err(Error::Config("key must not be empty".into()));
        }
        if self.sndwnd == 0 || self.rcvwnd == 0 {
            return Err(Error::Config(format!(
                "window sizes must be positive (sndwnd={}, rcvwnd={})",
                self.sndwnd, self.rcvwnd
            )));
        }
        if self.dscp > 63 {
            return Err(Error::Config(format!(
                "dscp must fit in 6 bits, got {}",
                self.dscp
            )));
        }
        Ok(())
    }

    /// Log the effective configuration.
    pub fn log_summary(&self) {
        let nd = self.no_delay();
        info!(mode = %self.mode, "encryption: tls13 with pre-shared key");
        info!(
            nodelay = nd.nodelay,
            interval = nd.interval,
            resend = nd.resend,
            nc = nd.nc,
            "nodelay parameters"
        );
        info!(sndwnd = self.sndwnd, rcvwnd = self.rcvwnd, mtu = self.mtu, "windows");
        info!(compression = !self.nocomp, "compression");
        info!(
            datashard = self.datashard,
            parityshard = self.parityshard,
            "erasure coding (not applied by the QUIC transport)"
        );
        info!(acknodelay = self.acknodelay, dscp = self.dscp, "packet options");
        info!(sockbuf = self.sockbuf, keepalive = self.keepalive, "socket options");
        info!(
            snmplog = self.snmplog.as_deref().unwrap_or(""),
            snmpperiod = self.snmpperiod,
            quiet = self.quiet,
            "reporting"
        );
    }
}

// ---------------------------------------------------------------------------
// Client / server
// ---------------------------------------------------------------------------

#[derive(Parser, Serialize, Deserialize, Debug, Clone)]
#[command(
    name = "quictun-client",
    version,
    about = "Forward local TCP connections through a pool of QUIC sessions"
)]
pub struct ClientConfig {
    /// Local listen address
    #[arg(short = 'l', long, default_value = "127.0.0.1:12948")]
    pub listen: String,

    /// quictun server address
    #[arg(short = 't', long, default_value = "127.0.0.1:29900")]
    pub target: String,

    /// Number of sessions to the server
    #[arg(long, default_value_t = 1)]
    pub conn: usize,

    /// Auto expiration time in seconds for a single session, 0 to disable
    #[arg(long, default_value_t = 0, allow_negative_numbers = true)]
    pub autoexpire: i64,

    /// How long an expired session may keep serving streams (seconds), -1 to disable
    #[arg(long, default_value_t = 600, allow_negative_numbers = true)]
    pub scavengettl: i64,

    /// Reconnect backoff policy
    #[arg(long, value_enum, default_value_t = BackoffKind::Fixed)]
    pub backoff: BackoffKind,

    /// Upper bound in seconds for exponential backoff
    #[arg(long = "backoff-max", default_value_t = 30)]
    #[serde(rename = "backoffmax")]
    pub backoff_max: u64,

    #[command(flatten)]
    #[serde(flatten)]
    pub common: Config,
}

impl ClientConfig {
    /// Apply the JSON file (if any) and the mode preset, then validate.
    pub fn load(self) -> Result<Self> {
        let mut config = match self.common.config_file.clone() {
            Some(path) => overlay_file(&self, &path)?,
            None => self,
        };
        config.common.normalize();
        config.common.apply_mode();
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.conn == 0 {
            return Err(Error::Config("conn must be at least 1".into()));
        }
        if self.listen.is_empty() || self.target.is_empty() {
            return Err(Error::Config("listen and target addresses are required".into()));
        }
        self.common.validate()
    }

    pub fn log_summary(&self) {
        info!(listen = %self.listen, target = %self.target, "addresses");
        info!(
            conn = self.conn,
            autoexpire = self.autoexpire,
            scavengettl = self.scavengettl,
            backoff = %self.backoff,
            backoff_max = self.backoff_max,
            "session pool"
        );
        self.common.log_summary();
    }
}

#[derive(Parser, Serialize, Deserialize, Debug, Clone)]
#[command(
    name = "quictun-server",
    version,
    about = "Accept QUIC sessions and bridge their streams to a target service"
)]
pub struct ServerConfig {
    /// UDP listen address
    #[arg(short = 'l', long, default_value = "0.0.0.0:29900")]
    pub listen: String,

    /// Target TCP service address
    #[arg(short = 't', long, default_value = "127.0.0.1:12948")]
    pub target: String,

    /// Serve a stats snapshot on 127.0.0.1:6060
    #[arg(long)]
    pub pprof: bool,

    #[command(flatten)]
    #[serde(flatten)]
    pub common: Config,
}

impl ServerConfig {
    /// Apply the JSON file (if any) and the mode preset, then validate.
    pub fn load(self) -> Result<Self> {
        let mut config = match self.common.config_file.clone() {
            Some(path) => overlay_file(&self, &path)?,
            None => self,
        };
        config.common.normalize();
        config.common.apply_mode();
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.listen.is_empty() || self.target.is_empty() {
            return Err(Error::Config("listen and target addresses are required".into()));
        }
        self.common.validate()
    }

    pub fn log_summary(&self) {
        info!(listen = %self.listen, target = %self.target, pprof = self.pprof, "addresses");
        self.common.log_summary();
    }
}

// ---------------------------------------------------------------------------
// JSON overlay
// ---------------------------------------------------------------------------

/// Overlay the keys of a JSON object file on top of `base`.
fn overlay_file<T>(base: &T, path: &Path) -> Result<T>
where
    T: Serialize + DeserializeOwned,
{
    let text = std::fs::read_to_string(path).map_err(|e| {
        Error::Config(format!("cannot read config file {}: {e}", path.display()))
    })?;
    overlay_json(base, &text)
}

fn overlay_json<T>(base: &T, text: &str) -> Result<T>
where
    T: Serialize + DeserializeOwned,
{
    let mut merged = serde_json::to_value(base)?;
    let overlay: serde_json::Value = serde_json::from_str(text)?;

    let (Some(target), serde_json::Value::Object(source)) = (merged.as_object_mut(), overlay)
    else {
        return Err(Error::Config("config file must contain a JSON object".into()));
    };
    for (key, value) in source {
        target.insert(key, value);
    }

    Ok(serde_json::from_value(merged)?)
}
