//! Mapping from KCP-style tuning knobs to a QUIC transport config.

use std::sync::Arc;
use std::time::Duration;

use quinn::{AckFrequencyConfig, IdleTimeout, TransportConfig, VarInt};

use crate::error::{Result, TransportError};

/// Smallest datagram size QUIC allows.
pub const MIN_MTU: u16 = 1200;

/// Idle timeout floor when keep-alive is short or disabled.
const MIN_IDLE_TIMEOUT: Duration = Duration::from_secs(30);

/// Streams a single session may have open at once in each direction.
const MAX_CONCURRENT_STREAMS: u32 = 4096;

/// Connection tuning as the user expresses it on the command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tuning {
    pub mtu: u16,
    /// Send window in packets.
    pub sndwnd: u32,
    /// Receive window in packets.
    pub rcvwnd: u32,
    /// 1 tightens loss detection.
    pub nodelay: u32,
    /// Internal update interval in milliseconds, used as the initial RTT guess.
    pub interval: u64,
    /// Fast-retransmit trigger; 0 keeps the transport default.
    pub resend: u32,
    /// 1 disables loss-based congestion control.
    pub nc: u32,
    pub acknodelay: bool,
    /// Keep-alive period in seconds; 0 disables it.
    pub keepalive: u64,
}

impl Default for Tuning {
    fn default() -> Self {
        Self {
            mtu: 1350,
            sndwnd: 1024,
            rcvwnd: 1024,
            nodelay: 0,
            interval: 30,
            resend: 2,
            nc: 1,
            acknodelay: false,
            keepalive: 10,
        }
    }
}

impl Tuning {
    pub fn mtu(&self) -> u16 {
        self.mtu.max(MIN_MTU)
    }

    /// Bytes the sender may have in flight.
    pub fn send_window(&self) -> u64 {
        u64::from(self.sndwnd).saturating_mul(u64::from(self.mtu()))
    }

    /// Bytes the receiver advertises, both per connection and per stream.
    pub fn receive_window(&self) -> u64 {
        u64::from(self.rcvwnd).saturating_mul(u64::from(self.mtu()))
    }

    pub fn initial_rtt(&self) -> Duration {
        Duration::from_millis(self.interval.max(1))
    }

    pub fn keep_alive(&self) -> Option<Duration> {
        (self.keepalive > 0).then(|| Duration::from_secs(self.keepalive))
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.keepalive.saturating_mul(6)).max(MIN_IDLE_TIMEOUT)
    }

    /// Loss time threshold as a multiple of the RTT.
    pub fn time_threshold(&self) -> f32 {
        if self.nodelay == 1 {
            1.0
        } else {
            9.0 / 8.0
        }
    }

    /// Reordering threshold in packets, if the default is overridden.
    pub fn packet_threshold(&self) -> Option<u32> {
        (self.resend > 0).then(|| self.resend.saturating_add(1))
    }

    pub fn uses_bbr(&self) -> bool {
        self.nc == 1
    }

    /// Build the quinn transport config.
    pub fn transport_config(&self) -> Result<TransportConfig> {
        let mut config = TransportConfig::default();

        config.initial_mtu(self.mtu());
        config.send_window(self.send_window());
        config.receive_window(varint(self.receive_window()));
        config.stream_receive_window(varint(self.receive_window()));
        config.initial_rtt(self.initial_rtt());
        config.time_threshold(self.time_threshold());
        if let Some(threshold) = self.packet_threshold() {
            config.packet_threshold(threshold);
        }
        if self.uses_bbr() {
            config.congestion_controller_factory(Arc::new(quinn::congestion::BbrConfig::default()));
        }
        if self.acknodelay {
            let mut ack = AckFrequencyConfig::default();
            ack.ack_eliciting_threshold(VarInt::from_u32(0));
            config.ack_frequency_config(Some(ack));
        }

        config.keep_alive_interval(self.keep_alive());
        config.max_idle_timeout(Some(
            IdleTimeout::try_from(self.idle_timeout())
                .map_err(|e| TransportError::Config(format!("invalid idle timeout: {e}")))?,
        ));
        config.max_concurrent_bidi_streams(VarInt::from_u32(MAX_CONCURRENT_STREAMS));
        config.max_concurrent_uni_streams(VarInt::from_u32(0));

        Ok(config)
    }
}

fn varint(value: u64) -> VarInt {
    VarInt::from_u64(value).unwrap_or(VarInt::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mtu_is_clamped_to_quic_minimum() {
        let tuning = Tuning {
            mtu: 576,
            ..Tuning::default()
        };
        assert_eq!(tuning.mtu(), MIN_MTU);
        assert_eq!(Tuning::default().mtu(), 1350);
    }

    #[test]
    fn windows_scale_with_mtu() {
        let tuning = Tuning {
            sndwnd: 128,
            rcvwnd: 512,
            ..Tuning::default()
        };
        assert_eq!(tuning.send_window(), 128 * 1350);
        assert_eq!(tuning.receive_window(), 512 * 1350);
    }

    #[test]
    fn nodelay_tightens_loss_detection() {
        let fast3 = Tuning {
            nodelay: 1,
            ..Tuning::default()
        };
        assert_eq!(fast3.time_threshold(), 1.0);
        assert!(Tuning::default().time_threshold() > 1.0);
    }

    #[test]
    fn resend_sets_packet_threshold() {
        assert_eq!(Tuning::default().packet_threshold(), Some(3));
        let off = Tuning {
            resend: 0,
            ..Tuning::default()
        };
        assert_eq!(off.packet_threshold(), None);
    }

    #[test]
    fn idle_timeout_has_a_floor() {
        let short = Tuning {
            keepalive: 2,
            ..Tuning::default()
        };
        assert_eq!(short.idle_timeout(), Duration::from_secs(30));
        assert_eq!(Tuning::default().idle_timeout(), Duration::from_secs(60));

        let off = Tuning {
            keepalive: 0,
            ..Tuning::default()
        };
        assert_eq!(off.keep_alive(), None);
        assert_eq!(off.idle_timeout(), Duration::from_secs(30));
    }

    #[test]
    fn transport_config_builds_for_every_profile() {
        let profiles = [(0, 40, 2, 1), (0, 30, 2, 1), (1, 20, 2, 1), (1, 10, 2, 1), (0, 50, 0, 0)];
        for (nodelay, interval, resend, nc) in profiles {
            let tuning = Tuning {
                nodelay,
                interval,
                resend,
                nc,
                acknodelay: nodelay == 1,
                ..Tuning::default()
            };
            assert!(tuning.transport_config().is_ok(), "profile {tuning:?}");
        }
    }
}
