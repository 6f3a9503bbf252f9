//! Session lifecycle and relay engine.
//!
//! The client side keeps a fixed pool of sessions, hands each local TCP
//! connection to the next slot round robin and replaces dead or expired
//! sessions lazily. Retired sessions go to the scavenger, which closes them
//! once their streams drain or their TTL runs out. The server side accepts
//! sessions and bridges every stream to the target service.
//!
//! Everything here is written against the [`transport`] traits; the QUIC
//! binding is wired up by the binaries.

pub mod client;
pub mod diagnostics;
mod error;
pub mod pool;
pub mod reconnect;
pub mod relay;
pub mod scavenger;
pub mod server;
pub mod stats;

#[cfg(test)]
mod testing;

pub use client::{Client, ClientOptions};
pub use error::{Result, TunnelError};
pub use pool::{Pool, PoolOptions};
pub use reconnect::{Backoff, Reconnector};
pub use scavenger::{Scavenger, ScavengerHandle};
pub use server::Server;

use std::net::SocketAddr;

use common::Config;
use transport::{TransportOptions, Tuning};

/// Resolve `host:port` to the first address it maps to.
pub async fn resolve(addr: &str) -> Result<SocketAddr> {
    tokio::net::lookup_host(addr)
        .await
        .map_err(|_| TunnelError::Resolve(addr.to_string()))?
        .next()
        .ok_or_else(|| TunnelError::Resolve(addr.to_string()))
}

/// Transport settings for `addr` from the shared configuration.
pub fn transport_options(addr: SocketAddr, config: &Config) -> TransportOptions {
    TransportOptions {
        addr,
        key: config.key.clone(),
        tuning: Tuning {
            mtu: config.mtu,
            sndwnd: config.sndwnd,
            rcvwnd: config.rcvwnd,
            nodelay: config.nodelay,
            interval: config.interval,
            resend: config.resend,
            nc: config.nc,
            acknodelay: config.acknodelay,
            keepalive: config.keepalive,
        },
        compression: !config.nocomp,
        sockbuf: config.sockbuf,
        dscp: config.dscp,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;
    use common::ClientConfig;

    #[test]
    fn options_follow_the_mode_preset() {
        let config = ClientConfig::try_parse_from(["quictun-client", "--mode", "fast3", "--nocomp", "--dscp", "46"])
            .unwrap()
            .load()
            .unwrap();
        let addr: SocketAddr = "127.0.0.1:29900".parse().unwrap();
        let options = transport_options(addr, &config.common);

        assert_eq!(options.addr, addr);
        assert_eq!(options.tuning.nodelay, 1);
        assert_eq!(options.tuning.interval, 10);
        assert!(!options.compression);
        assert_eq!(options.dscp, 46);
        assert_eq!(options.key, config.common.key);
    }

    #[tokio::test]
    async fn resolves_literal_addresses() {
        let addr = resolve("127.0.0.1:12948").await.unwrap();
        assert_eq!(addr.port(), 12948);
        assert!(resolve("not an address").await.is_err());
    }
}
