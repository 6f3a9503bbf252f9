//! Client accept loop: local TCP connections into the session pool.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use common::ClientConfig;
use tokio::net::TcpListener;
use tracing::{debug, info, info_span, warn, Instrument};
use transport::Dialer;

use crate::error::{Result, TunnelError};
use crate::pool::{Pool, PoolOptions};
use crate::reconnect::Backoff;
use crate::scavenger::{self, Scavenger};

/// Client-side engine settings.
#[derive(Debug, Clone, Copy)]
pub struct ClientOptions {
    pub num_conn: usize,
    pub auto_expire: Option<Duration>,
    /// `None` waits for retired sessions to drain no matter how long.
    pub scavenge_ttl: Option<Duration>,
    pub backoff: Backoff,
    pub quiet: bool,
}

impl ClientOptions {
    pub fn from_config(config: &ClientConfig) -> Self {
        Self {
            num_conn: config.conn,
            auto_expire: PoolOptions::auto_expire_from_secs(config.autoexpire),
            scavenge_ttl: scavenger::ttl_from_secs(config.scavengettl),
            backoff: Backoff::from_config(config.backoff, config.backoff_max),
            quiet: config.common.quiet,
        }
    }
}

pub struct Client<D: Dialer> {
    listener: TcpListener,
    pool: Arc<Pool<D>>,
}

impl<D: Dialer> Client<D> {
    /// Bind the local listener, start the scavenger and fill the pool.
    ///
    /// Returns once every slot holds an established session.
    pub async fn bind(listen: &str, dialer: D, options: ClientOptions) -> Result<Self> {
        let listener = TcpListener::bind(listen)
            .await
            .map_err(|source| TunnelError::Bind {
                addr: listen.to_string(),
                source,
            })?;
        info!(addr = %listener.local_addr()?, "listening on TCP");

        let (scavenger, handle) = Scavenger::new(options.scavenge_ttl);
        tokio::spawn(scavenger.run());

        let pool_options = PoolOptions {
            num_conn: options.num_conn,
            auto_expire: options.auto_expire,
            quiet: options.quiet,
        };
        let pool = Pool::new(dialer, options.backoff, handle, pool_options).await;
        info!(sessions = pool.len(), "session pool ready");

        Ok(Self {
            listener,
            pool: Arc::new(pool),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept local connections forever, one task per connection.
    pub async fn run(self) -> Result<()> {
        loop {
            let (conn, peer) = match self.listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!(%e, "accept failed");
                    continue;
                }
            };
            if let Err(e) = conn.set_nodelay(true) {
                debug!(%e, "failed to set TCP_NODELAY");
            }

            let slot = self.pool.next_slot();
            let pool = Arc::clone(&self.pool);
            tokio::spawn(
                async move { pool.dispatch(slot, conn).await }
                    .instrument(info_span!("conn", %peer, slot)),
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockDialer;
    use clap::Parser;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;

    #[test]
    fn options_from_config() {
        let config = ClientConfig::try_parse_from([
            "quictun-client",
            "--conn",
            "3",
            "--autoexpire",
            "60",
            "--scavengettl",
            "-1",
            "--backoff",
            "exponential",
            "--backoff-max",
            "8",
            "--quiet",
        ])
        .unwrap();
        let options = ClientOptions::from_config(&config);
        assert_eq!(options.num_conn, 3);
        assert_eq!(options.auto_expire, Some(Duration::from_secs(60)));
        assert_eq!(options.scavenge_ttl, None);
        assert_eq!(options.backoff.delay(10), Duration::from_secs(8));
        assert!(options.quiet);
    }

    #[tokio::test]
    async fn local_connections_are_spread_over_the_pool() {
        let dialer = MockDialer::new();
        let options = ClientOptions {
            num_conn: 2,
            auto_expire: None,
            scavenge_ttl: Some(Duration::from_secs(600)),
            backoff: Backoff::default(),
            quiet: true,
        };
        let client = Client::bind("127.0.0.1:0", dialer.clone(), options).await.unwrap();
        let addr = client.local_addr().unwrap();
        tokio::spawn(client.run());

        for i in 0..4_u8 {
            let mut conn = TcpStream::connect(addr).await.unwrap();
            conn.write_all(&[i]).await.unwrap();

            // Wait for the stream to show up on the expected session.
            let sessions = dialer.dialed();
            let session = &sessions[usize::from(i) % 2];
            let mut far_end = loop {
                if let Some(peer) = session.take_peer() {
                    break peer;
                }
                tokio::task::yield_now().await;
            };
            let mut byte = [0_u8; 1];
            far_end.read_exact(&mut byte).await.unwrap();
            assert_eq!(byte, [i]);
        }
        assert!(dialer.dialed().iter().all(|s| s.opened() == 2));
    }

    #[tokio::test]
    async fn bind_failure_is_reported() {
        let taken = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = taken.local_addr().unwrap().to_string();
        let options = ClientOptions {
            num_conn: 1,
            auto_expire: None,
            scavenge_ttl: None,
            backoff: Backoff::default(),
            quiet: true,
        };
        let err = Client::bind(&addr, MockDialer::new(), options).await.err().unwrap();
        assert!(matches!(err, TunnelError::Bind { .. }));
    }
}
