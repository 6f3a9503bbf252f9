//! Bidirectional byte relay between two streams.

use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::timeout;
use tracing::{debug, info};

use crate::stats::STATS;

const RELAY_BUF_SIZE: usize = 32 * 1024;

/// Upper bound on flushing a half-closed side during teardown.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(1);

/// Copy bytes between `a` and `b` until either side reaches EOF or fails,
/// then shut both down.
///
/// Returns the bytes copied `(a -> b, b -> a)`.
pub async fn bridge<A, B>(a: A, b: B, quiet: bool) -> (u64, u64)
where
    A: AsyncRead + AsyncWrite + Unpin + Send,
    B: AsyncRead + AsyncWrite + Unpin + Send,
{
    if !quiet {
        info!("stream opened");
    }
    STATS.stream_opened();

    let (mut a_read, mut a_write) = tokio::io::split(a);
    let (mut b_read, mut b_write) = tokio::io::split(b);
    let mut a_to_b = 0_u64;
    let mut b_to_a = 0_u64;

    tokio::select! {
        r = pipe(&mut a_read, &mut b_write, &mut a_to_b) => {
            if let Err(e) = r {
                debug!(%e, "forward direction ended with error");
            }
        }
        r = pipe(&mut b_read, &mut a_write, &mut b_to_a) => {
            if let Err(e) = r {
                debug!(%e, "reverse direction ended with error");
            }
        }
    }

    let _ = timeout(SHUTDOWN_GRACE, a_write.shutdown()).await;
    let _ = timeout(SHUTDOWN_GRACE, b_write.shutdown()).await;

    STATS.stream_closed();
    STATS.add_bytes(a_to_b.saturating_add(b_to_a));
    if !quiet {
        info!(sent = a_to_b, received = b_to_a, "stream closed");
    }
    (a_to_b, b_to_a)
}

/// Copy until EOF, counting bytes as they are written.
async fn pipe<R, W>(reader: &mut R, writer: &mut W, copied: &mut u64) -> std::io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0_u8; RELAY_BUF_SIZE];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            return Ok(());
        }
        writer.write_all(buf.get(..n).unwrap_or_default()).await?;
        writer.flush().await?;
        *copied = copied.saturating_add(n as u64);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;
    use std::pin::Pin;
    use std::task::{Context, Poll};
    use tokio::io::{duplex, DuplexStream, ReadBuf};

    /// Writes pass through; every read fails.
    struct BrokenRead(DuplexStream);

    impl AsyncRead for BrokenRead {
        fn poll_read(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            _buf: &mut ReadBuf<'_>,
        ) -> Poll<io::Result<()>> {
            Poll::Ready(Err(io::Error::new(io::ErrorKind::ConnectionReset, "reset")))
        }
    }

    impl AsyncWrite for BrokenRead {
        fn poll_write(
            mut self: Pin<&mut Self>,
            cx: &mut Context<'_>,
            buf: &[u8],
        ) -> Poll<io::Result<usize>> {
            Pin::new(&mut self.0).poll_write(cx, buf)
        }

        fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Pin::new(&mut self.0).poll_flush(cx)
        }

        fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Pin::new(&mut self.0).poll_shutdown(cx)
        }
    }

    #[tokio::test]
    async fn copies_both_ways_and_closes_on_eof() {
        let (mut local, local_inner) = duplex(1024);
        let (mut remote, remote_inner) = duplex(1024);
        let relay = tokio::spawn(bridge(local_inner, remote_inner, true));

        local.write_all(b"request").await.unwrap();
        let mut buf = [0_u8; 7];
        remote.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"request");

        remote.write_all(b"response!").await.unwrap();
        let mut buf = [0_u8; 9];
        local.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"response!");

        // Closing one side tears down the other.
        drop(local);
        let mut rest = Vec::new();
        remote.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());

        assert_eq!(relay.await.unwrap(), (7, 9));
    }

    #[tokio::test]
    async fn read_error_on_one_side_closes_the_other() {
        let (mut local, local_inner) = duplex(1024);
        let (mut remote, remote_inner) = duplex(1024);

        let counts = bridge(BrokenRead(local_inner), remote_inner, true).await;
        assert_eq!(counts, (0, 0));

        let mut rest = Vec::new();
        remote.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
        local.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
    }

    #[tokio::test]
    async fn large_transfer_is_unchanged() {
        let (mut local, local_inner) = duplex(4096);
        let (mut remote, remote_inner) = duplex(4096);
        let relay = tokio::spawn(bridge(local_inner, remote_inner, false));

        let payload: Vec<u8> = (0..300_000_u32).map(|i| (i * 7 % 256) as u8).collect();
        let expected = payload.clone();
        let writer = tokio::spawn(async move {
            local.write_all(&payload).await.unwrap();
            local.shutdown().await.unwrap();
            local
        });

        let mut received = Vec::new();
        remote.read_to_end(&mut received).await.unwrap();
        assert_eq!(received, expected);

        let _local = writer.await.unwrap();
        let (sent, back) = relay.await.unwrap();
        assert_eq!(sent, 300_000);
        assert_eq!(back, 0);
    }
}
