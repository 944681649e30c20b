//! Full-duplex byte relay between the two legs of an intercepted tunnel.

use crate::error::ProxyError;
use std::io;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Why a relay stopped.
#[derive(Debug)]
pub enum RelayEnd {
    /// The client stopped sending; carries bytes copied client→origin.
    ClientClosed(u64),
    /// The origin stopped sending; carries bytes copied origin→client.
    OriginClosed(u64),
    /// A copy on either leg failed.
    Failed(ProxyError),
    /// The tunnel outlived its maximum lifetime.
    TimedOut,
    /// The server is shutting down.
    Cancelled,
}

/// Aborts the client→origin leg if the relay future is dropped early, so
/// neither stream half outlives the relay.
struct AbortOnDrop(JoinHandle<io::Result<u64>>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Copy bytes in both directions until either direction ends.
///
/// client→origin runs as its own task while origin→client runs on the
/// caller's task. Whichever finishes first tears the other down; the client
/// write half is shut down before returning and both streams are dropped,
/// closing the sockets.
pub async fn relay<C, O>(
    client: C,
    origin: O,
    max_lifetime: Duration,
    cancel: CancellationToken,
) -> RelayEnd
where
    C: AsyncRead + AsyncWrite + Send + 'static,
    O: AsyncRead + AsyncWrite + Send + 'static,
{
    let (mut client_r, mut client_w) = tokio::io::split(client);
    let (mut origin_r, mut origin_w) = tokio::io::split(origin);

    let mut upstream = AbortOnDrop(tokio::spawn(async move {
        let copied = tokio::io::copy(&mut client_r, &mut origin_w).await;
        let _ = origin_w.shutdown().await;
        copied
    }));

    let end = tokio::select! {
        copied = tokio::io::copy(&mut origin_r, &mut client_w) => match copied {
            Ok(n) => RelayEnd::OriginClosed(n),
            Err(e) => RelayEnd::Failed(ProxyError::RelayIo(e)),
        },
        joined = &mut upstream.0 => match joined {
            Ok(Ok(n)) => RelayEnd::ClientClosed(n),
            Ok(Err(e)) => RelayEnd::Failed(ProxyError::RelayIo(e)),
            Err(e) => RelayEnd::Failed(ProxyError::RelayIo(io::Error::other(e))),
        },
        _ = tokio::time::sleep(max_lifetime) => RelayEnd::TimedOut,
        _ = cancel.cancelled() => RelayEnd::Cancelled,
    };

    drop(upstream);
    let _ = client_w.shutdown().await;
    end
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{duplex, AsyncReadExt};

    const LONG: Duration = Duration::from_secs(60);

    #[tokio::test]
    async fn test_relays_both_directions() {
        let (proxy_client, mut client) = duplex(1024);
        let (proxy_origin, mut origin) = duplex(1024);
        let relay = tokio::spawn(relay(proxy_client, proxy_origin, LONG, CancellationToken::new()));

        client.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        origin.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        origin.write_all(b"pong").await.unwrap();
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong");

        drop(origin);
        let end = tokio::time::timeout(Duration::from_secs(5), relay)
            .await
            .expect("relay should end once the origin closes")
            .unwrap();
        assert!(matches!(end, RelayEnd::OriginClosed(4)));

        // The client leg observes end-of-stream
        let mut rest = Vec::new();
        client.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
    }

    #[tokio::test]
    async fn test_client_close_ends_relay() {
        let (proxy_client, client) = duplex(1024);
        let (proxy_origin, mut origin) = duplex(1024);
        let relay = tokio::spawn(relay(proxy_client, proxy_origin, LONG, CancellationToken::new()));

        drop(client);
        let end = tokio::time::timeout(Duration::from_secs(5), relay)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(end, RelayEnd::ClientClosed(0)));

        let mut rest = Vec::new();
        origin.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
    }

    #[tokio::test]
    async fn test_cancellation_and_lifetime() {
        let (proxy_client, _client) = duplex(64);
        let (proxy_origin, _origin) = duplex(64);
        let cancel = CancellationToken::new();
        let relay_task = tokio::spawn(relay(proxy_client, proxy_origin, LONG, cancel.clone()));
        cancel.cancel();
        let end = relay_task.await.unwrap();
        assert!(matches!(end, RelayEnd::Cancelled));

        let (proxy_client, _client) = duplex(64);
        let (proxy_origin, _origin) = duplex(64);
        let end = relay(
            proxy_client,
            proxy_origin,
            Duration::from_millis(50),
            CancellationToken::new(),
        )
        .await;
        assert!(matches!(end, RelayEnd::TimedOut));
    }
}
