//! Byte relay between a client and its upstream.

use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;

/// TLS alert descriptions sent on rejection.
pub const ALERT_INTERNAL_ERROR: u8 = 80;
pub const ALERT_UNRECOGNIZED_NAME: u8 = 112;

const CONTENT_TYPE_ALERT: u8 = 21;
const ALERT_LEVEL_FATAL: u8 = 2;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RelayStats {
    pub to_upstream: u64,
    pub to_client: u64,
}

/// A fatal TLS alert record.
pub fn alert_record(description: u8) -> [u8; 7] {
    [
        CONTENT_TYPE_ALERT,
        3,
        3,
        0,
        2,
        ALERT_LEVEL_FATAL,
        description,
    ]
}

/// Send a fatal alert and close. Errors are ignored: the client may
/// already be gone.
pub async fn reject(mut client: TcpStream, description: u8) {
    if client.write_all(&alert_record(description)).await.is_ok() {
        let _ = client.shutdown().await;
    }
}

/// Replay `prefix` to the upstream, then copy in both directions.
///
/// When one direction reaches EOF the other peer's write side is shut down
/// and the remaining direction gets `linger` to drain before both sockets
/// are dropped. An error in either direction drops both at once, as does
/// `cancel`.
pub async fn relay(
    mut client: TcpStream,
    mut upstream: TcpStream,
    prefix: &[u8],
    linger: Duration,
    cancel: &CancellationToken,
) -> std::io::Result<RelayStats> {
    upstream.write_all(prefix).await?;
    let mut stats = RelayStats {
        to_upstream: prefix.len() as u64,
        to_client: 0,
    };

    let (mut client_read, mut client_write) = client.split();
    let (mut upstream_read, mut upstream_write) = upstream.split();

    let to_upstream = async {
        let n = tokio::io::copy(&mut client_read, &mut upstream_write).await?;
        upstream_write.shutdown().await?;
        Ok::<u64, std::io::Error>(n)
    };
    let to_client = async {
        let n = tokio::io::copy(&mut upstream_read, &mut client_write).await?;
        client_write.shutdown().await?;
        Ok::<u64, std::io::Error>(n)
    };
    tokio::pin!(to_upstream, to_client);

    tokio::select! {
        _ = cancel.cancelled() => {}
        sent = &mut to_upstream => {
            stats.to_upstream += sent?;
            if let Ok(received) = tokio::time::timeout(linger, &mut to_client).await {
                stats.to_client += received?;
            }
        }
        received = &mut to_client => {
            stats.to_client += received?;
            if let Ok(sent) = tokio::time::timeout(linger, &mut to_upstream).await {
                stats.to_upstream += sent?;
            }
        }
    }
    Ok(stats)
}

/// Read until EOF, bounded by a few seconds.
#[cfg(test)]
pub(crate) async fn read_all(stream: &mut TcpStream) -> Vec<u8> {
    use tokio::io::AsyncReadExt;
    let mut out = Vec::new();
    let _ = tokio::time::timeout(Duration::from_secs(3), stream.read_to_end(&mut out)).await;
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;
    use tokio::net::TcpListener;

    async fn pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr: SocketAddr = listener.local_addr().unwrap();
        let (connected, accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());
        (connected.unwrap(), accepted.unwrap().0)
    }

    #[test]
    fn alert_record_layout() {
        assert_eq!(alert_record(ALERT_UNRECOGNIZED_NAME), [21, 3, 3, 0, 2, 2, 112]);
    }

    #[tokio::test]
    async fn relays_prefix_and_both_directions() {
        let (mut client, client_side) = pair().await;
        let (upstream_side, mut upstream) = pair().await;
        let cancel = CancellationToken::new();

        let task = tokio::spawn(async move {
            relay(
                client_side,
                upstream_side,
                b"hello-",
                Duration::from_secs(1),
                &cancel,
            )
            .await
        });

        client.write_all(b"world").await.unwrap();
        client.shutdown().await.unwrap();

        let received = read_all(&mut upstream).await;
        assert_eq!(received, b"hello-world");

        upstream.write_all(b"reply").await.unwrap();
        upstream.shutdown().await.unwrap();
        assert_eq!(read_all(&mut client).await, b"reply");

        let stats = task.await.unwrap().unwrap();
        assert_eq!(stats.to_upstream, 11);
        assert_eq!(stats.to_client, 5);
    }

    #[tokio::test]
    async fn closing_upstream_closes_client_within_linger() {
        let (mut client, client_side) = pair().await;
        let (upstream_side, upstream) = pair().await;
        let cancel = CancellationToken::new();

        let task = tokio::spawn(async move {
            relay(
                client_side,
                upstream_side,
                b"",
                Duration::from_millis(100),
                &cancel,
            )
            .await
        });

        drop(upstream);
        // Client never closes its side; the relay must still finish.
        assert!(read_all(&mut client).await.is_empty());
        tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .expect("relay finished")
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn cancel_drops_both_sides() {
        let (mut client, client_side) = pair().await;
        let (upstream_side, mut upstream) = pair().await;
        let cancel = CancellationToken::new();
        let relay_cancel = cancel.clone();

        let task = tokio::spawn(async move {
            relay(
                client_side,
                upstream_side,
                b"",
                Duration::from_secs(5),
                &relay_cancel,
            )
            .await
        });

        cancel.cancel();
        task.await.unwrap().unwrap();
        assert!(read_all(&mut client).await.is_empty());
        assert!(read_all(&mut upstream).await.is_empty());
    }
}
