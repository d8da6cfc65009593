// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 TunnelWorm Contributors

// Bidirectional copy between an accepted connection and its channel

use std::future::Future;
use std::io;
use std::time::Duration;

use tokio::io::{copy_bidirectional, AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::debug;

/// Copy both ways until either side closes or `cancel` fires, then shut both ends down
pub async fn splice<A, B>(mut local: A, mut remote: B, cancel: CancellationToken) -> io::Result<()>
where
    A: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    let result = tokio::select! {
        r = copy_bidirectional(&mut local, &mut remote) => r.map(Some),
        _ = cancel.cancelled() => Ok(None),
    };

    let _ = remote.shutdown().await;
    let _ = local.shutdown().await;

    match result {
        Ok(Some((from_local, from_remote))) => {
            debug!(
                "Forward connection closed: {} bytes from local, {} bytes from remote",
                from_local, from_remote
            );
            Ok(())
        }
        Ok(None) => {
            debug!("Forward connection closed after drain grace expired");
            Ok(())
        }
        // Half-close races are a normal way for a connection to end
        Err(err)
            if matches!(
                err.kind(),
                io::ErrorKind::BrokenPipe
                    | io::ErrorKind::NotConnected
                    | io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
            ) =>
        {
            Ok(())
        }
        Err(err) => Err(err),
    }
}

/// Track one accepted connection. The whole handler, handshake included, is dropped
/// once `splices` fires, so a stalled peer cannot hold up a drain.
pub(crate) fn spawn_connection<F>(tracker: &TaskTracker, splices: &CancellationToken, handler: F)
where
    F: Future<Output = ()> + Send + 'static,
{
    let splices = splices.clone();
    tracker.spawn(async move {
        tokio::select! {
            biased;
            _ = handler => {}
            _ = splices.cancelled() => {}
        }
    });
}

/// Let in-flight splices finish for `grace`, then cut the rest off
pub async fn drain(tracker: TaskTracker, splices: CancellationToken, grace: Duration) {
    tracker.close();
    if tokio::time::timeout(grace, tracker.wait()).await.is_err() {
        debug!(
            "{} connection(s) still open after {:?}, closing",
            tracker.len(),
            grace
        );
        splices.cancel();
        tracker.wait().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{duplex, AsyncReadExt};

    #[tokio::test]
    async fn test_splice_copies_both_ways() {
        let (mut app, local) = duplex(1024);
        let (remote, mut server) = duplex(1024);
        let task = tokio::spawn(splice(local, remote, CancellationToken::new()));

        app.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        server.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        server.write_all(b"pong").await.unwrap();
        app.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong");

        drop(app);
        drop(server);
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_drain_cancels_after_grace() {
        let tracker = TaskTracker::new();
        let splices = CancellationToken::new();

        // Both peers stay open, so only cancellation ends the splice
        let (_app, local) = duplex(64);
        let (remote, _server) = duplex(64);
        tracker.spawn(splice(local, remote, splices.clone()));

        let started = tokio::time::Instant::now();
        drain(tracker.clone(), splices.clone(), Duration::from_millis(50)).await;

        assert!(splices.is_cancelled());
        assert!(tracker.is_empty());
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_drain_cuts_off_stalled_handlers() {
        let tracker = TaskTracker::new();
        let splices = CancellationToken::new();
        spawn_connection(&tracker, &splices, std::future::pending());

        let drained = tokio::time::timeout(
            Duration::from_secs(2),
            drain(tracker.clone(), splices.clone(), Duration::from_millis(20)),
        )
        .await;
        assert!(drained.is_ok());
        assert!(tracker.is_empty());
    }

    #[tokio::test]
    async fn test_drain_waits_for_finished_splices() {
        let tracker = TaskTracker::new();
        let splices = CancellationToken::new();
        tracker.spawn(async {});

        drain(tracker.clone(), splices.clone(), Duration::from_secs(5)).await;
        assert!(!splices.is_cancelled());
    }
}
