//! Connection handling - per-client receive, append and reply cycle
//!
//! A connection alternates between receiving and replying:
//! - Receiving: every chunk read from the socket is appended to the shared
//!   log. A chunk containing the delimiter completes the record.
//! - Replying: the full log snapshot is written back to the peer, after which
//!   the connection returns to receiving until the peer closes.
//!
//! Shutdown is polled before every blocking wait and also raced against each
//! socket read and write, so a parked connection exits promptly.

use super::{ServerContext, append_blocking, snapshot_blocking};
use aesd_core::{AesdError, Result, TRANSFER_BUFFER_SIZE, contains_delimiter};
use bytes::Bytes;
use std::net::SocketAddr;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, trace};

/// Why a connection stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionExit {
    /// Peer closed its side of the connection
    PeerClosed,
    /// Shutdown was requested while the connection was active
    Shutdown,
}

/// Result of one receive step
enum ReceiveAction {
    /// More bytes are needed before the record is complete
    Continue,
    /// A delimiter arrived, reply with a snapshot
    Reply,
    /// Stop serving this connection
    Exit(ConnectionExit),
}

/// Serve one client until it closes, shutdown is requested, or an error
/// occurs.
///
/// Generic over the stream so tests can drive it with an in-memory duplex.
pub async fn handle_connection<S>(
    ctx: &ServerContext,
    mut stream: S,
    peer: SocketAddr,
    conn_id: u64,
) -> Result<ConnectionExit>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let mut buffer = vec![0u8; TRANSFER_BUFFER_SIZE];

    loop {
        match receive_chunk(ctx, &mut stream, &mut buffer, peer, conn_id).await? {
            ReceiveAction::Continue => {},
            ReceiveAction::Reply => {
                if let Some(exit) = send_snapshot(ctx, &mut stream, peer, conn_id).await? {
                    return Ok(exit);
                }
            },
            ReceiveAction::Exit(exit) => return Ok(exit),
        }
    }
}

async fn receive_chunk<S>(
    ctx: &ServerContext,
    stream: &mut S,
    buffer: &mut [u8],
    peer: SocketAddr,
    conn_id: u64,
) -> Result<ReceiveAction>
where
    S: AsyncRead + Unpin,
{
    if ctx.shutdown.is_requested() {
        debug!(target: "aesdsocket::connection", conn_id, "Shutdown requested, closing connection");
        return Ok(ReceiveAction::Exit(ConnectionExit::Shutdown));
    }

    let n = tokio::select! {
        biased;
        () = ctx.shutdown.wait() => {
            debug!(target: "aesdsocket::connection", conn_id, "Shutdown requested, closing connection");
            return Ok(ReceiveAction::Exit(ConnectionExit::Shutdown));
        }
        read = stream.read(buffer) => read.map_err(AesdError::Transport)?,
    };

    if n == 0 {
        trace!(target: "aesdsocket::connection", conn_id, peer = %peer, "Peer closed connection");
        return Ok(ReceiveAction::Exit(ConnectionExit::PeerClosed));
    }

    let chunk = Bytes::copy_from_slice(&buffer[..n]);
    let complete = contains_delimiter(&chunk);
    append_blocking(&ctx.log, chunk).await?;
    trace!(target: "aesdsocket::connection", conn_id, bytes = n, complete, "Appended chunk");

    if complete {
        Ok(ReceiveAction::Reply)
    } else {
        Ok(ReceiveAction::Continue)
    }
}

/// Write the full log snapshot to the peer, handling partial writes.
///
/// Returns `Some(exit)` if the connection should stop afterwards.
async fn send_snapshot<S>(
    ctx: &ServerContext,
    stream: &mut S,
    peer: SocketAddr,
    conn_id: u64,
) -> Result<Option<ConnectionExit>>
where
    S: AsyncWrite + Unpin,
{
    let snapshot = snapshot_blocking(&ctx.log).await?;

    let mut sent = 0usize;
    while sent < snapshot.len() {
        if ctx.shutdown.is_requested() {
            return Ok(Some(ConnectionExit::Shutdown));
        }

        let n = tokio::select! {
            biased;
            () = ctx.shutdown.wait() => return Ok(Some(ConnectionExit::Shutdown)),
            written = stream.write(&snapshot[sent..]) => written.map_err(AesdError::Transport)?,
        };
        if n == 0 {
            return Err(AesdError::Transport(std::io::Error::new(
                std::io::ErrorKind::WriteZero,
                "peer stopped accepting reply bytes",
            )));
        }
        sent += n;
    }
    stream.flush().await.map_err(AesdError::Transport)?;

    debug!(
        target: "aesdsocket::connection",
        conn_id,
        peer = %peer,
        bytes = sent,
        "Replied with log snapshot"
    );

    Ok(None)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::config::Config;
    use std::io;
    use std::pin::Pin;
    use std::sync::Arc;
    use std::task::{Context, Poll};
    use tempfile::{TempDir, tempdir};
    use tokio::io::{ReadBuf, duplex};

    /// Stream that yields `input`, then fails every read with a reset.
    /// Writes fail too when `fail_writes` is set.
    struct FaultyStream {
        input: Vec<u8>,
        fail_writes: bool,
        written: Vec<u8>,
    }

    impl FaultyStream {
        fn new(input: &[u8], fail_writes: bool) -> Self {
            Self {
                input: input.to_vec(),
                fail_writes,
                written: Vec::new(),
            }
        }
    }

    impl AsyncRead for FaultyStream {
        fn poll_read(
            mut self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            buf: &mut ReadBuf<'_>,
        ) -> Poll<io::Result<()>> {
            if self.input.is_empty() {
                return Poll::Ready(Err(io::Error::from(io::ErrorKind::ConnectionReset)));
            }
            let n = self.input.len().min(buf.remaining());
            let chunk: Vec<u8> = self.input.drain(..n).collect();
            buf.put_slice(&chunk);
            Poll::Ready(Ok(()))
        }
    }

    impl AsyncWrite for FaultyStream {
        fn poll_write(
            mut self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            data: &[u8],
        ) -> Poll<io::Result<usize>> {
            if self.fail_writes {
                return Poll::Ready(Err(io::Error::from(io::ErrorKind::BrokenPipe)));
            }
            self.written.extend_from_slice(data);
            Poll::Ready(Ok(data.len()))
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    fn test_context() -> (TempDir, Arc<ServerContext>) {
        let dir = tempdir().unwrap();
        let config = Config {
            data_file: dir.path().join("data"),
            ..Config::default()
        };
        let ctx = ServerContext::new(config).unwrap();
        (dir, ctx)
    }

    fn peer() -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], 50000))
    }

    async fn read_exactly<S: AsyncRead + Unpin>(stream: &mut S, len: usize) -> Vec<u8> {
        let mut buf = vec![0u8; len];
        stream.read_exact(&mut buf).await.unwrap();
        buf
    }

    #[tokio::test]
    async fn test_record_is_appended_and_echoed() {
        let (_dir, ctx) = test_context();
        let (mut client, server) = duplex(4096);

        let task_ctx = Arc::clone(&ctx);
        let task =
            tokio::spawn(async move { handle_connection(&task_ctx, server, peer(), 0).await });

        client.write_all(b"hello\n").await.unwrap();
        assert_eq!(read_exactly(&mut client, 6).await, b"hello\n");

        drop(client);
        let exit = task.await.unwrap().unwrap();
        assert_eq!(exit, ConnectionExit::PeerClosed);
        assert_eq!(ctx.log.snapshot().unwrap().as_ref(), b"hello\n");
    }

    #[tokio::test]
    async fn test_record_split_across_writes() {
        let (_dir, ctx) = test_context();
        let (mut client, server) = duplex(4096);

        let task_ctx = Arc::clone(&ctx);
        let task =
            tokio::spawn(async move { handle_connection(&task_ctx, server, peer(), 0).await });

        client.write_all(b"hel").await.unwrap();
        client.flush().await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        client.write_all(b"lo\n").await.unwrap();

        assert_eq!(read_exactly(&mut client, 6).await, b"hello\n");
        drop(client);
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_connection_serves_multiple_records() {
        let (_dir, ctx) = test_context();
        let (mut client, server) = duplex(4096);

        let task_ctx = Arc::clone(&ctx);
        let task =
            tokio::spawn(async move { handle_connection(&task_ctx, server, peer(), 0).await });

        client.write_all(b"first\n").await.unwrap();
        assert_eq!(read_exactly(&mut client, 6).await, b"first\n");

        client.write_all(b"second\n").await.unwrap();
        assert_eq!(read_exactly(&mut client, 13).await, b"first\nsecond\n");

        drop(client);
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_partial_data_then_close_gets_no_reply() {
        let (_dir, ctx) = test_context();
        let (mut client, server) = duplex(4096);

        let task_ctx = Arc::clone(&ctx);
        let task =
            tokio::spawn(async move { handle_connection(&task_ctx, server, peer(), 0).await });

        client.write_all(b"no newline").await.unwrap();
        client.shutdown().await.unwrap();

        let exit = task.await.unwrap().unwrap();
        assert_eq!(exit, ConnectionExit::PeerClosed);
        assert_eq!(ctx.log.snapshot().unwrap().as_ref(), b"no newline");

        let mut rest = Vec::new();
        client.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
    }

    #[tokio::test]
    async fn test_reply_larger_than_transfer_buffer() {
        let (_dir, ctx) = test_context();
        let big = format!("{}\n", "a".repeat(TRANSFER_BUFFER_SIZE * 3));
        ctx.log.append(big.as_bytes()).unwrap();

        let (mut client, server) = duplex(512);
        let task_ctx = Arc::clone(&ctx);
        let task =
            tokio::spawn(async move { handle_connection(&task_ctx, server, peer(), 0).await });

        client.write_all(b"tail\n").await.unwrap();
        let reply = read_exactly(&mut client, big.len() + 5).await;
        assert_eq!(&reply[..big.len()], big.as_bytes());
        assert_eq!(&reply[big.len()..], b"tail\n");

        drop(client);
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_unblocks_idle_connection() {
        let (_dir, ctx) = test_context();
        let (mut client, server) = duplex(4096);

        let task_ctx = Arc::clone(&ctx);
        let task =
            tokio::spawn(async move { handle_connection(&task_ctx, server, peer(), 0).await });

        client.write_all(b"waiting").await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        ctx.shutdown.trigger();

        let exit = tokio::time::timeout(std::time::Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(exit, ConnectionExit::Shutdown);
    }

    #[tokio::test]
    async fn test_receive_error_ends_only_that_connection() {
        let (_dir, ctx) = test_context();

        let mut faulty = FaultyStream::new(b"", false);
        let result = handle_connection(&ctx, &mut faulty, peer(), 0).await;
        assert!(matches!(result, Err(AesdError::Transport(_))));
        assert!(faulty.written.is_empty());
        assert!(ctx.log.is_empty().unwrap());

        // Another connection on the same server is unaffected
        let (mut client, server) = duplex(4096);
        let task_ctx = Arc::clone(&ctx);
        let task =
            tokio::spawn(async move { handle_connection(&task_ctx, server, peer(), 1).await });
        client.write_all(b"still here\n").await.unwrap();
        assert_eq!(read_exactly(&mut client, 11).await, b"still here\n");
        drop(client);
        assert_eq!(task.await.unwrap().unwrap(), ConnectionExit::PeerClosed);
    }

    #[tokio::test]
    async fn test_partial_record_then_receive_error_gets_no_reply() {
        let (_dir, ctx) = test_context();

        let mut faulty = FaultyStream::new(b"half", false);
        let result = handle_connection(&ctx, &mut faulty, peer(), 0).await;
        assert!(matches!(result, Err(AesdError::Transport(_))));
        assert!(faulty.written.is_empty());
    }

    #[tokio::test]
    async fn test_send_error_aborts_reply() {
        let (_dir, ctx) = test_context();

        let mut faulty = FaultyStream::new(b"hi\n", true);
        let result = handle_connection(&ctx, &mut faulty, peer(), 0).await;
        assert!(matches!(result, Err(AesdError::Transport(_))));
        assert!(faulty.written.is_empty());
        // The record was stored before the reply was attempted
        assert_eq!(ctx.log.snapshot().unwrap().as_ref(), b"hi\n");
    }

    #[tokio::test]
    async fn test_append_failure_aborts_request_without_reply() {
        let (_dir, ctx) = test_context();
        ctx.log.fail_next_appends(1);

        let (mut client, server) = duplex(4096);
        let task_ctx = Arc::clone(&ctx);
        let task =
            tokio::spawn(async move { handle_connection(&task_ctx, server, peer(), 0).await });

        client.write_all(b"dropped\n").await.unwrap();
        let result = task.await.unwrap();
        assert!(matches!(result, Err(AesdError::Storage(_))));

        let mut rest = Vec::new();
        client.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
        assert!(ctx.log.is_empty().unwrap());
    }
}
