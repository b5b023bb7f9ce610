//! Server module - TCP listener and orchestration
//!
//! This module owns the dispatch loop and coordinates between connection
//! handling, the worker registry and the timestamp injector.

mod connection;
mod registry;
mod timestamp;

pub use connection::{ConnectionExit, handle_connection};
pub use registry::{CompletionFlag, CompletionGuard, WorkerRecord, WorkerRegistry};
pub use timestamp::{TimestampInjector, format_timestamp};

use crate::config::Config;
use crate::shutdown::{DrainCoordinator, DrainReport, ShutdownSignal};
use aesd_core::{AesdError, Result};
use aesd_io::SharedLog;
use bytes::Bytes;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tracing::{debug, error, info, warn};

/// State shared by every task of one server instance
#[derive(Debug)]
pub struct ServerContext {
    pub config: Config,
    pub log: Arc<SharedLog>,
    pub registry: WorkerRegistry,
    pub shutdown: Arc<ShutdownSignal>,
}

impl ServerContext {
    /// Build the context, recreating the shared log from scratch
    pub fn new(config: Config) -> Result<Arc<Self>> {
        let log = SharedLog::create(&config.data_file)?;
        Ok(Arc::new(Self {
            config,
            log: Arc::new(log),
            registry: WorkerRegistry::new(),
            shutdown: Arc::new(ShutdownSignal::new()),
        }))
    }
}

/// Append to the shared log off the async worker threads
pub(crate) async fn append_blocking(log: &Arc<SharedLog>, data: Bytes) -> Result<u64> {
    let log = Arc::clone(log);
    tokio::task::spawn_blocking(move || log.append(&data))
        .await
        .map_err(|e| AesdError::Join(format!("log append: {e}")))?
}

/// Snapshot the shared log off the async worker threads
pub(crate) async fn snapshot_blocking(log: &Arc<SharedLog>) -> Result<Bytes> {
    let log = Arc::clone(log);
    tokio::task::spawn_blocking(move || log.snapshot())
        .await
        .map_err(|e| AesdError::Join(format!("log snapshot: {e}")))?
}

/// Create and bind the listening socket with `SO_REUSEADDR`.
///
/// Does not need a runtime, so it can run before daemonizing. Call
/// [`TcpSocket::listen`] inside the runtime to start accepting.
pub fn bind(addr: SocketAddr) -> Result<TcpSocket> {
    let socket = if addr.is_ipv4() {
        TcpSocket::new_v4()
    } else {
        TcpSocket::new_v6()
    }
    .map_err(|e| AesdError::Setup(format!("socket creation failed: {e}")))?;

    socket
        .set_reuseaddr(true)
        .map_err(|e| AesdError::Setup(format!("setsockopt SO_REUSEADDR failed: {e}")))?;
    socket
        .bind(addr)
        .map_err(|e| AesdError::Setup(format!("bind to {addr} failed: {e}")))?;

    Ok(socket)
}

/// Start listening on a bound socket
pub fn listen(socket: TcpSocket) -> Result<TcpListener> {
    socket
        .listen(aesd_core::LISTEN_BACKLOG)
        .map_err(|e| AesdError::Setup(format!("listen failed: {e}")))
}

/// Main server entry point.
///
/// Runs the dispatch loop until shutdown is requested, then drains the
/// injector and every connection task and removes the shared log.
pub async fn run(ctx: Arc<ServerContext>, listener: TcpListener) -> Result<DrainReport> {
    let local_addr = listener.local_addr().map_err(AesdError::Transport)?;
    info!(
        target: "aesdsocket::server",
        addr = %local_addr,
        data_file = %ctx.log.path().display(),
        "Server listening"
    );

    let injector = ctx
        .config
        .timestamp_interval()
        .map(|interval| TimestampInjector::spawn(Arc::clone(&ctx), interval));

    accept_loop(&ctx, &listener).await;
    drop(listener);

    let mut coordinator = DrainCoordinator::new(ctx.config.drain_timeout());
    let report = coordinator.execute(&ctx, injector).await?;

    info!(target: "aesdsocket::server", "Server shutdown complete");
    Ok(report)
}

async fn accept_loop(ctx: &Arc<ServerContext>, listener: &TcpListener) {
    let reap_interval = ctx.config.reap_interval();

    loop {
        ctx.registry.reap().await;

        if ctx.shutdown.is_requested() {
            break;
        }

        tokio::select! {
            () = ctx.shutdown.wait() => {
                info!(target: "aesdsocket::server", "Shutdown signal received, stopping accept loop");
                break;
            }
            accept_result = listener.accept() => {
                match accept_result {
                    Ok((stream, peer)) => dispatch(ctx, stream, peer),
                    Err(e) => {
                        error!(target: "aesdsocket::server", error = %AesdError::Transport(e), "Accept failed");
                    }
                }
            }
            () = tokio::time::sleep(reap_interval) => {}
        }
    }
}

/// Spawn a connection task for an accepted socket and register it
fn dispatch(ctx: &Arc<ServerContext>, stream: TcpStream, peer: SocketAddr) {
    if let Some(limit) = ctx.config.max_connections {
        let active = ctx.registry.active_count();
        if active >= limit {
            let err = AesdError::ResourceExhausted { active, limit };
            warn!(target: "aesdsocket::server", peer = %peer, error = %err, "Rejecting connection");
            drop(stream);
            return;
        }
    }

    info!(target: "aesdsocket::server", peer = %peer.ip(), "Accepted connection from {}", peer.ip());

    let conn_id = ctx.registry.next_id();
    let complete = CompletionFlag::new();
    let flag = complete.clone();
    let task_ctx = Arc::clone(ctx);

    let handle = tokio::spawn(async move {
        let _done = flag.guard();
        match handle_connection(&task_ctx, stream, peer, conn_id).await {
            Ok(exit) => {
                debug!(target: "aesdsocket::connection", conn_id, exit = ?exit, "Connection finished");
            },
            Err(e) => {
                warn!(
                    target: "aesdsocket::connection",
                    conn_id,
                    peer = %peer,
                    error = %e,
                    "Connection aborted"
                );
            },
        }
        info!(target: "aesdsocket::connection", conn_id, "Closed connection from {}", peer.ip());
    });

    ctx.registry.register(WorkerRecord::new(conn_id, peer, handle, complete));
}
