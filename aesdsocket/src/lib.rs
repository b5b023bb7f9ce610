#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]

pub mod cli;
pub mod config;
#[cfg(unix)]
pub mod daemon;
pub mod server;
pub mod shutdown;

pub use cli::Args;
pub use config::Config;
pub use server::{ServerContext, run};
pub use shutdown::{DrainReport, ShutdownSignal};

use aesd_core::{AesdError, Result};
use tokio::net::TcpSocket;
use tracing::warn;

/// Listen on a bound socket, install signal handlers and serve until a
/// termination signal arrives.
pub async fn serve(config: Config, socket: TcpSocket) -> Result<DrainReport> {
    let listener = server::listen(socket)?;
    let ctx = ServerContext::new(config)
        .map_err(|e| AesdError::Setup(format!("cannot create shared log: {e}")))?;

    let signals = match shutdown::install_signal_handlers(std::sync::Arc::clone(&ctx.shutdown)) {
        Ok(signals) => signals,
        Err(e) => {
            if let Err(reset_err) = ctx.log.reset() {
                warn!(target: "aesdsocket", error = %reset_err, "Failed to remove shared log");
            }
            return Err(e);
        },
    };
    tokio::spawn(signals);

    server::run(ctx, listener).await
}
