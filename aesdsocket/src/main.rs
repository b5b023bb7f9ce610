#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]

use aesdsocket::{Args, Config, server};
use clap::Parser;
use std::path::Path;
use std::process::ExitCode;
use std::time::Duration;
use tracing::{error, info, warn};

/// How long runtime shutdown waits for in-flight blocking log I/O
const RUNTIME_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(1);

fn main() -> ExitCode {
    let args = Args::parse();

    // Handle --gen-config before initializing tracing
    if let Some(path) = &args.gen_config {
        if let Err(e) = generate_config(path) {
            eprintln!("Failed to generate config: {}", e);
            return ExitCode::FAILURE;
        }
        println!("Generated default config at: {}", path.display());
        return ExitCode::SUCCESS;
    }

    init_tracing();

    let config = match &args.config {
        Some(path) => match Config::from_file(path) {
            Ok(mut c) => {
                c.daemon |= args.daemon;
                c
            },
            Err(e) => {
                error!(
                    target: "aesdsocket",
                    error = %e,
                    path = %path.display(),
                    "Failed to load config file"
                );
                return ExitCode::FAILURE;
            },
        },
        None => Config::from_args(&args),
    };
    if let Err(e) = config.validate() {
        error!(target: "aesdsocket", error = %e, "Invalid configuration");
        return ExitCode::FAILURE;
    }

    info!(
        target: "aesdsocket",
        version = env!("CARGO_PKG_VERSION"),
        listen = %config.listen_addr,
        data_file = %config.data_file.display(),
        daemon = config.daemon,
        timestamp_interval_ms = config.timestamp_interval_ms,
        "Starting aesdsocket"
    );

    // Bind in the foreground so address errors reach the terminal
    let socket = match server::bind(config.listen_addr) {
        Ok(socket) => socket,
        Err(e) => {
            error!(target: "aesdsocket", error = %e, "Failed to bind listener");
            return ExitCode::FAILURE;
        },
    };

    #[cfg(unix)]
    {
        if config.daemon {
            if let Err(e) = aesdsocket::daemon::daemonize() {
                error!(target: "aesdsocket", error = %e, "Failed to daemonize");
                return ExitCode::FAILURE;
            }
        }
    }

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .thread_name("aesdsocket-worker")
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            error!(target: "aesdsocket", error = %e, "Failed to start async runtime");
            return ExitCode::FAILURE;
        },
    };

    let result = runtime.block_on(aesdsocket::serve(config, socket));
    runtime.shutdown_timeout(RUNTIME_SHUTDOWN_TIMEOUT);

    match result {
        Ok(report) => {
            if !report.is_clean() {
                warn!(
                    target: "aesdsocket",
                    aborted = report.aborted,
                    "Some connections were aborted during shutdown"
                );
            }
            info!(target: "aesdsocket", "aesdsocket shutdown complete");
            ExitCode::SUCCESS
        },
        Err(e) if e.is_fatal() => {
            error!(target: "aesdsocket", error = %e, "Startup failed");
            ExitCode::FAILURE
        },
        Err(e) => {
            error!(target: "aesdsocket", error = %e, "Server error");
            ExitCode::FAILURE
        },
    }
}

fn init_tracing() {
    use tracing_subscriber::{EnvFilter, fmt, prelude::*};

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,aesdsocket=debug"));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true))
        .with(filter)
        .init();
}

fn generate_config(path: &Path) -> std::io::Result<()> {
    let config = Config::default();

    let content = format!(
        r#"# aesdsocket configuration file
# Generated by: aesdsocket --gen-config {}
#
# All values shown are defaults. Uncomment and modify as needed.

# Address and port for client connections
listen_addr = "{}"

# Backing file of the shared log. Removed at startup and at clean shutdown.
data_file = "{}"

# Detach from the controlling terminal after binding
daemon = {}

# Milliseconds between injected timestamp records (0 disables them)
timestamp_interval_ms = {}

# Grace period for open connections during shutdown, in milliseconds
drain_timeout_ms = {}

# Longest wait between reaps of finished connections, in milliseconds
reap_interval_ms = {}

# Reject connections beyond this many in flight (unbounded if unset)
# max_connections = 1024
"#,
        path.display(),
        config.listen_addr,
        config.data_file.display(),
        config.daemon,
        config.timestamp_interval_ms,
        config.drain_timeout_ms,
        config.reap_interval_ms,
    );

    std::fs::write(path, content)
}
