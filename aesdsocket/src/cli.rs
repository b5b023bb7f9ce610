use crate::shutdown::DRAIN_TIMEOUT;
use aesd_core::{DEFAULT_DATA_FILE, DEFAULT_TIMESTAMP_INTERVAL_SECS};
use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;

#[derive(Parser, Debug, Clone)]
#[command(name = "aesdsocket")]
#[command(about = "Line-oriented TCP log server with periodic timestamps")]
#[command(version)]
pub struct Args {
    /// Detach from the controlling terminal after binding
    #[arg(short = 'd', long)]
    pub daemon: bool,

    #[arg(short, long, default_value = "0.0.0.0:9000")]
    pub listen: SocketAddr,

    /// Backing file of the shared log, removed at startup and shutdown
    #[arg(long, default_value = DEFAULT_DATA_FILE)]
    pub data_file: PathBuf,

    /// Seconds between timestamp records (0 disables them)
    #[arg(long, default_value_t = DEFAULT_TIMESTAMP_INTERVAL_SECS)]
    pub timestamp_interval_secs: u64,

    /// Grace period for open connections during shutdown
    #[arg(long, default_value_t = DRAIN_TIMEOUT.as_secs())]
    pub drain_timeout_secs: u64,

    /// Reject connections beyond this many in flight
    #[arg(long)]
    pub max_connections: Option<usize>,

    #[arg(short, long)]
    pub config: Option<PathBuf>,

    #[arg(long, value_name = "PATH")]
    pub gen_config: Option<PathBuf>,
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let args = Args::try_parse_from(["aesdsocket"]).unwrap();
        assert!(!args.daemon);
        assert_eq!(args.listen.port(), 9000);
        assert_eq!(args.data_file, PathBuf::from("/var/tmp/aesdsocketdata"));
        assert_eq!(args.timestamp_interval_secs, 10);
        assert_eq!(args.drain_timeout_secs, 5);
        assert!(args.max_connections.is_none());
        assert!(args.config.is_none());
    }

    #[test]
    fn test_daemon_short_flag() {
        let args = Args::try_parse_from(["aesdsocket", "-d"]).unwrap();
        assert!(args.daemon);
    }

    #[test]
    fn test_overrides() {
        let args = Args::try_parse_from([
            "aesdsocket",
            "--listen",
            "127.0.0.1:9100",
            "--data-file",
            "/tmp/log",
            "--timestamp-interval-secs",
            "0",
            "--max-connections",
            "32",
        ])
        .unwrap();
        assert_eq!(args.listen.port(), 9100);
        assert_eq!(args.data_file, PathBuf::from("/tmp/log"));
        assert_eq!(args.timestamp_interval_secs, 0);
        assert_eq!(args.max_connections, Some(32));
    }

    #[test]
    fn test_rejects_bad_listen_addr() {
        assert!(Args::try_parse_from(["aesdsocket", "--listen", "nowhere"]).is_err());
    }
}
