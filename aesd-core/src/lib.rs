#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

mod error;

pub use error::{AesdError, Result};

/// End-of-record marker on the wire
pub const DELIMITER: u8 = b'\n';

pub const DEFAULT_PORT: u16 = 9000;
pub const DEFAULT_DATA_FILE: &str = "/var/tmp/aesdsocketdata";

/// Size of the per-connection receive buffer
pub const TRANSFER_BUFFER_SIZE: usize = 1024;

pub const DEFAULT_TIMESTAMP_INTERVAL_SECS: u64 = 10;

/// `strftime` layout of an injected timestamp record (RFC 2822 date)
pub const TIMESTAMP_FORMAT: &str = "timestamp:%a, %d %b %Y %H:%M:%S %z\n";

pub const LISTEN_BACKLOG: u32 = 10;

/// Returns true if `data` contains a record delimiter
#[inline]
#[must_use]
pub fn contains_delimiter(data: &[u8]) -> bool {
    data.contains(&DELIMITER)
}
