#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]

mod shared_log;

pub use shared_log::SharedLog;
