//! Timestamp injector - periodic background appends to the shared log
//!
//! Best effort: a failed append is logged and the next cycle proceeds.

use super::{ServerContext, append_blocking};
use aesd_core::{AesdError, Result, TIMESTAMP_FORMAT};
use bytes::Bytes;
use chrono::{DateTime, Local, TimeZone};
use std::fmt::Display;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Format `now` as a timestamp record line
pub fn format_timestamp<Tz>(now: &DateTime<Tz>) -> String
where
    Tz: TimeZone,
    Tz::Offset: Display,
{
    now.format(TIMESTAMP_FORMAT).to_string()
}

/// Handle to the running injector task
pub struct TimestampInjector {
    active: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

impl TimestampInjector {
    /// Spawn the injector on the current runtime
    pub fn spawn(ctx: Arc<ServerContext>, interval: Duration) -> Self {
        let active = Arc::new(AtomicBool::new(true));
        let task_active = Arc::clone(&active);
        let handle = tokio::spawn(async move {
            run_injector(&ctx, interval, &task_active).await;
        });

        Self { active, handle }
    }

    /// Clear the active flag and wait for the task to return
    pub async fn stop(self) -> Result<()> {
        self.active.store(false, Ordering::Release);
        self.handle
            .await
            .map_err(|e| AesdError::Join(format!("timestamp injector: {e}")))
    }
}

async fn run_injector(ctx: &ServerContext, interval: Duration, active: &AtomicBool) {
    info!(
        target: "aesdsocket::timestamp",
        interval_ms = interval.as_millis(),
        "Timestamp injector started"
    );

    while active.load(Ordering::Acquire) && !ctx.shutdown.is_requested() {
        tokio::select! {
            () = tokio::time::sleep(interval) => {}
            () = ctx.shutdown.wait() => break,
        }

        if !active.load(Ordering::Acquire) || ctx.shutdown.is_requested() {
            break;
        }

        let record = format_timestamp(&Local::now());
        match append_blocking(&ctx.log, Bytes::from(record)).await {
            Ok(len) => debug!(target: "aesdsocket::timestamp", len, "Timestamp appended"),
            Err(e) => warn!(
                target: "aesdsocket::timestamp",
                error = %e,
                "Failed to append timestamp"
            ),
        }
    }

    info!(target: "aesdsocket::timestamp", "Timestamp injector stopped");
}
