//! Channel health monitor.
//!
//! The engine occasionally fails to emit `close` for a channel that has
//! already transitioned to the closed state. Without reconciliation, a
//! relay's routing tables would keep referencing dead channels. The
//! monitor periodically reads each watched channel's reported state and
//! fires the registered cleanup when it finds `Closed` without the close
//! handler having run.
//!
//! The cleanup is invoked at most once by the monitor and must itself be
//! idempotent: the ordinary close event and the periodic scan may race.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::debug;

use crate::engine::{ChannelState, DataChannel};

/// Scan interval for detecting channels that closed without an event.
pub const CHANNEL_CLOSED_TIMEOUT: Duration = Duration::from_secs(5);

/// Watches a single channel until it is cleaned up or the monitor is
/// stopped.
pub struct ChannelMonitor {
    task: JoinHandle<()>,
}

impl ChannelMonitor {
    /// Start watching `channel`, firing `cleanup` once if its state is
    /// found `Closed` while the monitor is still scheduled.
    pub fn watch<F>(channel: Arc<dyn DataChannel>, cleanup: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Self::watch_every(CHANNEL_CLOSED_TIMEOUT, channel, cleanup)
    }

    /// Same as [`watch`](Self::watch) with an explicit period.
    pub fn watch_every<F>(period: Duration, channel: Arc<dyn DataChannel>, cleanup: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        let task = tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.tick().await; // immediate first tick
            let mut cleanup = Some(cleanup);
            loop {
                if channel.state() == ChannelState::Closed {
                    debug!(label = channel.label(), "reclaiming silently closed channel");
                    if let Some(cleanup) = cleanup.take() {
                        cleanup();
                    }
                    return;
                }
                interval.tick().await;
            }
        });
        Self { task }
    }

    /// Unschedule the monitor. Safe to call after the cleanup has fired.
    pub fn stop(&self) {
        self.task.abort();
    }
}

impl Drop for ChannelMonitor {
    fn drop(&mut self) {
        self.task.abort();
    }
}
