//! File-backed configuration sources
//!
//! A source reads the broker configuration file and invokes registered
//! callbacks with every newly parsed snapshot, starting with the contents at
//! startup. The watcher flavor polls the file content on a short fixed
//! interval; the poller flavor uses a caller-supplied period. Both compare
//! raw content so an untouched file never re-fires callbacks, and both keep
//! the previous snapshot when a parse fails.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use super::BrokerConfig;
use crate::error::{BrokerError, Result};

/// Fixed interval for the watcher flavor.
const WATCH_INTERVAL: Duration = Duration::from_secs(1);

/// Callback invoked with each new configuration snapshot.
pub type ConfigCallback = Arc<dyn Fn(&BrokerConfig) + Send + Sync>;

/// A polling file source for broker configuration.
pub struct FileConfigSource {
    path: PathBuf,
    period: Duration,
    callbacks: Vec<ConfigCallback>,
}

impl FileConfigSource {
    /// Watcher flavor: short fixed interval, reacts quickly to edits.
    pub fn watcher(path: impl Into<PathBuf>) -> Self {
        Self::poller(path, WATCH_INTERVAL)
    }

    /// Poller flavor: caller-supplied polling period.
    pub fn poller(path: impl Into<PathBuf>, period: Duration) -> Self {
        Self {
            path: path.into(),
            period,
            callbacks: Vec::new(),
        }
    }

    /// Register a callback. Callbacks run in registration order on the
    /// source's task.
    pub fn add_callback(&mut self, callback: ConfigCallback) {
        self.callbacks.push(callback);
    }

    /// Read, parse and fan out the initial snapshot, then keep polling until
    /// the token is cancelled. The polling loop runs on its own task.
    pub async fn start(self, ctx: CancellationToken) -> Result<()> {
        let path = self.path.clone();
        let mut last = match tokio::fs::read(&path).await {
            Ok(content) => {
                fan_out(&path, &content, &self.callbacks);
                Some(content)
            }
            Err(e) => {
                return Err(BrokerError::Config(format!(
                    "could not read configuration from {}: {e}",
                    path.display()
                )))
            }
        };

        info!(path = %path.display(), period_ms = self.period.as_millis() as u64,
            "watching broker configuration");

        let callbacks = self.callbacks;
        let period = self.period;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ctx.cancelled() => {
                        debug!(path = %path.display(), "configuration source stopped");
                        return;
                    }
                    _ = ticker.tick() => {}
                }

                match tokio::fs::read(&path).await {
                    Ok(content) => {
                        if last.as_deref() == Some(content.as_slice()) {
                            continue;
                        }
                        fan_out(&path, &content, &callbacks);
                        last = Some(content);
                    }
                    Err(e) => {
                        // Transient: the file may be mid-replace (e.g. atomic
                        // rename). Keep the previous snapshot.
                        debug!(path = %path.display(), error = %e, "configuration read failed");
                    }
                }
            }
        });

        Ok(())
    }
}

fn fan_out(path: &Path, content: &[u8], callbacks: &[ConfigCallback]) {
    if content.is_empty() {
        // Discard events that do not inform content.
        debug!(path = %path.display(), "ignoring empty configuration contents");
        return;
    }

    let text = match std::str::from_utf8(content) {
        Ok(t) => t,
        Err(e) => {
            error!(path = %path.display(), error = %e, "configuration is not valid UTF-8");
            return;
        }
    };

    match super::parse(text) {
        Ok(config) => {
            info!(path = %path.display(), triggers = config.triggers.len(),
                "applying configuration snapshot");
            for callback in callbacks {
                callback(&config);
            }
        }
        Err(e) => {
            error!(path = %path.display(), error = %e, "error parsing config");
        }
    }
}
