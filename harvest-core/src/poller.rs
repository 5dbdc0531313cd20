use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use thiserror::Error;
use tokio::fs;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::debug;

use crate::config::TimingSection;

const LOG_EVERY_CHECKS: u32 = 50;

#[derive(Debug, Error)]
pub enum PollError {
    #[error("artifact {} did not appear within {waited:?}", path.display())]
    TimedOut { path: PathBuf, waited: Duration },
    #[error("failed to publish {} as {}: {source}", from.display(), to.display())]
    Publish {
        from: PathBuf,
        to: PathBuf,
        source: io::Error,
    },
}

pub type PollResult<T> = Result<T, PollError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollReport {
    pub checks: u32,
    pub waited: Duration,
}

/// Waits for a file the portal writes asynchronously.
///
/// The browser writes downloads under a temporary name and renames them into
/// place, so an entry at the watched path is a complete file. Checks are
/// tick-aligned: the first one runs one interval after the call.
#[derive(Debug, Clone)]
pub struct CompletionPoller {
    interval: Duration,
    timeout: Option<Duration>,
}

impl CompletionPoller {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval: interval.max(Duration::from_millis(1)),
            timeout: None,
        }
    }

    /// Bounds the wait. Without a timeout a missing artifact stalls forever.
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn from_config(timing: &TimingSection) -> Self {
        Self::new(timing.poll_interval()).with_timeout(timing.download_timeout())
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub async fn wait_for(&self, path: &Path) -> PollResult<PollReport> {
        let started = Instant::now();
        let mut ticker = interval_at(started + self.interval, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut checks = 0u32;
        loop {
            ticker.tick().await;
            checks += 1;
            if entry_exists(path) {
                return Ok(PollReport {
                    checks,
                    waited: started.elapsed(),
                });
            }
            let waited = started.elapsed();
            if let Some(timeout) = self.timeout {
                if waited >= timeout {
                    return Err(PollError::TimedOut {
                        path: path.to_path_buf(),
                        waited,
                    });
                }
            }
            if checks % LOG_EVERY_CHECKS == 0 {
                debug!(path = %path.display(), checks, waited_ms = waited.as_millis() as u64, "still waiting for download");
            }
        }
    }
}

fn entry_exists(path: &Path) -> bool {
    std::fs::symlink_metadata(path).is_ok()
}

/// Moves a staged artifact to its permanent name. Rename is the only step
/// that makes a file visible at `permanent`.
pub async fn publish(staging: &Path, permanent: &Path) -> PollResult<()> {
    fs::rename(staging, permanent)
        .await
        .map_err(|source| PollError::Publish {
            from: staging.to_path_buf(),
            to: permanent.to_path_buf(),
            source,
        })
}
