//! Startup connectivity checks for the store and the orchestrator.

use std::fmt::Display;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum StartupError {
    #[error("{what} unreachable after {attempts} attempts: {last}")]
    GaveUp {
        what: String,
        attempts: u32,
        last: String,
    },
    #[error("Stopped while waiting for {0}")]
    Stopped(String),
}

/// Retry policy for startup probes. `attempts == 0` retries until stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectPolicy {
    pub attempts: u32,
    pub delay: Duration,
}

impl ConnectPolicy {
    pub fn from_settings(settings: &crate::config::ScannerSettings) -> Self {
        Self {
            attempts: settings.connect_attempts,
            delay: settings.connect_retry(),
        }
    }
}

/// Run `probe` until it succeeds, the attempts run out or `stop` is raised.
pub fn wait_until_ready<E: Display>(
    what: &str,
    policy: ConnectPolicy,
    stop: &AtomicBool,
    mut probe: impl FnMut() -> Result<(), E>,
) -> Result<(), StartupError> {
    let mut attempt = 0u32;
    loop {
        if stop.load(Ordering::Relaxed) {
            return Err(StartupError::Stopped(what.to_string()));
        }
        attempt = attempt.saturating_add(1);
        match probe() {
            Ok(()) => {
                if attempt > 1 {
                    info!(service = what, attempt, "Connected");
                }
                return Ok(());
            }
            Err(err) => {
                if policy.attempts != 0 && attempt >= policy.attempts {
                    return Err(StartupError::GaveUp {
                        what: what.to_string(),
                        attempts: attempt,
                        last: err.to_string(),
                    });
                }
                warn!(
                    service = what,
                    attempt,
                    error = %err,
                    retry_in_ms = policy.delay.as_millis() as u64,
                    "Not reachable yet, retrying"
                );
                thread::sleep(policy.delay);
            }
        }
    }
}
