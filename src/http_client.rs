//! HTTP plumbing for the orchestrator API: one shared agent, retries for
//! transient failures and size-capped response bodies.

use std::fmt::Display;
use std::io::{self, Read};
use std::sync::OnceLock;
use std::time::Duration;

use tracing::debug;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const IO_TIMEOUT: Duration = Duration::from_secs(30);
const USER_AGENT: &str = concat!("lagopus/", env!("CARGO_PKG_VERSION"));

/// How often and how patiently a request is retried.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Attempts including the first one; values below 1 behave as 1.
    pub attempts: usize,
    /// Delay after the first failure, doubled after each further one.
    pub first_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::with_attempts(3)
    }
}

impl RetryPolicy {
    pub fn with_attempts(attempts: usize) -> Self {
        Self {
            attempts,
            first_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(5),
        }
    }

    /// Retries without sleeping.
    pub fn immediate(attempts: usize) -> Self {
        Self {
            attempts,
            first_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        }
    }

    fn delay_after(&self, failures: usize) -> Duration {
        let shift = u32::try_from(failures.saturating_sub(1)).unwrap_or(u32::MAX);
        let factor = 1u32.checked_shl(shift).unwrap_or(u32::MAX);
        self.first_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

pub(crate) fn shared_agent() -> &'static ureq::Agent {
    static AGENT: OnceLock<ureq::Agent> = OnceLock::new();
    AGENT.get_or_init(|| {
        ureq::AgentBuilder::new()
            .user_agent(USER_AGENT)
            .timeout_connect(CONNECT_TIMEOUT)
            .timeout_read(IO_TIMEOUT)
            .timeout_write(IO_TIMEOUT)
            .build()
    })
}

/// Run `op` until it succeeds, fails permanently or the policy is exhausted.
pub fn with_retries<T, E: Display>(
    policy: RetryPolicy,
    what: &str,
    mut op: impl FnMut() -> Result<T, E>,
    is_transient: impl Fn(&E) -> bool,
) -> Result<T, E> {
    let mut failures = 0usize;
    loop {
        let err = match op() {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };
        failures += 1;
        if failures >= policy.attempts.max(1) || !is_transient(&err) {
            return Err(err);
        }
        let delay = policy.delay_after(failures);
        debug!(
            request = what,
            failures,
            delay_ms = delay.as_millis() as u64,
            error = %err,
            "Retrying request"
        );
        std::thread::sleep(delay);
    }
}

/// Read a whole response body, refusing anything larger than `limit` bytes.
pub(crate) fn read_bounded(response: ureq::Response, limit: usize) -> io::Result<Vec<u8>> {
    let declared = response
        .header("Content-Length")
        .and_then(|value| value.parse::<u64>().ok());
    if let Some(length) = declared
        && length > limit as u64
    {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("Response declares {length} bytes, limit is {limit}"),
        ));
    }
    let mut body = Vec::new();
    response
        .into_reader()
        .take(limit as u64 + 1)
        .read_to_end(&mut body)?;
    if body.len() > limit {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("Response body exceeds {limit} bytes"),
        ));
    }
    Ok(body)
}
