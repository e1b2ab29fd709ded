//! Retry Discipline
//! ================
//! Exponential-backoff retry for filesystem operations, with an errno-based
//! transient/permanent classifier shared by the quarantine store.
//!
//! Copyright © 2025 Stephen Bilodeau. All rights reserved.
//! Licensed under GPL-3.0.

use std::io;
use std::time::Duration;

use rand::Rng;
use tracing::{debug, warn};

/// Whether an I/O failure is worth retrying.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoClass {
    Transient,
    Permanent,
}

/// Classify an I/O error by errno. Unknown codes are treated as permanent so
/// a retry loop never spins on an error it does not understand.
pub fn classify(err: &io::Error) -> IoClass {
    if let Some(code) = err.raw_os_error() {
        return match code {
            libc::EAGAIN | libc::EBUSY | libc::EINTR | libc::ETXTBSY
            | libc::ECONNREFUSED | libc::ETIMEDOUT => IoClass::Transient,
            libc::ENOENT | libc::EACCES | libc::ENOSPC | libc::EROFS => IoClass::Permanent,
            _ => IoClass::Permanent,
        };
    }
    match err.kind() {
        io::ErrorKind::WouldBlock
        | io::ErrorKind::Interrupted
        | io::ErrorKind::TimedOut
        | io::ErrorKind::ConnectionRefused => IoClass::Transient,
        _ => IoClass::Permanent,
    }
}

/// Exponential backoff with jitter. Defaults: 200 ms initial, 2x multiplier,
/// 5 s cap, 10 % jitter, 3 attempts.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub initial_delay: Duration,
    pub multiplier: f64,
    pub max_delay: Duration,
    pub jitter: f64,
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(200),
            multiplier: 2.0,
            max_delay: Duration::from_secs(5),
            jitter: 0.1,
            max_attempts: 3,
        }
    }
}

impl RetryPolicy {
    /// Run `op` until it succeeds, the error is permanent, or attempts run
    /// out. The last error is returned unchanged.
    pub fn execute<T, F>(&self, what: &str, mut op: F) -> io::Result<T>
    where
        F: FnMut() -> io::Result<T>,
    {
        let mut delay = self.initial_delay;
        let mut attempt = 1;
        loop {
            match op() {
                Ok(value) => return Ok(value),
                Err(err) => {
                    if classify(&err) == IoClass::Permanent || attempt >= self.max_attempts {
                        if attempt > 1 {
                            warn!(what, attempt, error = %err, "giving up after retries");
                        }
                        return Err(err);
                    }
                    debug!(what, attempt, error = %err, delay_ms = delay.as_millis() as u64, "transient failure, retrying");
                    std::thread::sleep(self.jittered(delay));
                    delay = Duration::from_secs_f64(
                        (delay.as_secs_f64() * self.multiplier).min(self.max_delay.as_secs_f64()),
                    );
                    attempt += 1;
                }
            }
        }
    }

    fn jittered(&self, delay: Duration) -> Duration {
        if self.jitter <= 0.0 {
            return delay;
        }
        let spread = rand::thread_rng().gen_range(-self.jitter..=self.jitter);
        Duration::from_secs_f64((delay.as_secs_f64() * (1.0 + spread)).max(0.0))
    }
}

/// Retry `op` once per entry in `delays`, sleeping the entry's duration
/// before each retry. Used for the quarantine payload-cleanup schedule
/// (100 / 200 / 400 ms), where every failure is retried regardless of class
/// because the alternative is an orphaned payload.
pub fn retry_with_schedule<T, F>(what: &str, delays: &[Duration], mut op: F) -> io::Result<T>
where
    F: FnMut() -> io::Result<T>,
{
    let mut last_err = match op() {
        Ok(value) => return Ok(value),
        Err(err) => err,
    };
    for (i, delay) in delays.iter().enumerate() {
        debug!(what, retry = i + 1, error = %last_err, "retrying after failure");
        std::thread::sleep(*delay);
        match op() {
            Ok(value) => return Ok(value),
            Err(err) => last_err = err,
        }
    }
    warn!(what, error = %last_err, "all retries exhausted");
    Err(last_err)
}
