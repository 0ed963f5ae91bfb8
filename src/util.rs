//! Miscellaneous utilities for uzoned.

use std::io::{self, Write};
use std::sync::Mutex;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use camino::Utf8Path;

/// Atomically write a file.
///
/// The contents are written to a temporary file in the target directory and
/// renamed over the destination, so readers never observe a partial file.
pub fn write_file(path: &Utf8Path, contents: &[u8]) -> io::Result<()> {
    let dir = path.parent().unwrap_or(Utf8Path::new("."));
    let mut tmp_file = tempfile::Builder::new().tempfile_in(dir)?;
    tmp_file.as_file_mut().write_all(contents)?;
    tmp_file.persist(path)?;
    Ok(())
}

/// The current Unix time, truncated to 32 bits like every expiry in the
/// stores and signatures.
pub fn unix_now() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as u32)
        .unwrap_or(0)
}

/// Render a 32-bit Unix time the way the TXT metadata records expect it,
/// e.g. `2026-08-01 12:34:56 +0000 UTC`.
pub fn format_unix_utc(secs: u32) -> String {
    let ts = jiff::Timestamp::from_second(i64::from(secs)).unwrap_or(jiff::Timestamp::UNIX_EPOCH);
    format!("{} +0000 UTC", ts.strftime("%Y-%m-%d %H:%M:%S"))
}

//------------ RateLimiter ---------------------------------------------------

/// A token bucket with `allow()` semantics.
///
/// `rate` tokens are replenished per second up to `burst`. `allow` never
/// blocks; callers that are refused turn the refusal into a response code.
#[derive(Debug)]
pub struct RateLimiter {
    rate: f64,
    burst: f64,
    state: Mutex<BucketState>,
}

#[derive(Debug)]
struct BucketState {
    tokens: f64,
    last: Instant,
}

impl RateLimiter {
    pub fn new(rate: u32, burst: u32) -> Self {
        Self {
            rate: f64::from(rate),
            burst: f64::from(burst),
            state: Mutex::new(BucketState {
                tokens: f64::from(burst),
                last: Instant::now(),
            }),
        }
    }

    /// Take one token if available.
    pub fn allow(&self) -> bool {
        let mut state = self.state.lock().unwrap();
        let now = Instant::now();
        let elapsed = now.duration_since(state.last).as_secs_f64();
        state.tokens = (state.tokens + elapsed * self.rate).min(self.burst);
        state.last = now;
        if state.tokens >= 1.0 {
            state.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn limiter_burst_then_refuse() {
        let limiter = RateLimiter::new(10, 3);
        assert!(limiter.allow());
        assert!(limiter.allow());
        assert!(limiter.allow());
        assert!(!limiter.allow());
    }

    #[test]
    fn format_epoch() {
        assert_eq!(format_unix_utc(0), "1970-01-01 00:00:00 +0000 UTC");
    }

    #[test]
    fn write_file_replaces_contents() {
        let dir = tempfile::tempdir().unwrap();
        let path = Utf8Path::from_path(dir.path()).unwrap().join("data.json");
        write_file(&path, b"one").unwrap();
        write_file(&path, b"two").unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"two");
    }
}
