//! Cooperative cancellation and I/O throughput limiting.

use crate::error::{Error, Result};
use std::io::{self, Read};
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

/// Clonable flag checked between chunks by hashing, packing and extraction.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation. Every clone observes it.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Fail with [`Error::Cancelled`] once cancellation was requested.
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(Error::Cancelled)
        } else {
            Ok(())
        }
    }
}

#[derive(Debug)]
struct Bucket {
    available: f64,
    last_refill: Instant,
}

/// Token bucket shared by all workers of a pool.
///
/// A rate of zero disables limiting.
#[derive(Debug)]
pub struct ThroughputLimiter {
    bytes_per_sec: u64,
    bucket: Mutex<Bucket>,
}

impl ThroughputLimiter {
    pub fn new(bytes_per_sec: u64) -> Self {
        Self {
            bytes_per_sec,
            bucket: Mutex::new(Bucket {
                available: bytes_per_sec as f64,
                last_refill: Instant::now(),
            }),
        }
    }

    pub fn unlimited() -> Self {
        Self::new(0)
    }

    pub fn is_unlimited(&self) -> bool {
        self.bytes_per_sec == 0
    }

    /// Block until `bytes` may be transferred.
    ///
    /// Requests larger than one second of budget are admitted once the bucket
    /// is full, driving it negative so later callers wait proportionally.
    pub fn acquire(&self, bytes: u64) -> Result<()> {
        if self.is_unlimited() || bytes == 0 {
            return Ok(());
        }
        let rate = self.bytes_per_sec as f64;
        let wanted = bytes as f64;
        loop {
            let wait = {
                let mut bucket = self.bucket.lock()?;
                let now = Instant::now();
                let elapsed = now.duration_since(bucket.last_refill).as_secs_f64();
                bucket.available = (bucket.available + elapsed * rate).min(rate);
                bucket.last_refill = now;

                if bucket.available >= wanted.min(rate) {
                    bucket.available -= wanted;
                    return Ok(());
                }
                (wanted.min(rate) - bucket.available) / rate
            };
            std::thread::sleep(Duration::from_secs_f64(wait));
        }
    }
}

/// Reader that charges every read against a [`ThroughputLimiter`].
pub struct ThrottledReader<'a, R> {
    inner: R,
    limiter: &'a ThroughputLimiter,
}

impl<'a, R: Read> ThrottledReader<'a, R> {
    pub fn new(inner: R, limiter: &'a ThroughputLimiter) -> Self {
        Self { inner, limiter }
    }
}

impl<R: Read> Read for ThrottledReader<'_, R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.limiter.acquire(n as u64).map_err(io::Error::other)?;
        Ok(n)
    }
}
