//! Token-bucket rate limiting for byte pacing and submission pacing.
//!
//! One [`RateLimiter`] instance is shared behind an `Arc`: the generic HTTP
//! engine acquires a token per byte before writing each chunk, and the
//! scheduler may acquire one token per submission to space out claim bursts.
//! Refill is lazy on access; there is no background timer task.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use tracing::debug;

/// Internal bucket state, updated lazily under the lock.
#[derive(Debug)]
struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

/// Token-bucket throttle with lazy refill.
///
/// `capacity` bounds the burst size; `refill_rate` is tokens per second.
/// Thread-safe through one internal lock; the lock is never held across an
/// await point.
#[derive(Debug)]
pub struct RateLimiter {
    capacity: f64,
    refill_rate: f64,
    bucket: Mutex<Bucket>,
}

impl RateLimiter {
    /// Creates a limiter with the given burst capacity and refill rate.
    ///
    /// Rates are clamped to a small positive floor so a zero never divides
    /// a wait computation.
    #[must_use]
    pub fn new(capacity: u64, refill_rate: f64) -> Self {
        let capacity = (capacity.max(1)) as f64;
        let refill_rate = refill_rate.max(f64::EPSILON);
        Self {
            capacity,
            refill_rate,
            bucket: Mutex::new(Bucket {
                tokens: capacity,
                last_refill: Instant::now(),
            }),
        }
    }

    /// Builds a byte-pacing limiter from a bytes-per-second budget.
    ///
    /// The bucket holds one second of budget so short bursts are absorbed
    /// without stalling every chunk.
    #[must_use]
    pub fn per_second(bytes_per_second: u64) -> Self {
        Self::new(bytes_per_second, bytes_per_second.max(1) as f64)
    }

    /// Returns the configured refill rate in tokens per second.
    #[must_use]
    pub fn refill_rate(&self) -> f64 {
        self.refill_rate
    }

    /// Attempts to take `n` tokens without waiting.
    ///
    /// Returns `true` and deducts the tokens when at least `n` are present
    /// after a lazy refill; returns `false` otherwise.
    pub fn try_acquire(&self, n: u64) -> bool {
        let n = n as f64;
        let mut bucket = self.lock();
        self.refill(&mut bucket);
        if bucket.tokens >= n {
            bucket.tokens -= n;
            true
        } else {
            false
        }
    }

    /// Waits until `n` tokens accumulate, then deducts them.
    ///
    /// Requests larger than the bucket capacity are satisfied by draining
    /// the bucket in capacity-sized slices, so a single oversized chunk
    /// cannot deadlock the caller.
    pub async fn acquire(&self, n: u64) {
        let mut remaining = n as f64;
        while remaining > 0.0 {
            let slice = remaining.min(self.capacity);
            loop {
                let wait = {
                    let mut bucket = self.lock();
                    self.refill(&mut bucket);
                    if bucket.tokens >= slice {
                        bucket.tokens -= slice;
                        None
                    } else {
                        let deficit = slice - bucket.tokens;
                        Some(Duration::from_secs_f64(deficit / self.refill_rate))
                    }
                };
                match wait {
                    None => break,
                    Some(delay) => {
                        debug!(delay_ms = delay.as_millis() as u64, "rate limit wait");
                        tokio::time::sleep(delay.min(Duration::from_millis(250))).await;
                    }
                }
            }
            remaining -= slice;
        }
    }

    fn refill(&self, bucket: &mut Bucket) {
        let now = Instant::now();
        let elapsed = now.duration_since(bucket.last_refill).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * self.refill_rate).min(self.capacity);
        bucket.last_refill = now;
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Bucket> {
        match self.bucket.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// Parses a rate-limit string (`5M`, `500K`, `1.5M`, `2048`) into bytes/sec.
///
/// The bare number is bytes; suffixes are binary multiples K/M/G/T.
/// Returns `None` for anything that does not match `^\d+(\.\d+)?[KMGT]?$`
/// or evaluates to zero.
#[must_use]
pub fn parse_rate_limit(value: &str) -> Option<u64> {
    let value = value.trim();
    let (digits, multiplier) = match value.chars().last()? {
        'K' | 'k' => (&value[..value.len() - 1], 1024_f64),
        'M' | 'm' => (&value[..value.len() - 1], 1024_f64 * 1024.0),
        'G' | 'g' => (&value[..value.len() - 1], 1024_f64 * 1024.0 * 1024.0),
        'T' | 't' => (&value[..value.len() - 1], 1024_f64 * 1024.0 * 1024.0 * 1024.0),
        c if c.is_ascii_digit() => (value, 1.0),
        _ => return None,
    };
    if digits.is_empty()
        || !digits.chars().all(|c| c.is_ascii_digit() || c == '.')
        || digits.matches('.').count() > 1
        || digits.starts_with('.')
        || digits.ends_with('.')
    {
        return None;
    }
    let parsed: f64 = digits.parse().ok()?;
    let bytes = parsed * multiplier;
    if bytes < 1.0 || !bytes.is_finite() {
        return None;
    }
    Some(bytes as u64)
}
