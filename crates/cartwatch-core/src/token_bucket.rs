//! Token-bucket intake rate limiter.
//!
//! Caps how fast the orchestrator pulls events from the broker while
//! allowing short bursts up to the bucket capacity. Lazy timestamp-based
//! refill: no background task, and tests drive the clock explicitly.

/// A token bucket over an injected millisecond clock.
#[derive(Debug, Clone)]
pub struct TokenBucket {
    /// Maximum tokens the bucket can hold.
    capacity: f64,
    /// Tokens added per second.
    refill_rate: f64,
    /// Current available tokens.
    tokens: f64,
    /// Last refill timestamp (milliseconds).
    last_refill_ms: u64,
    /// Total events admitted.
    total_admitted: u64,
    /// Total poll denials.
    total_denied: u64,
}

impl TokenBucket {
    /// Create a bucket admitting `events_per_sec` on average, with a burst
    /// capacity of one second's worth of events. Starts full.
    ///
    /// # Panics
    ///
    /// Panics if `events_per_sec` is zero.
    #[must_use]
    pub fn per_second(events_per_sec: u32, now_ms: u64) -> Self {
        assert!(events_per_sec > 0, "events_per_sec must be positive");
        let rate = f64::from(events_per_sec);
        Self {
            capacity: rate,
            refill_rate: rate,
            tokens: rate,
            last_refill_ms: now_ms,
            total_admitted: 0,
            total_denied: 0,
        }
    }

    fn refill(&mut self, now_ms: u64) {
        if now_ms <= self.last_refill_ms {
            return;
        }
        let elapsed_secs = (now_ms - self.last_refill_ms) as f64 / 1000.0;
        self.tokens = (self.tokens + elapsed_secs * self.refill_rate).min(self.capacity);
        self.last_refill_ms = now_ms;
    }

    /// Try to admit `count` events. Non-blocking.
    pub fn try_acquire(&mut self, count: u32, now_ms: u64) -> bool {
        self.refill(now_ms);
        let cost = f64::from(count);
        if self.tokens >= cost {
            self.tokens -= cost;
            self.total_admitted += u64::from(count);
            true
        } else {
            self.total_denied += 1;
            false
        }
    }

    /// Milliseconds until `count` tokens will be available.
    #[must_use]
    pub fn wait_time_ms(&mut self, count: u32, now_ms: u64) -> u64 {
        self.refill(now_ms);
        let deficit = f64::from(count) - self.tokens;
        if deficit <= 0.0 {
            return 0;
        }
        (deficit / self.refill_rate * 1000.0).ceil() as u64
    }

    /// Total events admitted so far.
    #[must_use]
    pub fn total_admitted(&self) -> u64 {
        self.total_admitted
    }

    /// Total denials so far.
    #[must_use]
    pub fn total_denied(&self) -> u64 {
        self.total_denied
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_bucket_admits_burst() {
        let mut b = TokenBucket::per_second(10, 0);
        assert!(b.try_acquire(10, 0));
        assert!(!b.try_acquire(1, 0));
        assert_eq!(b.total_admitted(), 10);
        assert_eq!(b.total_denied(), 1);
    }

    #[test]
    fn refills_over_time() {
        let mut b = TokenBucket::per_second(10, 0);
        assert!(b.try_acquire(10, 0));
        // 500ms later → 5 tokens.
        assert!(b.try_acquire(5, 500));
        assert!(!b.try_acquire(1, 500));
    }

    #[test]
    fn refill_caps_at_capacity() {
        let mut b = TokenBucket::per_second(5, 0);
        b.try_acquire(5, 0);
        // 10 seconds would generate 50 tokens, but the cap is 5.
        assert!(b.try_acquire(5, 10_000));
        assert!(!b.try_acquire(1, 10_000));
    }

    #[test]
    fn wait_time_reflects_deficit() {
        let mut b = TokenBucket::per_second(10, 0);
        b.try_acquire(10, 0);
        // Empty; one token arrives every 100ms.
        assert_eq!(b.wait_time_ms(1, 0), 100);
        assert_eq!(b.wait_time_ms(5, 0), 500);
        assert_eq!(b.wait_time_ms(1, 100), 0);
    }

    #[test]
    fn clock_going_backwards_is_ignored() {
        let mut b = TokenBucket::per_second(10, 1000);
        b.try_acquire(10, 1000);
        assert!(!b.try_acquire(1, 500));
    }
}
