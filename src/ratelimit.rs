//! Token bucket rate limiter.
//!
//! Tokens are tracked in thousandths so that slow refill rates still accrue
//! between calls. Both the token count and the refill clock are atomics;
//! acquiring never takes a lock, so one bucket can be shared by every RPC
//! handler or every partition worker.

use std::sync::atomic::{AtomicU64, Ordering};

use tokio::time::{Duration, Instant};

const MILLI: u64 = 1000;

#[derive(Debug)]
pub struct TokenBucket {
    /// Capacity in milli-tokens.
    capacity: u64,
    /// Whole tokens added per second.
    rate: u64,
    origin: Instant,
    tokens: AtomicU64,
    last_refill_micros: AtomicU64,
}

impl TokenBucket {
    /// A full bucket holding `capacity` tokens, refilled at `rate` tokens/second.
    pub fn new(capacity: u64, rate: u64) -> Self {
        let capacity = capacity.max(1).saturating_mul(MILLI);
        Self {
            capacity,
            rate: rate.max(1),
            origin: Instant::now(),
            tokens: AtomicU64::new(capacity),
            last_refill_micros: AtomicU64::new(0),
        }
    }

    /// Bucket whose burst capacity equals its per-second rate.
    pub fn with_rate(tps: u64) -> Self {
        Self::new(tps, tps)
    }

    pub fn capacity(&self) -> u64 {
        self.capacity / MILLI
    }

    pub fn rate(&self) -> u64 {
        self.rate
    }

    pub fn available(&self) -> f64 {
        self.refill();
        self.tokens.load(Ordering::Acquire) as f64 / MILLI as f64
    }

    /// Take one token if one is available right now.
    pub fn try_acquire(&self) -> bool {
        self.refill();
        self.tokens
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |cur| {
                cur.checked_sub(MILLI)
            })
            .is_ok()
    }

    /// Take one token, waiting at most `max_wait` for it.
    ///
    /// Returns `false` without waiting when the next token cannot arrive
    /// before the deadline.
    pub async fn acquire_within(&self, max_wait: Duration) -> bool {
        let deadline = Instant::now() + max_wait;
        loop {
            if self.try_acquire() {
                return true;
            }
            let wait = self.until_next_token();
            if Instant::now() + wait > deadline {
                return false;
            }
            tokio::time::sleep(wait).await;
        }
    }

    /// Take one token, waiting as long as it takes.
    pub async fn acquire(&self) {
        while !self.try_acquire() {
            tokio::time::sleep(self.until_next_token()).await;
        }
    }

    fn until_next_token(&self) -> Duration {
        let have = self.tokens.load(Ordering::Acquire);
        let missing = MILLI.saturating_sub(have) as u128;
        let micros = (missing * 1000).div_ceil(self.rate as u128);
        Duration::from_micros(micros.clamp(1, u64::MAX as u128) as u64)
    }

    fn refill(&self) {
        let now = self.origin.elapsed().as_micros().min(u64::MAX as u128) as u64;
        let last = self.last_refill_micros.load(Ordering::Acquire);
        if now <= last {
            return;
        }

        let elapsed = (now - last) as u128;
        let earned = self.rate as u128 * elapsed / 1000;
        if earned == 0 {
            return;
        }
        // Only the time that paid for whole milli-tokens is consumed; the
        // remainder carries over. A full bucket forfeits it.
        let (accrued, next) = if earned >= self.capacity as u128 {
            (self.capacity as u128, now)
        } else {
            let spent = (earned * 1000).div_ceil(self.rate as u128) as u64;
            (earned, last + spent)
        };

        // Whoever moves the clock owns this refill; losers see the new tokens.
        if self
            .last_refill_micros
            .compare_exchange(last, next, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }

        let capacity = self.capacity;
        let _ = self
            .tokens
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |cur| {
                Some(cur.saturating_add(accrued as u64).min(capacity))
            });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn burst_is_bounded_by_capacity() {
        let bucket = TokenBucket::new(5, 5);
        let granted = (0..8).filter(|_| bucket.try_acquire()).count();
        assert_eq!(granted, 5);
        assert!(!bucket.try_acquire());
    }

    #[tokio::test(start_paused = true)]
    async fn refills_over_time_up_to_capacity() {
        let bucket = TokenBucket::new(5, 5);
        for _ in 0..5 {
            assert!(bucket.try_acquire());
        }

        tokio::time::advance(Duration::from_millis(400)).await;
        assert!(bucket.try_acquire());
        assert!(bucket.try_acquire());
        assert!(!bucket.try_acquire());

        tokio::time::advance(Duration::from_secs(60)).await;
        assert_eq!(bucket.available(), 5.0);
    }

    #[tokio::test(start_paused = true)]
    async fn acquire_within_gives_up_when_next_token_is_too_far() {
        let bucket = TokenBucket::new(1, 5);
        assert!(bucket.try_acquire());

        let start = Instant::now();
        assert!(!bucket.acquire_within(Duration::from_millis(100)).await);
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn acquire_within_waits_for_a_close_token() {
        let bucket = TokenBucket::new(1, 20);
        assert!(bucket.try_acquire());

        let start = Instant::now();
        assert!(bucket.acquire_within(Duration::from_millis(100)).await);
        assert!(start.elapsed() >= Duration::from_millis(50));
        assert!(start.elapsed() < Duration::from_millis(100));
    }

    #[tokio::test(start_paused = true)]
    async fn acquire_blocks_until_refilled() {
        let bucket = TokenBucket::new(1, 2);
        bucket.acquire().await;

        let start = Instant::now();
        bucket.acquire().await;
        assert!(start.elapsed() >= Duration::from_millis(500));
    }

    #[tokio::test(start_paused = true)]
    async fn frequent_refills_keep_the_fractional_remainder() {
        let bucket = TokenBucket::new(5, 1);
        for _ in 0..5 {
            assert!(bucket.try_acquire());
        }

        // 1.5 ms steps earn 1.5 milli-tokens each at 1 token/s.
        for _ in 0..2000 {
            tokio::time::advance(Duration::from_micros(1500)).await;
            bucket.available();
        }
        assert_eq!(bucket.available(), 3.0);
    }

    #[tokio::test(start_paused = true)]
    async fn steady_rate_below_refill_is_never_limited() {
        let bucket = TokenBucket::new(1, 10);
        for _ in 0..50 {
            assert!(bucket.acquire_within(Duration::ZERO).await);
            tokio::time::advance(Duration::from_millis(110)).await;
        }
    }
}
