//! Retry policies for applying replayed commands.
//!
//! A policy answers two questions for the n-th retry (1-based): may it
//! happen, and how long to wait first. Policies compose with [`All`], which
//! keeps going only while every constituent agrees.

use std::{fmt, future::Future, time::Duration};

use tracing::warn;

pub trait RetryStrategy: fmt::Debug + Send + Sync {
    fn should_retry(&self, retry: u32) -> bool;

    fn delay_for(&self, _retry: u32) -> Duration {
        Duration::ZERO
    }
}

/// Unbounded doubling delay: `initial`, `2 * initial`, ... capped at `max`.
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    pub initial_delay: Duration,
    pub max_delay: Duration,
}

impl RetryStrategy for ExponentialBackoff {
    fn should_retry(&self, _retry: u32) -> bool {
        true
    }

    fn delay_for(&self, retry: u32) -> Duration {
        let mut delay = self.initial_delay;
        for _ in 1..retry {
            delay = match delay.checked_mul(2) {
                Some(v) => v,
                None => return self.max_delay,
            };
            if delay >= self.max_delay {
                return self.max_delay;
            }
        }
        std::cmp::min(delay, self.max_delay)
    }
}

/// Allows at most `max_retries` retries after the first attempt.
#[derive(Debug, Clone, Copy)]
pub struct MaxRetries(pub u32);

impl RetryStrategy for MaxRetries {
    fn should_retry(&self, retry: u32) -> bool {
        retry <= self.0
    }
}

#[derive(Debug, Default)]
pub struct All {
    strategies: Vec<Box<dyn RetryStrategy>>,
}

impl All {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, strategy: impl RetryStrategy + 'static) -> Self {
        self.strategies.push(Box::new(strategy));
        self
    }
}

impl RetryStrategy for All {
    fn should_retry(&self, retry: u32) -> bool {
        self.strategies.iter().all(|s| s.should_retry(retry))
    }

    fn delay_for(&self, retry: u32) -> Duration {
        self.strategies
            .iter()
            .map(|s| s.delay_for(retry))
            .max()
            .unwrap_or(Duration::ZERO)
    }
}

/// The policy used by replay: exponential backoff bounded by a retry count.
pub fn replay_policy(initial_delay: Duration, max_delay: Duration, max_retries: u32) -> All {
    All::new()
        .with(ExponentialBackoff {
            initial_delay,
            max_delay,
        })
        .with(MaxRetries(max_retries))
}

#[derive(Debug)]
pub struct Attempted<T, E> {
    pub result: Result<T, E>,
    pub attempts: u32,
}

/// Run `op` until it succeeds or `policy` stops permitting retries.
///
/// `op` receives the 1-based attempt number. Failures are logged with
/// whether another attempt will follow.
pub async fn retry<S, F, Fut, T, E>(policy: &S, mut op: F) -> Attempted<T, E>
where
    S: RetryStrategy + ?Sized,
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: fmt::Display,
{
    let mut attempt = 1;
    loop {
        match op(attempt).await {
            Ok(v) => {
                return Attempted {
                    result: Ok(v),
                    attempts: attempt,
                };
            }
            Err(err) => {
                let will_retry = policy.should_retry(attempt);
                warn!(attempt, will_retry, error = %err, "attempt failed");
                if !will_retry {
                    return Attempted {
                        result: Err(err),
                        attempts: attempt,
                    };
                }
                tokio::time::sleep(policy.delay_for(attempt)).await;
                attempt += 1;
            }
        }
    }
}
