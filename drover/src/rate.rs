//! `GlobalRate` limiting for phases.
//!
//! A [`RateLimiter`] is a token bucket shared by every instance of one actor
//! block in one phase, so `GlobalRate = "100 per 1 second"` with `Threads = 10`
//! caps the ten instances together at 100 iterations per second.
//!
//! Tokens live in a [`tokio::sync::Semaphore`]. Instead of a governor task the
//! bucket is refilled lazily by whoever tries to acquire: the time since the
//! last refill is turned into whole tokens and the remainder is carried over
//! to the next refill.
//!
//! ```text
//! add_f = rate_per_second * elapsed_seconds
//! add_total = floor(add_f + fractional)
//! fractional = (add_f + fractional) - add_total
//! ```
//!
//! The bucket holds at most one interval's worth of tokens (`count`) and starts
//! full, so a phase may burst up to `count` iterations before the rate applies.

use std::time::Duration;

use parking_lot::Mutex;
use tokio::{sync::Semaphore, time::Instant};

use crate::config::RateSpec;

/// The semaphore implementation uses 3 bits of usize for flags.
/// Any value greater than this will be capped to avoid crashing
/// the whole thing.
const MAX_TOKENS: usize = usize::MAX >> 3;

#[derive(Debug)]
struct Refill {
    last: Instant,
    fractional: f64,
}

#[derive(Debug)]
pub struct RateLimiter {
    spec: RateSpec,
    capacity: usize,
    tokens: Semaphore,
    refill: Mutex<Refill>,
}

impl RateLimiter {
    pub fn new(spec: RateSpec) -> Self {
        let capacity = usize::try_from(spec.count)
            .unwrap_or(MAX_TOKENS)
            .min(MAX_TOKENS);
        Self {
            spec,
            capacity,
            tokens: Semaphore::new(capacity),
            refill: Mutex::new(Refill {
                last: Instant::now(),
                fractional: 0.0,
            }),
        }
    }

    pub fn spec(&self) -> RateSpec {
        self.spec
    }

    /// Waits until one token can be taken from the bucket.
    pub async fn acquire(&self) {
        loop {
            self.refill();
            match self.tokens.try_acquire() {
                Ok(permit) => {
                    // Tokens are only ever added back by refill.
                    permit.forget();
                    return;
                }
                Err(_) => tokio::time::sleep(self.token_interval()).await,
            }
        }
    }

    /// Time it takes for one token to accumulate.
    fn token_interval(&self) -> Duration {
        self.spec.interval.div_f64(self.spec.count as f64)
    }

    fn refill(&self) {
        let mut refill = self.refill.lock();
        let now = Instant::now();
        let (add_total, fractional) = calc_refill(
            now.duration_since(refill.last),
            self.spec.per_second(),
            refill.fractional,
        );
        refill.last = now;
        refill.fractional = fractional;

        let avail = self.tokens.available_permits();
        if add_total > 0 && avail < self.capacity {
            let add = add_total.min(self.capacity - avail);
            self.tokens.add_permits(add);
        }
    }
}

/// Pure function computing how many whole tokens `elapsed` is worth at `rate`
/// tokens per second, carrying the fractional part.
///
/// Returns `(tokens_to_add, next_fractional_part)`.
pub fn calc_refill(elapsed: Duration, rate: f64, fractional: f64) -> (usize, f64) {
    let add_f = rate * elapsed.as_secs_f64();

    let add_total_f = (add_f + fractional).floor();
    let fractional = (add_f + fractional) - add_total_f;

    // Saturate at the semaphore's hard limit.
    let add_total = if add_total_f >= (MAX_TOKENS as f64) {
        MAX_TOKENS
    } else if add_total_f < 0.0 {
        0
    } else {
        add_total_f as usize
    };

    (add_total, fractional)
}
