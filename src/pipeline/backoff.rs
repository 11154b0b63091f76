//! Bounded exponential backoff with jitter
//!
//! Retry state is carried as data (attempt counter inside the struct), not
//! as an exception-driven loop; the coordinator's state machine owns when to
//! call `sleep` and when to give up.

use rand::Rng;
use std::time::Duration;
use tokio::time::sleep;

#[derive(Debug)]
pub struct ExponentialBackoff {
    initial_delay_ms: u64,
    max_delay_ms: u64,
    max_retries: u32,
    current_attempt: u32,
}

#[derive(Debug)]
pub struct MaxRetriesExceeded;

impl std::fmt::Display for MaxRetriesExceeded {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "maximum retry attempts exceeded")
    }
}

impl std::error::Error for MaxRetriesExceeded {}

impl ExponentialBackoff {
    pub fn new(initial_delay_ms: u64, max_delay_ms: u64, max_retries: u32) -> Self {
        Self {
            initial_delay_ms,
            max_delay_ms,
            max_retries,
            current_attempt: 0,
        }
    }

    pub fn attempt(&self) -> u32 {
        self.current_attempt
    }

    /// Delay for the current attempt: doubled each retry, capped, with up to
    /// 25% jitter so stalled sources don't retry in lockstep.
    fn next_delay(&self) -> Duration {
        let base = self
            .initial_delay_ms
            .saturating_mul(2_u64.saturating_pow(self.current_attempt))
            .min(self.max_delay_ms);
        let jitter = rand::thread_rng().gen_range(0..=base / 4 + 1);
        Duration::from_millis(base + jitter)
    }

    /// Sleep before the next retry, or report the budget exhausted.
    pub async fn sleep(&mut self) -> Result<(), MaxRetriesExceeded> {
        if self.current_attempt >= self.max_retries {
            return Err(MaxRetriesExceeded);
        }

        let delay = self.next_delay();
        log::warn!(
            "⏳ Retry attempt {} of {} in {}ms",
            self.current_attempt + 1,
            self.max_retries,
            delay.as_millis()
        );
        sleep(delay).await;
        self.current_attempt += 1;
        Ok(())
    }

    pub fn reset(&mut self) {
        self.current_attempt = 0;
    }
}
