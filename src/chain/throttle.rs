//! Global request throttle for outbound JSON-RPC calls
//!
//! Calls run strictly one at a time. A task that hits a rate limit keeps its
//! place at the front of the line and is retried with exponential backoff.

use crate::config::RpcConfig;
use crate::error::ProviderError;

use backoff::backoff::Backoff;
use backoff::{ExponentialBackoff, ExponentialBackoffBuilder};
use std::future::Future;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Exponential backoff that gives up after a fixed number of retries.
#[derive(Debug)]
pub struct ExponentialWithMaxRetryCount {
    inner: ExponentialBackoff,
    max_retry_count: u32,
    count: u32,
}

impl ExponentialWithMaxRetryCount {
    pub fn new(initial: Duration, max_interval: Duration, max_retry_count: u32) -> Self {
        let inner = ExponentialBackoffBuilder::new()
            .with_initial_interval(initial)
            .with_multiplier(2.0)
            .with_randomization_factor(0.0)
            .with_max_interval(max_interval)
            .with_max_elapsed_time(None)
            .build();
        Self {
            inner,
            max_retry_count,
            count: 0,
        }
    }
}

impl Backoff for ExponentialWithMaxRetryCount {
    fn next_backoff(&mut self) -> Option<Duration> {
        if self.count >= self.max_retry_count {
            return None;
        }
        self.count += 1;
        self.inner.next_backoff()
    }

    fn reset(&mut self) {
        self.count = 0;
        self.inner.reset();
    }
}

#[derive(Debug, Clone)]
pub struct ThrottleSettings {
    pub spacing: Duration,
    pub rate_limit_retries: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub cooldown_after_retry: Duration,
}

impl From<&RpcConfig> for ThrottleSettings {
    fn from(config: &RpcConfig) -> Self {
        Self {
            spacing: Duration::from_millis(config.request_spacing_ms),
            rate_limit_retries: config.rate_limit_retries,
            initial_backoff: Duration::from_millis(config.initial_backoff_ms),
            max_backoff: Duration::from_millis(config.max_backoff_ms),
            cooldown_after_retry: Duration::from_millis(config.cooldown_after_retry_ms),
        }
    }
}

/// Serializes every outbound RPC call across all chains.
pub struct RequestThrottle {
    settings: ThrottleSettings,
    /// Earliest instant the next task may start. Held for the duration of a task.
    next_slot: Mutex<Instant>,
}

impl RequestThrottle {
    pub fn new(settings: ThrottleSettings) -> Self {
        Self {
            settings,
            next_slot: Mutex::new(Instant::now()),
        }
    }

    /// Run `task` once it reaches the head of the line.
    pub async fn enqueue<T, F, Fut>(&self, context: &str, mut task: F) -> Result<T, ProviderError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ProviderError>>,
    {
        let mut next_slot = self.next_slot.lock().await;
        tokio::time::sleep_until(*next_slot).await;

        let mut backoff = ExponentialWithMaxRetryCount::new(
            self.settings.initial_backoff,
            self.settings.max_backoff,
            self.settings.rate_limit_retries,
        );
        let mut retried = false;

        let result = loop {
            match task().await {
                Err(e) if e.is_rate_limited() => match backoff.next_backoff() {
                    Some(delay) => {
                        retried = true;
                        warn!(context, provider = %e.provider, ?delay, "Rate limited, backing off");
                        crate::metrics::record_rate_limited(&e.provider);
                        tokio::time::sleep(delay).await;
                    }
                    None => {
                        warn!(context, provider = %e.provider, "Rate limit retries exhausted");
                        break Err(e);
                    }
                },
                other => break other,
            }
        };

        let mut next = Instant::now() + self.settings.spacing;
        if retried {
            next += self.settings.cooldown_after_retry;
            debug!(context, "Cooling down after retried request");
        }
        *next_slot = next;

        result
    }
}
