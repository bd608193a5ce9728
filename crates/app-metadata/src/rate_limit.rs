// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::{sleep_until, Instant};

/// Token bucket holding a single token, refilled every `1 / requests_per_second`.
///
/// Callers queue for the next free slot, so the aggregate rate stays at or below the configured
/// rate regardless of how many tasks share the limiter.
#[derive(Debug)]
pub struct RateLimiter {
    interval: Duration,
    next_slot: Mutex<Instant>,
}

impl RateLimiter {
    /// A rate of zero disables limiting.
    #[must_use]
    pub fn new(requests_per_second: u32) -> Self {
        let interval = if requests_per_second == 0 {
            Duration::ZERO
        } else {
            Duration::from_secs(1) / requests_per_second
        };
        RateLimiter {
            interval,
            next_slot: Mutex::new(Instant::now()),
        }
    }

    /// Waits until a request may be sent.
    pub async fn take(&self) {
        if self.interval.is_zero() {
            return;
        }
        let slot = {
            let mut next_slot = self.next_slot.lock().await;
            let slot = (*next_slot).max(Instant::now());
            *next_slot = slot + self.interval;
            slot
        };
        sleep_until(slot).await;
    }
}
