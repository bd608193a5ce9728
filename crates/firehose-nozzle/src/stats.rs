// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Pipeline counters.
//!
//! All counters are atomics updated with relaxed ordering; nothing in the pipeline reads them back
//! to make decisions.

use std::env;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::Duration;

use serde::Serialize;
use tokio::time::interval;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::envelope::EventType;

const DEFAULT_INSTANCE_ID: u32 = 0;
pub const ENV_CF_INSTANCE_INDEX: &str = "CF_INSTANCE_INDEX";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatsType {
    /// envelopes received from the stream
    Consume,
    /// envelopes received but not selected
    ConsumeUnknown,
    ConsumeHttpStartStop,
    ConsumeValueMetric,
    ConsumeCounterEvent,
    ConsumeLogMessage,
    ConsumeError,
    ConsumeContainerMetric,
    /// events dropped by a filter
    Ignored,
    /// events handed to the router
    Forwarded,
    /// events shipped to the sink
    Publish,
    PublishFail,
    SlowConsumerAlert,
    /// envelopes lost to diode overflow
    Missed,
    /// envelopes currently held in the diode
    SubInputBuffer,
}

impl StatsType {
    #[must_use]
    pub fn consume_for(event_type: EventType) -> StatsType {
        match event_type {
            EventType::HttpStartStop => StatsType::ConsumeHttpStartStop,
            EventType::LogMessage => StatsType::ConsumeLogMessage,
            EventType::ValueMetric => StatsType::ConsumeValueMetric,
            EventType::CounterEvent => StatsType::ConsumeCounterEvent,
            EventType::Error => StatsType::ConsumeError,
            EventType::ContainerMetric => StatsType::ConsumeContainerMetric,
        }
    }
}

#[derive(Debug, Default)]
pub struct Stats {
    consume: AtomicU64,
    consume_per_sec: AtomicU64,
    consume_unknown: AtomicU64,
    consume_http_start_stop: AtomicU64,
    consume_value_metric: AtomicU64,
    consume_counter_event: AtomicU64,
    consume_log_message: AtomicU64,
    consume_error: AtomicU64,
    consume_container_metric: AtomicU64,
    ignored: AtomicU64,
    forwarded: AtomicU64,
    publish: AtomicU64,
    publish_per_sec: AtomicU64,
    publish_fail: AtomicU64,
    slow_consumer_alert: AtomicU64,
    missed: AtomicU64,
    sub_input_buffer: AtomicI64,
    instance_id: u32,
}

/// Point-in-time copy of [`Stats`], suitable for JSON exposition.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub consume: u64,
    pub consume_per_sec: u64,
    pub consume_unknown: u64,
    pub consume_http_start_stop: u64,
    pub consume_value_metric: u64,
    pub consume_counter_event: u64,
    pub consume_log_message: u64,
    pub consume_error: u64,
    pub consume_container_metric: u64,
    pub ignored: u64,
    pub forwarded: u64,
    pub publish: u64,
    pub publish_per_sec: u64,
    pub publish_fail: u64,
    pub slow_consumer_alert: u64,
    pub missed: u64,
    #[serde(rename = "subinupt_buffer")]
    pub sub_input_buffer: i64,
    pub instance_id: u32,
}

impl Stats {
    /// Creates empty counters, tagging them with the instance index from `CF_INSTANCE_INDEX`.
    #[must_use]
    pub fn new() -> Self {
        let instance_id = env::var(ENV_CF_INSTANCE_INDEX)
            .ok()
            .and_then(|id| id.parse().ok())
            .unwrap_or(DEFAULT_INSTANCE_ID);
        Stats {
            instance_id,
            ..Default::default()
        }
    }

    fn counter(&self, stats_type: StatsType) -> Option<&AtomicU64> {
        match stats_type {
            StatsType::Consume => Some(&self.consume),
            StatsType::ConsumeUnknown => Some(&self.consume_unknown),
            StatsType::ConsumeHttpStartStop => Some(&self.consume_http_start_stop),
            StatsType::ConsumeValueMetric => Some(&self.consume_value_metric),
            StatsType::ConsumeCounterEvent => Some(&self.consume_counter_event),
            StatsType::ConsumeLogMessage => Some(&self.consume_log_message),
            StatsType::ConsumeError => Some(&self.consume_error),
            StatsType::ConsumeContainerMetric => Some(&self.consume_container_metric),
            StatsType::Ignored => Some(&self.ignored),
            StatsType::Forwarded => Some(&self.forwarded),
            StatsType::Publish => Some(&self.publish),
            StatsType::PublishFail => Some(&self.publish_fail),
            StatsType::SlowConsumerAlert => Some(&self.slow_consumer_alert),
            StatsType::Missed => Some(&self.missed),
            StatsType::SubInputBuffer => None,
        }
    }

    pub fn inc(&self, stats_type: StatsType) {
        self.add(stats_type, 1);
    }

    pub fn dec(&self, stats_type: StatsType) {
        self.sub(stats_type, 1);
    }

    /// Only [`StatsType::SubInputBuffer`] can go down; other counters ignore `sub`.
    pub fn sub(&self, stats_type: StatsType, amount: u64) {
        if stats_type == StatsType::SubInputBuffer {
            let amount = i64::try_from(amount).unwrap_or(i64::MAX);
            self.sub_input_buffer.fetch_sub(amount, Ordering::Relaxed);
        }
    }

    pub fn add(&self, stats_type: StatsType, amount: u64) {
        match self.counter(stats_type) {
            Some(counter) => {
                counter.fetch_add(amount, Ordering::Relaxed);
            }
            None => {
                let amount = i64::try_from(amount).unwrap_or(i64::MAX);
                self.sub_input_buffer.fetch_add(amount, Ordering::Relaxed);
            }
        }
    }

    #[must_use]
    pub fn get(&self, stats_type: StatsType) -> u64 {
        match self.counter(stats_type) {
            Some(counter) => counter.load(Ordering::Relaxed),
            None => u64::try_from(self.sub_input_buffer.load(Ordering::Relaxed)).unwrap_or(0),
        }
    }

    #[must_use]
    pub fn buffered(&self) -> i64 {
        self.sub_input_buffer.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn snapshot(&self) -> StatsSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        StatsSnapshot {
            consume: load(&self.consume),
            consume_per_sec: load(&self.consume_per_sec),
            consume_unknown: load(&self.consume_unknown),
            consume_http_start_stop: load(&self.consume_http_start_stop),
            consume_value_metric: load(&self.consume_value_metric),
            consume_counter_event: load(&self.consume_counter_event),
            consume_log_message: load(&self.consume_log_message),
            consume_error: load(&self.consume_error),
            consume_container_metric: load(&self.consume_container_metric),
            ignored: load(&self.ignored),
            forwarded: load(&self.forwarded),
            publish: load(&self.publish),
            publish_per_sec: load(&self.publish_per_sec),
            publish_fail: load(&self.publish_fail),
            slow_consumer_alert: load(&self.slow_consumer_alert),
            missed: load(&self.missed),
            sub_input_buffer: self.sub_input_buffer.load(Ordering::Relaxed),
            instance_id: self.instance_id,
        }
    }

    /// Updates the per-second consume/publish rates once per `period` until cancelled.
    pub async fn per_sec(&self, period: Duration, cancel_token: CancellationToken) {
        let mut ticker = interval(period);
        ticker.tick().await; // first tick is immediate
        let mut last_consume = self.get(StatsType::Consume);
        let mut last_publish = self.get(StatsType::Publish);
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                () = cancel_token.cancelled() => {
                    debug!("Stopping stats rate ticker");
                    return;
                }
            }
            let consume = self.get(StatsType::Consume);
            let publish = self.get(StatsType::Publish);
            self.consume_per_sec
                .store(consume.saturating_sub(last_consume), Ordering::Relaxed);
            self.publish_per_sec
                .store(publish.saturating_sub(last_publish), Ordering::Relaxed);
            last_consume = consume;
            last_publish = publish;
        }
    }
}
