// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Routes envelopes pulled out of the diode: extraction, enrichment, filtering, then shipping.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use app_metadata::{AppResolver, CacheError};
use async_trait::async_trait;
use firehose_nozzle::{Envelope, EventRouter, EventType, Stats, StatsType};
use serde_json::Value;
use tokio::time::interval;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::event::{Event, Fields};
use crate::filters::EventFilter;
use crate::sink::Sink;

pub const TOTALS_EVENT_TYPE: &str = "firehose_to_syslog_stats";
const TOTALS_MESSAGE: &str = "Statistic for firehose to syslog";

pub struct Router {
    selected: HashSet<EventType>,
    extra_fields: HashMap<String, String>,
    filters: Vec<EventFilter>,
    resolver: Arc<dyn AppResolver>,
    sink: Arc<dyn Sink>,
    stats: Arc<Stats>,
    shipped: Mutex<BTreeMap<String, u64>>,
}

impl Router {
    pub fn new(
        selected: HashSet<EventType>,
        resolver: Arc<dyn AppResolver>,
        sink: Arc<dyn Sink>,
        stats: Arc<Stats>,
    ) -> Self {
        Router {
            selected,
            extra_fields: HashMap::new(),
            filters: Vec::new(),
            resolver,
            sink,
            stats,
            shipped: Mutex::new(BTreeMap::new()),
        }
    }

    #[must_use]
    pub fn with_extra_fields(mut self, extra_fields: HashMap<String, String>) -> Self {
        self.extra_fields = extra_fields;
        self
    }

    #[must_use]
    pub fn with_filters(mut self, filters: Vec<EventFilter>) -> Self {
        self.filters = filters;
        self
    }

    /// Shipped events per event type name.
    #[must_use]
    pub fn shipped_counts(&self) -> BTreeMap<String, u64> {
        self.shipped
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    #[must_use]
    pub fn total_shipped(&self) -> u64 {
        self.shipped
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .sum()
    }

    async fn annotate_with_app(&self, event: &mut Event) {
        let Some(app_id) = event.app_id().map(str::to_string) else {
            return;
        };
        match self.resolver.get_app(&app_id).await {
            Ok(app) => event.annotate_with_app_data(&app),
            Err(CacheError::NotFound(_)) => {}
            Err(e) => debug!("No metadata for app {app_id}: {e}"),
        }
    }

    fn ship(&self, event: &Event) {
        match self.sink.ship(&event.fields, &event.msg) {
            Ok(()) => {
                self.stats.inc(StatsType::Publish);
                *self
                    .shipped
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .entry(event.event_type.clone())
                    .or_default() += 1;
            }
            Err(e) => {
                self.stats.inc(StatsType::PublishFail);
                warn!("Failed to ship {} event: {e}", event.event_type);
            }
        }
    }

    /// Builds the totals event for a window of `elapsed` that started at `last_count` shipped
    /// events. Returns the event and the current total.
    #[must_use]
    pub fn event_totals(&self, elapsed: Duration, last_count: u64) -> (Event, u64) {
        let counts = self.shipped_counts();
        let total: u64 = counts.values().sum();
        // window rounded down to tenths of a second
        let window = (elapsed.as_secs_f64() * 10.0).trunc() / 10.0;
        let by_sec = if window > 0.0 {
            (total.saturating_sub(last_count) as f64 / window).trunc() as u64
        } else {
            0
        };

        let mut fields = Fields::new();
        fields.insert("total_count".to_string(), Value::from(total));
        fields.insert("by_sec_Events".to_string(), Value::from(by_sec));
        for (event_type, count) in counts {
            fields.insert(event_type, Value::from(count));
        }
        let mut event = Event {
            fields,
            msg: TOTALS_MESSAGE.to_string(),
            event_type: TOTALS_EVENT_TYPE.to_string(),
        };
        event.annotate_with_meta_data(&HashMap::new());
        (event, total)
    }

    /// Ships the totals event every `period` until cancelled.
    pub async fn report_totals(&self, period: Duration, cancel_token: CancellationToken) {
        let mut ticker = interval(period);
        ticker.tick().await;
        let mut window_start = Instant::now();
        let mut last_count = 0;
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                () = cancel_token.cancelled() => break,
            }
            let (event, total) = self.event_totals(window_start.elapsed(), last_count);
            window_start = Instant::now();
            last_count = total;
            if let Err(e) = self.sink.ship(&event.fields, &event.msg) {
                warn!("Failed to ship event totals: {e}");
            }
        }
        debug!("Event totals reporting stopped");
    }
}

#[async_trait]
impl EventRouter for Router {
    async fn route_event(&self, envelope: Envelope) {
        if !self.selected.contains(&envelope.event_type()) {
            return;
        }
        self.stats.inc(StatsType::Forwarded);

        let mut event = Event::from_envelope(&envelope);
        event.annotate_with_meta_data(&self.extra_fields);
        self.annotate_with_app(&mut event).await;

        // every filter runs so each can strip its marker fields
        let mut dropped = false;
        for filter in &self.filters {
            dropped |= filter(&mut event);
        }
        if dropped {
            self.stats.inc(StatsType::Ignored);
            return;
        }
        self.ship(&event);
    }

    fn selected_events(&self) -> HashSet<EventType> {
        self.selected.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::SinkError;
    use app_metadata::EmptyResolver;
    use firehose_nozzle::envelope::{CounterEvent, Event as Payload};
    use tracing_test::traced_test;

    struct FailingSink;

    impl Sink for FailingSink {
        fn ship(&self, _fields: &Fields, _message: &str) -> Result<(), SinkError> {
            Err(SinkError::Io(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "closed",
            )))
        }
    }

    #[derive(Default)]
    struct CountingSink(Mutex<Vec<Fields>>);

    impl Sink for CountingSink {
        fn ship(&self, fields: &Fields, _message: &str) -> Result<(), SinkError> {
            self.0.lock().unwrap().push(fields.clone());
            Ok(())
        }
    }

    fn counter() -> Envelope {
        Envelope::new(Payload::CounterEvent(CounterEvent {
            name: "requests".to_string(),
            delta: 1,
            total: 1,
        }))
    }

    fn router(sink: Arc<dyn Sink>, stats: Arc<Stats>) -> Router {
        Router::new(
            HashSet::from([EventType::CounterEvent]),
            Arc::new(EmptyResolver),
            sink,
            stats,
        )
    }

    #[tokio::test]
    #[traced_test]
    async fn test_ship_failures_are_counted() {
        let stats = Arc::new(Stats::default());
        let router = router(Arc::new(FailingSink), Arc::clone(&stats));
        router.route_event(counter()).await;

        assert_eq!(stats.get(StatsType::PublishFail), 1);
        assert_eq!(stats.get(StatsType::Publish), 0);
        assert_eq!(router.total_shipped(), 0);
        assert!(logs_contain("Failed to ship CounterEvent event"));
    }

    #[tokio::test]
    async fn test_unselected_envelopes_are_not_routed() {
        let stats = Arc::new(Stats::default());
        let sink = Arc::new(CountingSink::default());
        let router = Router::new(
            HashSet::from([EventType::LogMessage]),
            Arc::new(EmptyResolver),
            sink.clone(),
            Arc::clone(&stats),
        );
        router.route_event(counter()).await;

        assert!(sink.0.lock().unwrap().is_empty());
        assert_eq!(stats.get(StatsType::Forwarded), 0);
    }

    #[tokio::test]
    async fn test_event_totals() {
        let sink = Arc::new(CountingSink::default());
        let router = router(sink, Arc::new(Stats::default()));
        for _ in 0..30 {
            router.route_event(counter()).await;
        }

        let (event, total) = router.event_totals(Duration::from_millis(10_050), 10);
        assert_eq!(total, 30);
        assert_eq!(event.event_type, TOTALS_EVENT_TYPE);
        assert_eq!(event.msg, TOTALS_MESSAGE);
        assert_eq!(event.fields["total_count"], 30);
        assert_eq!(event.fields["by_sec_Events"], 2);
        assert_eq!(event.fields["CounterEvent"], 30);
        assert_eq!(event.fields["event_type"], TOTALS_EVENT_TYPE);
        assert_eq!(event.fields["cf_origin"], "firehose");

        let (event, _) = router.event_totals(Duration::ZERO, 0);
        assert_eq!(event.fields["by_sec_Events"], 0);
    }

    #[test]
    fn test_with_extra_fields_replaces_defaults() {
        let router = router(Arc::new(CountingSink::default()), Arc::new(Stats::default()))
            .with_extra_fields(HashMap::from([("env".to_string(), "dev".to_string())]));
        assert_eq!(router.extra_fields.len(), 1);
        assert_eq!(
            router.selected_events(),
            HashSet::from([EventType::CounterEvent])
        );
    }
}
