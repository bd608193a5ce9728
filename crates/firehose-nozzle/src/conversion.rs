// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Conversion of RLP gateway (loggregator v2 JSON) envelopes into typed [`Envelope`]s.
//!
//! The gateway encodes 64-bit integers as decimal strings, so every integer field accepts both
//! representations.

use std::collections::HashMap;

use base64::Engine;
use serde::{Deserialize, Deserializer};
use tracing::trace;

use crate::envelope::{
    ContainerMetric, CounterEvent, Envelope, Event, HttpStartStop, LogMessage, MessageType,
    ValueMetric,
};

/// A batch as delivered in one server-sent event.
#[derive(Debug, Default, Deserialize)]
pub struct V2Batch {
    #[serde(default)]
    pub batch: Vec<V2Envelope>,
}

#[derive(Debug, Default, Deserialize)]
pub struct V2Envelope {
    #[serde(default, deserialize_with = "lenient_i64")]
    pub timestamp: i64,
    #[serde(default)]
    pub source_id: String,
    #[serde(default)]
    pub instance_id: String,
    #[serde(default)]
    pub tags: HashMap<String, String>,
    #[serde(default)]
    pub deprecated_tags: HashMap<String, V2Value>,
    pub log: Option<V2Log>,
    pub counter: Option<V2Counter>,
    pub gauge: Option<V2Gauge>,
    pub timer: Option<V2Timer>,
    pub event: Option<serde_json::Value>,
}

#[derive(Debug, Default, Deserialize)]
pub struct V2Value {
    pub text: Option<String>,
    #[serde(default, deserialize_with = "lenient_opt_i64")]
    pub integer: Option<i64>,
    pub decimal: Option<f64>,
}

#[derive(Debug, Default, Deserialize)]
pub struct V2Log {
    #[serde(default)]
    pub payload: String,
    #[serde(default, rename = "type")]
    pub log_type: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct V2Counter {
    #[serde(default)]
    pub name: String,
    #[serde(default, deserialize_with = "lenient_u64")]
    pub delta: u64,
    #[serde(default, deserialize_with = "lenient_u64")]
    pub total: u64,
}

#[derive(Debug, Default, Deserialize)]
pub struct V2Gauge {
    #[serde(default)]
    pub metrics: HashMap<String, V2GaugeValue>,
}

#[derive(Debug, Default, Deserialize)]
pub struct V2GaugeValue {
    #[serde(default)]
    pub unit: String,
    #[serde(default)]
    pub value: f64,
}

#[derive(Debug, Default, Deserialize)]
pub struct V2Timer {
    #[serde(default)]
    pub name: String,
    #[serde(default, deserialize_with = "lenient_i64")]
    pub start: i64,
    #[serde(default, deserialize_with = "lenient_i64")]
    pub stop: i64,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum NumberOrString {
    Int(i64),
    Unsigned(u64),
    Float(f64),
    Str(String),
}

impl NumberOrString {
    fn as_i64(&self) -> Option<i64> {
        match self {
            NumberOrString::Int(v) => Some(*v),
            NumberOrString::Unsigned(v) => i64::try_from(*v).ok(),
            #[allow(clippy::cast_possible_truncation)]
            NumberOrString::Float(v) => Some(*v as i64),
            NumberOrString::Str(s) => s.trim().parse().ok(),
        }
    }

    fn as_u64(&self) -> Option<u64> {
        match self {
            NumberOrString::Int(v) => u64::try_from(*v).ok(),
            NumberOrString::Unsigned(v) => Some(*v),
            #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
            NumberOrString::Float(v) => Some(*v as u64),
            NumberOrString::Str(s) => s.trim().parse().ok(),
        }
    }
}

fn lenient_i64<'de, D: Deserializer<'de>>(deserializer: D) -> Result<i64, D::Error> {
    let value = Option::<NumberOrString>::deserialize(deserializer)?;
    Ok(value.and_then(|v| v.as_i64()).unwrap_or_default())
}

fn lenient_opt_i64<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<i64>, D::Error> {
    let value = Option::<NumberOrString>::deserialize(deserializer)?;
    Ok(value.and_then(|v| v.as_i64()))
}

fn lenient_u64<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u64, D::Error> {
    let value = Option::<NumberOrString>::deserialize(deserializer)?;
    Ok(value.and_then(|v| v.as_u64()).unwrap_or_default())
}

impl V2Envelope {
    /// Merges `tags` with the text/numeric `deprecated_tags`, with `tags` taking precedence.
    fn merged_tags(&self) -> HashMap<String, String> {
        let mut merged: HashMap<String, String> = self
            .deprecated_tags
            .iter()
            .filter_map(|(k, v)| {
                let value = v
                    .text
                    .clone()
                    .or_else(|| v.integer.map(|i| i.to_string()))
                    .or_else(|| v.decimal.map(|d| d.to_string()))?;
                Some((k.clone(), value))
            })
            .collect();
        merged.extend(self.tags.iter().map(|(k, v)| (k.clone(), v.clone())));
        merged
    }
}

fn tag(tags: &HashMap<String, String>, key: &str) -> String {
    tags.get(key).cloned().unwrap_or_default()
}

fn instance_index(instance_id: &str) -> i32 {
    instance_id.parse().unwrap_or_default()
}

fn gauge_u64(metrics: &HashMap<String, V2GaugeValue>, key: &str) -> u64 {
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    metrics.get(key).map_or(0, |m| m.value as u64)
}

fn is_container_metric(gauge: &V2Gauge) -> bool {
    ["cpu", "memory", "disk"]
        .iter()
        .all(|key| gauge.metrics.contains_key(*key))
}

/// Converts one v2 envelope into zero or more typed envelopes.
///
/// Non-container gauges fan out into one `ValueMetric` per gauge metric; v2 `event` envelopes
/// have no typed counterpart and are dropped.
#[must_use]
pub fn to_envelopes(v2: V2Envelope) -> Vec<Envelope> {
    let tags = v2.merged_tags();
    let template = |event: Event| Envelope {
        origin: tags
            .get("origin")
            .cloned()
            .unwrap_or_else(|| v2.source_id.clone()),
        deployment: tag(&tags, "deployment"),
        job: tag(&tags, "job"),
        index: tag(&tags, "index"),
        ip: tag(&tags, "ip"),
        timestamp: v2.timestamp,
        tags: tags.clone(),
        event,
    };

    if let Some(log) = &v2.log {
        let message = base64::engine::general_purpose::STANDARD
            .decode(log.payload.as_bytes())
            .unwrap_or_else(|_| log.payload.clone().into_bytes());
        let message_type = if log.log_type.eq_ignore_ascii_case("ERR") {
            MessageType::Err
        } else {
            MessageType::Out
        };
        return vec![template(Event::LogMessage(LogMessage {
            message,
            message_type,
            timestamp: v2.timestamp,
            app_id: v2.source_id.clone(),
            source_type: tag(&tags, "source_type"),
            source_instance: v2.instance_id.clone(),
        }))];
    }

    if let Some(counter) = &v2.counter {
        return vec![template(Event::CounterEvent(CounterEvent {
            name: counter.name.clone(),
            delta: counter.delta,
            total: counter.total,
        }))];
    }

    if let Some(gauge) = &v2.gauge {
        if is_container_metric(gauge) {
            return vec![template(Event::ContainerMetric(ContainerMetric {
                application_id: v2.source_id.clone(),
                instance_index: instance_index(&v2.instance_id),
                cpu_percentage: gauge.metrics.get("cpu").map_or(0.0, |m| m.value),
                memory_bytes: gauge_u64(&gauge.metrics, "memory"),
                disk_bytes: gauge_u64(&gauge.metrics, "disk"),
                memory_bytes_quota: gauge_u64(&gauge.metrics, "memory_quota"),
                disk_bytes_quota: gauge_u64(&gauge.metrics, "disk_quota"),
            }))];
        }
        let mut names: Vec<&String> = gauge.metrics.keys().collect();
        names.sort();
        return names
            .into_iter()
            .map(|name| {
                let metric = &gauge.metrics[name];
                template(Event::ValueMetric(ValueMetric {
                    name: name.clone(),
                    value: metric.value,
                    unit: metric.unit.clone(),
                }))
            })
            .collect();
    }

    if let Some(timer) = &v2.timer {
        let application_id = if v2.source_id.is_empty() {
            None
        } else {
            Some(v2.source_id.clone())
        };
        return vec![template(Event::HttpStartStop(HttpStartStop {
            start_timestamp: timer.start,
            stop_timestamp: timer.stop,
            request_id: tag(&tags, "request_id"),
            peer_type: tag(&tags, "peer_type").to_uppercase(),
            method: tag(&tags, "method").to_uppercase(),
            uri: tag(&tags, "uri"),
            remote_address: tag(&tags, "remote_address"),
            user_agent: tag(&tags, "user_agent"),
            status_code: tags
                .get("status_code")
                .and_then(|s| s.parse().ok())
                .unwrap_or_default(),
            content_length: tags
                .get("content_length")
                .and_then(|s| s.parse().ok())
                .unwrap_or_default(),
            application_id,
            instance_index: instance_index(&v2.instance_id),
            instance_id: tag(&tags, "instance_id"),
            forwarded: tags
                .get("forwarded")
                .map(|f| f.split(',').map(|s| s.trim().to_string()).collect())
                .unwrap_or_default(),
        }))];
    }

    if v2.event.is_some() {
        trace!("Skipping v2 event envelope from {}", v2.source_id);
    }
    Vec::new()
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::envelope::EventType;

    fn parse(json: &str) -> Vec<Envelope> {
        let batch: V2Batch = serde_json::from_str(json).unwrap();
        batch.batch.into_iter().flat_map(to_envelopes).collect()
    }

    #[test]
    fn test_log_envelope_converts_to_log_message() {
        let envelopes = parse(
            r#"{"batch":[{"timestamp":"1580000000000000000","source_id":"app-guid","instance_id":"2",
            "tags":{"origin":"rep","deployment":"cf","job":"diego-cell","index":"abc","ip":"10.0.0.1","source_type":"APP/PROC/WEB"},
            "log":{"payload":"aGVsbG8gd29ybGQ=","type":"ERR"}}]}"#,
        );
        assert_eq!(envelopes.len(), 1);
        let envelope = &envelopes[0];
        assert_eq!(envelope.event_type(), EventType::LogMessage);
        assert_eq!(envelope.origin, "rep");
        assert_eq!(envelope.job, "diego-cell");
        assert_eq!(envelope.timestamp, 1_580_000_000_000_000_000);
        let Event::LogMessage(log) = &envelope.event else {
            panic!("expected a log message");
        };
        assert_eq!(log.message, b"hello world");
        assert_eq!(log.message_type, MessageType::Err);
        assert_eq!(log.app_id, "app-guid");
        assert_eq!(log.source_type, "APP/PROC/WEB");
        assert_eq!(log.source_instance, "2");
    }

    #[test]
    fn test_container_gauge_converts_to_container_metric() {
        let envelopes = parse(
            r#"{"batch":[{"source_id":"app-guid","instance_id":"1","gauge":{"metrics":{
            "cpu":{"unit":"percentage","value":12.5},
            "memory":{"unit":"bytes","value":1024},
            "disk":{"unit":"bytes","value":2048},
            "memory_quota":{"unit":"bytes","value":4096},
            "disk_quota":{"unit":"bytes","value":8192}}}}]}"#,
        );
        assert_eq!(envelopes.len(), 1);
        let Event::ContainerMetric(metric) = &envelopes[0].event else {
            panic!("expected a container metric");
        };
        assert_eq!(metric.application_id, "app-guid");
        assert_eq!(metric.instance_index, 1);
        assert!((metric.cpu_percentage - 12.5).abs() < f64::EPSILON);
        assert_eq!(metric.memory_bytes, 1024);
        assert_eq!(metric.disk_bytes_quota, 8192);
    }

    #[test]
    fn test_plain_gauge_fans_out_value_metrics() {
        let envelopes = parse(
            r#"{"batch":[{"source_id":"router","gauge":{"metrics":{
            "latency":{"unit":"ms","value":3.0},
            "backends":{"unit":"count","value":7}}}}]}"#,
        );
        let names: Vec<_> = envelopes
            .iter()
            .map(|e| match &e.event {
                Event::ValueMetric(m) => m.name.clone(),
                other => panic!("unexpected event {other:?}"),
            })
            .collect();
        assert_eq!(names, vec!["backends", "latency"]);
        assert_eq!(envelopes[0].origin, "router");
    }

    #[test]
    fn test_counter_accepts_string_and_number_integers() {
        let envelopes = parse(
            r#"{"batch":[{"counter":{"name":"dropped","delta":"3","total":42}}]}"#,
        );
        let Event::CounterEvent(counter) = &envelopes[0].event else {
            panic!("expected a counter");
        };
        assert_eq!(counter.delta, 3);
        assert_eq!(counter.total, 42);
    }

    #[test]
    fn test_timer_converts_to_http_start_stop() {
        let envelopes = parse(
            r#"{"batch":[{"source_id":"app-guid","instance_id":"0",
            "tags":{"method":"get","uri":"http://example.com/","peer_type":"client","status_code":"200",
            "content_length":"512","request_id":"req-1","forwarded":"10.0.0.1, 10.0.0.2"},
            "timer":{"name":"http","start":"1000000000","stop":"3000000000"}}]}"#,
        );
        let Event::HttpStartStop(http) = &envelopes[0].event else {
            panic!("expected an http start stop");
        };
        assert_eq!(http.method, "GET");
        assert_eq!(http.peer_type, "CLIENT");
        assert_eq!(http.status_code, 200);
        assert_eq!(http.content_length, 512);
        assert_eq!(http.application_id.as_deref(), Some("app-guid"));
        assert_eq!(http.forwarded, vec!["10.0.0.1", "10.0.0.2"]);
        assert_eq!(http.stop_timestamp - http.start_timestamp, 2_000_000_000);
    }

    #[test]
    fn test_event_envelope_is_skipped() {
        let envelopes = parse(r#"{"batch":[{"event":{"title":"t","body":"b"}}]}"#);
        assert!(envelopes.is_empty());
    }

    #[test]
    fn test_deprecated_tags_fill_missing_tags() {
        let envelopes = parse(
            r#"{"batch":[{"deprecated_tags":{"deployment":{"text":"old"},"index":{"integer":"3"}},
            "tags":{"job":"router"},"counter":{"name":"c"}}]}"#,
        );
        assert_eq!(envelopes[0].deployment, "old");
        assert_eq!(envelopes[0].index, "3");
        assert_eq!(envelopes[0].job, "router");
    }
}
