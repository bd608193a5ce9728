// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Flattening of typed envelopes into shippable field maps.

use std::collections::HashMap;

use app_metadata::App;
use firehose_nozzle::envelope::{Envelope, Event as Payload};
use serde_json::{json, Map, Value};

pub type Fields = Map<String, Value>;

pub const APP_ID_FIELD: &str = "cf_app_id";
pub const IGNORED_APP_FIELD: &str = "cf_ignored_app";
pub const ORG_NAME_FIELD: &str = "cf_org_name";
pub const SPACE_NAME_FIELD: &str = "cf_space_name";

/// A routed event: its fields, its message and the name of its type.
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    pub fields: Fields,
    pub msg: String,
    pub event_type: String,
}

impl Event {
    /// Extracts the per-type fields of `envelope` and annotates them with the envelope metadata.
    #[must_use]
    pub fn from_envelope(envelope: &Envelope) -> Self {
        let (fields, msg) = extract(&envelope.event);
        let mut event = Event {
            fields,
            msg,
            event_type: envelope.event_type().to_string(),
        };
        event.annotate_with_envelope_data(envelope);
        event
    }

    fn annotate_with_envelope_data(&mut self, envelope: &Envelope) {
        self.insert("origin", envelope.origin.as_str());
        self.insert("deployment", envelope.deployment.as_str());
        self.insert("ip", envelope.ip.as_str());
        self.insert("job", envelope.job.as_str());
        self.insert("index", envelope.index.as_str());
    }

    /// Adds the origin marker, the event type and the configured extra fields. Extra fields win
    /// over extracted ones.
    pub fn annotate_with_meta_data(&mut self, extra_fields: &HashMap<String, String>) {
        self.insert("cf_origin", "firehose");
        let event_type = self.event_type.clone();
        self.insert("event_type", event_type);
        for (key, value) in extra_fields {
            self.insert(key, value.as_str());
        }
    }

    /// Adds the non-empty names and guids of `app`, plus its opt-out marker.
    pub fn annotate_with_app_data(&mut self, app: &App) {
        let annotations = [
            ("cf_app_name", &app.name),
            ("cf_space_id", &app.space_guid),
            (SPACE_NAME_FIELD, &app.space_name),
            ("cf_org_id", &app.org_guid),
            (ORG_NAME_FIELD, &app.org_name),
        ];
        for (key, value) in annotations {
            if !value.is_empty() {
                self.insert(key, value.as_str());
            }
        }
        self.insert(IGNORED_APP_FIELD, app.ignored_app);
    }

    /// The application id, when the event carries a non-empty one.
    #[must_use]
    pub fn app_id(&self) -> Option<&str> {
        self.fields
            .get(APP_ID_FIELD)
            .and_then(Value::as_str)
            .filter(|id| !id.is_empty())
    }

    #[must_use]
    pub fn field_str(&self, key: &str) -> Option<&str> {
        self.fields.get(key).and_then(Value::as_str)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.fields.insert(key.into(), value.into());
    }
}

fn to_fields(value: Value) -> Fields {
    match value {
        Value::Object(fields) => fields,
        _ => Fields::new(),
    }
}

fn extract(payload: &Payload) -> (Fields, String) {
    match payload {
        Payload::HttpStartStop(http) => {
            let fields = json!({
                "cf_app_id": http.application_id.clone().unwrap_or_default(),
                "content_length": http.content_length,
                "instance_id": http.instance_id,
                "instance_index": http.instance_index,
                "method": http.method,
                "peer_type": http.peer_type,
                "remote_addr": http.remote_address,
                "request_id": http.request_id,
                "start_timestamp": http.start_timestamp,
                "status_code": http.status_code,
                "stop_timestamp": http.stop_timestamp,
                "uri": http.uri,
                "user_agent": http.user_agent,
                "duration_ms": (http.stop_timestamp - http.start_timestamp) / 1_000_000,
                "forwarded": http.forwarded,
            });
            (to_fields(fields), String::new())
        }
        Payload::LogMessage(log) => {
            let fields = json!({
                "cf_app_id": log.app_id,
                "timestamp": log.timestamp,
                "source_type": log.source_type,
                "message_type": log.message_type.to_string(),
                "source_instance": log.source_instance,
            });
            (
                to_fields(fields),
                String::from_utf8_lossy(&log.message).into_owned(),
            )
        }
        Payload::ValueMetric(metric) => {
            let fields = json!({
                "name": metric.name,
                "unit": metric.unit,
                "value": metric.value,
            });
            (to_fields(fields), String::new())
        }
        Payload::CounterEvent(counter) => {
            let fields = json!({
                "name": counter.name,
                "delta": counter.delta,
                "total": counter.total,
            });
            (to_fields(fields), String::new())
        }
        Payload::Error(error) => {
            let fields = json!({
                "code": error.code,
                "source": error.source,
            });
            (to_fields(fields), error.message.clone())
        }
        Payload::ContainerMetric(metric) => {
            let fields = json!({
                "cf_app_id": metric.application_id,
                "cpu_percentage": metric.cpu_percentage,
                "disk_bytes": metric.disk_bytes,
                "disk_bytes_quota": metric.disk_bytes_quota,
                "instance_index": metric.instance_index,
                "memory_bytes": metric.memory_bytes,
                "memory_bytes_quota": metric.memory_bytes_quota,
            });
            (to_fields(fields), String::new())
        }
    }
}
