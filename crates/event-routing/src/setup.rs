// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::collections::{HashMap, HashSet};

use firehose_nozzle::EventType;
use thiserror::Error;
use tracing::info;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SetupError {
    #[error("rejected event name [{name}] - valid events: {valid}")]
    UnknownEvent { name: String, valid: String },
    #[error("extra field {0} must split by ':' into exactly 2 values")]
    MalformedExtraField(String),
}

/// Names of every routable event type, sorted and comma separated.
#[must_use]
pub fn authorized_events() -> String {
    let mut names: Vec<&str> = EventType::ALL.iter().map(EventType::as_str).collect();
    names.sort_unstable();
    names.join(", ")
}

/// Parses the comma-separated list of wanted event types. An empty list selects `LogMessage`.
pub fn setup_event_routing(wanted_events: &str) -> Result<HashSet<EventType>, SetupError> {
    if wanted_events.trim().is_empty() {
        return Ok(HashSet::from([EventType::LogMessage]));
    }
    let mut selected = HashSet::new();
    for name in wanted_events.split(',').map(str::trim) {
        let event_type = name
            .parse::<EventType>()
            .map_err(|_| SetupError::UnknownEvent {
                name: name.to_string(),
                valid: authorized_events(),
            })?;
        info!("Event type [{event_type}] is included in the firehose");
        selected.insert(event_type);
    }
    Ok(selected)
}

/// Parses `key:value,key:value` into the fields added to every event.
pub fn parse_extra_fields(extra_fields: &str) -> Result<HashMap<String, String>, SetupError> {
    let mut fields = HashMap::new();
    for pair in extra_fields.split(',').map(str::trim) {
        if pair.is_empty() {
            continue;
        }
        let mut parts = pair.split(':');
        match (parts.next(), parts.next(), parts.next()) {
            (Some(key), Some(value), None) => {
                fields.insert(key.trim().to_string(), value.trim().to_string());
            }
            _ => return Err(SetupError::MalformedExtraField(pair.to_string())),
        }
    }
    Ok(fields)
}

/// Whether any selected event type needs app metadata.
#[must_use]
pub fn cache_needed(selected: &HashSet<EventType>) -> bool {
    selected.iter().any(EventType::carries_app_id)
}
