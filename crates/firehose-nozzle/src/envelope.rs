// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Typed firehose envelopes.
//!
//! An [`Envelope`] is immutable once produced by the streaming session. Ownership moves from the
//! session into a diode slot and from there into the router.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

/// The event types the nozzle knows how to route.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EventType {
    HttpStartStop,
    LogMessage,
    ValueMetric,
    CounterEvent,
    Error,
    ContainerMetric,
}

impl EventType {
    pub const ALL: [EventType; 6] = [
        EventType::HttpStartStop,
        EventType::LogMessage,
        EventType::ValueMetric,
        EventType::CounterEvent,
        EventType::Error,
        EventType::ContainerMetric,
    ];

    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            EventType::HttpStartStop => "HttpStartStop",
            EventType::LogMessage => "LogMessage",
            EventType::ValueMetric => "ValueMetric",
            EventType::CounterEvent => "CounterEvent",
            EventType::Error => "Error",
            EventType::ContainerMetric => "ContainerMetric",
        }
    }

    /// Whether events of this type reference an application and need metadata resolution.
    #[must_use]
    pub const fn carries_app_id(&self) -> bool {
        matches!(
            self,
            EventType::HttpStartStop | EventType::LogMessage | EventType::ContainerMetric
        )
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown event type: {0}")]
pub struct UnknownEventType(pub String);

impl FromStr for EventType {
    type Err = UnknownEventType;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EventType::ALL
            .iter()
            .find(|t| t.as_str() == s)
            .copied()
            .ok_or_else(|| UnknownEventType(s.to_string()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MessageType {
    #[default]
    Out,
    Err,
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MessageType::Out => f.write_str("OUT"),
            MessageType::Err => f.write_str("ERR"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct LogMessage {
    pub message: Vec<u8>,
    pub message_type: MessageType,
    /// Nanoseconds since the epoch.
    pub timestamp: i64,
    pub app_id: String,
    pub source_type: String,
    pub source_instance: String,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct HttpStartStop {
    pub start_timestamp: i64,
    pub stop_timestamp: i64,
    pub request_id: String,
    pub peer_type: String,
    pub method: String,
    pub uri: String,
    pub remote_address: String,
    pub user_agent: String,
    pub status_code: i32,
    pub content_length: i64,
    pub application_id: Option<String>,
    pub instance_index: i32,
    pub instance_id: String,
    pub forwarded: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct ValueMetric {
    pub name: String,
    pub value: f64,
    pub unit: String,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct CounterEvent {
    pub name: String,
    pub delta: u64,
    pub total: u64,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct ErrorEvent {
    pub source: String,
    pub code: i32,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct ContainerMetric {
    pub application_id: String,
    pub instance_index: i32,
    pub cpu_percentage: f64,
    pub memory_bytes: u64,
    pub disk_bytes: u64,
    pub memory_bytes_quota: u64,
    pub disk_bytes_quota: u64,
}

/// Payload of an envelope, one variant per [`EventType`].
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    HttpStartStop(HttpStartStop),
    LogMessage(LogMessage),
    ValueMetric(ValueMetric),
    CounterEvent(CounterEvent),
    Error(ErrorEvent),
    ContainerMetric(ContainerMetric),
}

/// A single firehose event plus the metadata common to every event type.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub origin: String,
    pub deployment: String,
    pub job: String,
    pub index: String,
    pub ip: String,
    /// Nanoseconds since the epoch.
    pub timestamp: i64,
    pub tags: HashMap<String, String>,
    pub event: Event,
}

impl Envelope {
    /// Builds an envelope with empty common metadata around `event`.
    #[must_use]
    pub fn new(event: Event) -> Self {
        Envelope {
            origin: String::new(),
            deployment: String::new(),
            job: String::new(),
            index: String::new(),
            ip: String::new(),
            timestamp: 0,
            tags: HashMap::new(),
            event,
        }
    }

    #[must_use]
    pub fn event_type(&self) -> EventType {
        match self.event {
            Event::HttpStartStop(_) => EventType::HttpStartStop,
            Event::LogMessage(_) => EventType::LogMessage,
            Event::ValueMetric(_) => EventType::ValueMetric,
            Event::CounterEvent(_) => EventType::CounterEvent,
            Event::Error(_) => EventType::Error,
            Event::ContainerMetric(_) => EventType::ContainerMetric,
        }
    }
}
