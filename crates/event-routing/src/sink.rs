// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Destinations for shipped events.

use std::io::{self, Write};
use std::sync::{Mutex, PoisonError};
use std::time::SystemTime;

use serde_json::Value;
use thiserror::Error;

use crate::event::Fields;

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("failed to encode event: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("failed to write event: {0}")]
    Io(#[from] io::Error),
}

/// Receives every event that passes the filters.
pub trait Sink: Send + Sync {
    fn ship(&self, fields: &Fields, message: &str) -> Result<(), SinkError>;
}

const RESERVED_KEYS: [&str; 3] = ["time", "msg", "level"];

/// Writes one JSON object per line: the event fields plus `time`, `level` and `msg`. Event fields
/// named like one of those are kept under a `fields.` prefix.
pub struct JsonLinesSink<W> {
    writer: Mutex<W>,
}

impl JsonLinesSink<io::Stdout> {
    #[must_use]
    pub fn stdout() -> Self {
        JsonLinesSink::new(io::stdout())
    }
}

impl<W: Write + Send> JsonLinesSink<W> {
    pub fn new(writer: W) -> Self {
        JsonLinesSink {
            writer: Mutex::new(writer),
        }
    }

    pub fn into_inner(self) -> W {
        self.writer
            .into_inner()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn encode(fields: &Fields, message: &str) -> Result<Vec<u8>, SinkError> {
        let mut line = Fields::with_capacity(fields.len() + RESERVED_KEYS.len());
        for (key, value) in fields {
            if RESERVED_KEYS.contains(&key.as_str()) {
                line.insert(format!("fields.{key}"), value.clone());
            } else {
                line.insert(key.clone(), value.clone());
            }
        }
        line.insert("level".to_string(), Value::from("info"));
        line.insert("msg".to_string(), Value::from(message));
        line.insert(
            "time".to_string(),
            Value::from(humantime::format_rfc3339_millis(SystemTime::now()).to_string()),
        );
        let mut bytes = serde_json::to_vec(&line)?;
        bytes.push(b'\n');
        Ok(bytes)
    }
}

impl<W: Write + Send> Sink for JsonLinesSink<W> {
    fn ship(&self, fields: &Fields, message: &str) -> Result<(), SinkError> {
        let bytes = Self::encode(fields, message)?;
        let mut writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        writer.write_all(&bytes)?;
        writer.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_json_lines_sink_writes_one_object_per_event() {
        let sink = JsonLinesSink::new(Vec::new());
        let mut fields = Fields::new();
        fields.insert("cf_app_name".to_string(), json!("billing"));
        fields.insert("msg".to_string(), json!("clash"));

        sink.ship(&fields, "first").unwrap();
        sink.ship(&Fields::new(), "second").unwrap();

        let output = String::from_utf8(sink.into_inner()).unwrap();
        let lines: Vec<Value> = output
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["cf_app_name"], "billing");
        assert_eq!(lines[0]["msg"], "first");
        assert_eq!(lines[0]["fields.msg"], "clash");
        assert_eq!(lines[0]["level"], "info");
        assert!(lines[0]["time"].as_str().unwrap().ends_with('Z'));
        assert_eq!(lines[1]["msg"], "second");
    }

    struct BrokenWriter;

    impl Write for BrokenWriter {
        fn write(&mut self, _buf: &[u8]) -> io::Result<usize> {
            Err(io::Error::new(io::ErrorKind::BrokenPipe, "closed"))
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_write_failures_are_reported() {
        let sink = JsonLinesSink::new(BrokenWriter);
        assert!(matches!(
            sink.ship(&Fields::new(), "lost"),
            Err(SinkError::Io(_))
        ));
    }
}
