// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::collections::HashMap;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::errors::CacheError;

/// Environment variable an app sets to opt out of log forwarding.
pub const OPT_OUT_VARIABLE: &str = "F2S_DISABLE_LOGGING";

/// Organizational context of an application.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct App {
    pub guid: String,
    pub name: String,
    pub space_guid: String,
    pub space_name: String,
    pub org_guid: String,
    pub org_name: String,
    pub ignored_app: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Org {
    pub guid: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Space {
    pub guid: String,
    pub name: String,
    pub org_guid: String,
}

/// An app as listed in a space summary.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct AppSummary {
    pub guid: String,
    pub name: String,
    pub environment: HashMap<String, serde_json::Value>,
}

impl AppSummary {
    #[must_use]
    pub fn is_opt_out(&self) -> bool {
        is_opt_out(&self.environment)
    }
}

/// Whether the app environment asks for its logs not to be forwarded.
#[must_use]
pub fn is_opt_out(environment: &HashMap<String, serde_json::Value>) -> bool {
    match environment.get(OPT_OUT_VARIABLE) {
        Some(serde_json::Value::String(value)) => value == "true",
        Some(serde_json::Value::Bool(value)) => *value,
        _ => false,
    }
}

/// Parses `guid` and returns its lowercase hyphenated form.
pub fn canonical_guid(guid: &str) -> Result<String, CacheError> {
    uuid::Uuid::parse_str(guid.trim())
        .map(|parsed| parsed.hyphenated().to_string())
        .map_err(|_| CacheError::InvalidGuid(guid.to_string()))
}

/// Removes the first matching suffix from `name`.
#[must_use]
pub fn strip_suffixes(name: &str, suffixes: &[String]) -> String {
    suffixes
        .iter()
        .filter(|suffix| !suffix.is_empty())
        .find_map(|suffix| name.strip_suffix(suffix.as_str()))
        .unwrap_or(name)
        .to_string()
}

pub const EXPIRY_FACTOR_MIN: f64 = 2.0;
pub const EXPIRY_FACTOR_MAX: f64 = 2.5;

/// Durable record of one app. `expires_at` is in milliseconds since the epoch; `None` never
/// expires.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub app: App,
    pub expires_at: Option<u64>,
}

impl CacheEntry {
    /// Wraps `app` with an expiry of `ttl` scaled by a random factor in
    /// [`EXPIRY_FACTOR_MIN`, `EXPIRY_FACTOR_MAX`]. `ttl` is the invalidation period, so an entry
    /// outlives the next invalidation and the populate that refreshes it. A zero `ttl` never
    /// expires.
    #[must_use]
    pub fn new(app: App, ttl: Duration) -> Self {
        let expires_at = if ttl.is_zero() {
            None
        } else {
            let factor =
                EXPIRY_FACTOR_MIN + fastrand::f64() * (EXPIRY_FACTOR_MAX - EXPIRY_FACTOR_MIN);
            let jittered = ttl.mul_f64(factor);
            Some(millis_since_epoch(SystemTime::now() + jittered))
        };
        CacheEntry { app, expires_at }
    }

    #[must_use]
    pub fn is_expired(&self, now: SystemTime) -> bool {
        match self.expires_at {
            Some(expires_at) => millis_since_epoch(now) >= expires_at,
            None => false,
        }
    }
}

fn millis_since_epoch(time: SystemTime) -> u64 {
    time.duration_since(UNIX_EPOCH)
        .map(|elapsed| u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}
