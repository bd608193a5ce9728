// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{anyhow, Result};
use app_metadata::CacheConfig;
use firehose_nozzle::diode::MAX_CAPACITY;
use firehose_nozzle::{NozzleConfig, RlpConfig};
use tracing::warn;

pub const ENV_LOG_LEVEL: &str = "FIREHOSE_LOG_LEVEL";
const DEFAULT_LOG_LEVEL: &str = "info";

#[derive(Debug, Clone)]
pub struct Config {
    pub api_endpoint: String,
    pub client_id: String,
    pub client_secret: String,
    pub rlp_endpoint: Option<String>,
    pub uaa_endpoint: Option<String>,
    pub subscription_id: String,
    pub skip_ssl_validation: bool,
    pub keep_alive: Duration,
    pub min_retry_delay: Duration,
    pub max_retry_delay: Duration,
    pub max_retry_count: u32,
    pub buffer_size: usize,
    pub events: String,
    pub boltdb_path: PathBuf,
    pub cc_pull_time: Duration,
    pub cc_rps: u32,
    pub ignore_missing_apps: bool,
    pub missing_app_cache_ttl: Duration,
    pub strip_app_name_suffixes: Vec<String>,
    pub extra_fields: String,
    pub cf_orgs: String,
    pub cf_spaces: String,
    pub log_event_totals_time: Duration,
    pub log_level: String,
    pub drain_timeout: Duration,
}

impl Config {
    /// Reads the configuration from the environment. Missing required variables are an error;
    /// invalid optional values fall back to their defaults.
    pub fn from_env() -> Result<Config> {
        Ok(Config {
            api_endpoint: required("API_ENDPOINT")?
                .trim_end_matches('/')
                .to_string(),
            client_id: required("FIREHOSE_CLIENT_ID")?,
            client_secret: required("FIREHOSE_CLIENT_SECRET")?,
            rlp_endpoint: optional("RLP_ENDPOINT"),
            uaa_endpoint: optional("UAA_ENDPOINT"),
            subscription_id: optional("FIREHOSE_SUBSCRIPTION_ID")
                .unwrap_or_else(|| "firehose".to_string()),
            skip_ssl_validation: parsed("SKIP_SSL_VALIDATION", false),
            keep_alive: duration("FH_KEEP_ALIVE", Duration::from_secs(25)),
            min_retry_delay: duration("MIN_RETRY_DELAY", Duration::from_millis(500)),
            max_retry_delay: duration("MAX_RETRY_DELAY", Duration::from_secs(60)),
            max_retry_count: parsed("MAX_RETRY_COUNT", 1000),
            buffer_size: buffer_size("LOGS_BUFFER_SIZE", 10_000),
            events: optional("EVENTS").unwrap_or_else(|| "LogMessage".to_string()),
            boltdb_path: optional("BOLTDB_PATH")
                .unwrap_or_else(|| "my.db".to_string())
                .into(),
            cc_pull_time: duration("CF_PULL_TIME", Duration::from_secs(60)),
            cc_rps: parsed("CF_RPS", 50),
            ignore_missing_apps: parsed("IGNORE_MISSING_APPS", false),
            missing_app_cache_ttl: duration("MISSING_APP_CACHE_TTL", Duration::from_secs(3600)),
            strip_app_name_suffixes: optional("STRIP_APP_NAME_SUFFIXES")
                .map(|suffixes| {
                    suffixes
                        .split(',')
                        .map(str::trim)
                        .filter(|suffix| !suffix.is_empty())
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or_default(),
            extra_fields: optional("EXTRA_FIELDS").unwrap_or_default(),
            cf_orgs: optional("CF_ORGS").unwrap_or_default(),
            cf_spaces: optional("CF_SPACES").unwrap_or_default(),
            log_event_totals_time: duration("LOG_EVENT_TOTALS_TIME", Duration::ZERO),
            log_level: log_level(),
            drain_timeout: duration("DRAIN_TIMEOUT", Duration::from_secs(30)),
        })
    }

    /// The RLP gateway: `RLP_ENDPOINT`, or the API endpoint with `api.` swapped for `log-stream.`.
    #[must_use]
    pub fn rlp_endpoint(&self) -> String {
        match &self.rlp_endpoint {
            Some(endpoint) => endpoint.clone(),
            None => self.api_endpoint.replacen("api.", "log-stream.", 1),
        }
    }

    #[must_use]
    pub fn rlp_config(&self) -> RlpConfig {
        RlpConfig {
            idle_timeout: self.keep_alive,
            min_retry_delay: self.min_retry_delay,
            max_retry_delay: self.max_retry_delay,
            max_retry_count: self.max_retry_count,
            skip_ssl_validation: self.skip_ssl_validation,
            ..RlpConfig::default()
        }
    }

    #[must_use]
    pub fn nozzle_config(&self) -> NozzleConfig {
        NozzleConfig {
            subscription_id: self.subscription_id.clone(),
            buffer_size: self.buffer_size,
            ..NozzleConfig::default()
        }
    }

    #[must_use]
    pub fn cache_config(&self) -> CacheConfig {
        CacheConfig {
            cache_invalidate_ttl: self.cc_pull_time,
            ignore_missing_apps: self.ignore_missing_apps,
            missing_app_cache_ttl: self.missing_app_cache_ttl,
            strip_app_suffixes: self.strip_app_name_suffixes.clone(),
        }
    }
}

/// The tracing filter directive, lower-cased. Read on its own so logging can start before the
/// rest of the configuration is validated.
#[must_use]
pub fn log_level() -> String {
    optional(ENV_LOG_LEVEL)
        .map(|level| level.to_lowercase())
        .unwrap_or_else(|| DEFAULT_LOG_LEVEL.to_string())
}

fn optional(name: &str) -> Option<String> {
    env::var(name)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn required(name: &str) -> Result<String> {
    optional(name).ok_or_else(|| anyhow!("{name} must be set"))
}

fn parsed<T: FromStr>(name: &str, default: T) -> T {
    let Some(value) = optional(name) else {
        return default;
    };
    match value.to_lowercase().parse() {
        Ok(parsed) => parsed,
        Err(_) => {
            warn!("Invalid value {value:?} for {name}, using the default");
            default
        }
    }
}

fn positive(name: &str, default: usize) -> usize {
    match parsed(name, default) {
        0 => {
            warn!("{name} must be greater than zero, using the default");
            default
        }
        value => value,
    }
}

fn buffer_size(name: &str, default: usize) -> usize {
    let size = positive(name, default);
    if size > MAX_CAPACITY {
        warn!("{name} is larger than {MAX_CAPACITY}, using {MAX_CAPACITY}");
        return MAX_CAPACITY;
    }
    size
}

fn duration(name: &str, default: Duration) -> Duration {
    let Some(value) = optional(name) else {
        return default;
    };
    match humantime::parse_duration(&value) {
        Ok(parsed) => parsed,
        Err(e) => {
            warn!("Invalid duration {value:?} for {name}, using the default: {e}");
            default
        }
    }
}
