// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Streaming session against the RLP gateway.
//!
//! The gateway serves the firehose as server-sent events. Each `data:` frame carries a JSON batch of
//! v2 envelopes which are converted to typed [`Envelope`]s and handed to the nozzle over a bounded
//! channel. Transport failures are reported on a separate channel; the session reconnects on its
//! own and only gives up on a policy violation or after too many consecutive failures.

use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use reqwest::header::{ACCEPT, AUTHORIZATION};
use reqwest::{Client, StatusCode, Url};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::conversion::{to_envelopes, V2Batch};
use crate::envelope::Envelope;
use crate::errors::TransportError;
use crate::uaa::TokenRefresher;

const READ_PATH: &str = "/v2/read";
const SELECTORS: [&str; 5] = ["log", "counter", "gauge", "timer", "event"];
const DEFAULT_CHANNEL_SIZE: usize = 100;

/// Receiving halves of a streaming session. Both must be drained.
#[derive(Debug)]
pub struct EnvelopeStream {
    pub envelopes: mpsc::Receiver<Envelope>,
    pub errors: mpsc::Receiver<TransportError>,
}

/// Opens firehose subscriptions. The session runs until `cancel_token` fires or it hits a
/// non-retryable error, after which both channels close.
pub trait Streamer: Send + Sync {
    fn stream(&self, subscription_id: &str, cancel_token: CancellationToken) -> EnvelopeStream;
}

#[derive(Debug, Clone, Copy)]
pub struct RlpConfig {
    pub idle_timeout: Duration,
    pub min_retry_delay: Duration,
    pub max_retry_delay: Duration,
    pub max_retry_count: u32,
    pub channel_size: usize,
    pub skip_ssl_validation: bool,
}

impl Default for RlpConfig {
    fn default() -> Self {
        RlpConfig {
            idle_timeout: Duration::from_secs(25),
            min_retry_delay: Duration::from_millis(500),
            max_retry_delay: Duration::from_secs(60),
            max_retry_count: 1000,
            channel_size: DEFAULT_CHANNEL_SIZE,
            skip_ssl_validation: false,
        }
    }
}

/// Exponential reconnect delay between `min_delay` and `max_delay`.
#[derive(Debug)]
pub struct BackoffState {
    min_delay: Duration,
    max_delay: Duration,
    factor: f64,
    error_count: u32,
}

impl BackoffState {
    #[must_use]
    pub fn new(min_delay: Duration, max_delay: Duration) -> Self {
        BackoffState {
            min_delay,
            max_delay: max_delay.max(min_delay),
            factor: 2.0,
            error_count: 0,
        }
    }

    /// Registers a failure and returns the delay before the next attempt.
    pub fn register_error(&mut self) -> Duration {
        self.error_count = self.error_count.saturating_add(1);
        // capped so powi cannot overflow
        let exponent = self.error_count.saturating_sub(1).min(64) as i32;
        let delay = self.min_delay.as_secs_f64() * self.factor.powi(exponent);
        Duration::from_secs_f64(delay.min(self.max_delay.as_secs_f64()))
    }

    pub fn register_success(&mut self) {
        self.error_count = 0;
    }

    #[must_use]
    pub fn error_count(&self) -> u32 {
        self.error_count
    }
}

fn classify_status(status: StatusCode) -> Result<(), TransportError> {
    if status.is_success() {
        return Ok(());
    }
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(TransportError::Unauthorized),
        StatusCode::GONE | StatusCode::TOO_MANY_REQUESTS => Err(TransportError::PolicyViolation(
            format!("gateway returned {}", status.as_u16()),
        )),
        _ => Err(TransportError::Http(status.as_u16())),
    }
}

/// One parsed server-sent event.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
struct SseEvent {
    event: Option<String>,
    data: String,
}

/// Line-oriented server-sent-events decoder.
#[derive(Debug, Default)]
struct SseDecoder {
    buffer: Vec<u8>,
    pending: SseEvent,
    has_data: bool,
}

impl SseDecoder {
    /// Feeds raw bytes, returning every event completed by them.
    fn push(&mut self, chunk: &[u8]) -> Vec<SseEvent> {
        self.buffer.extend_from_slice(chunk);
        let mut events = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let raw: Vec<u8> = self.buffer.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&raw);
            let line = line.trim_end_matches(['\n', '\r']);
            if line.is_empty() {
                if self.has_data || self.pending.event.is_some() {
                    events.push(std::mem::take(&mut self.pending));
                }
                self.has_data = false;
                continue;
            }
            if line.starts_with(':') {
                continue;
            }
            let (field, value) = match line.split_once(':') {
                Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
                None => (line, ""),
            };
            match field {
                "event" => self.pending.event = Some(value.to_string()),
                "data" => {
                    if self.has_data {
                        self.pending.data.push('\n');
                    }
                    self.pending.data.push_str(value);
                    self.has_data = true;
                }
                _ => {}
            }
        }
        events
    }
}

/// Firehose subscription against the RLP gateway.
#[derive(Clone)]
pub struct RlpStreamer {
    client: Client,
    endpoint: String,
    token_refresher: Arc<dyn TokenRefresher>,
    config: RlpConfig,
}

impl std::fmt::Debug for RlpStreamer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RlpStreamer")
            .field("endpoint", &self.endpoint)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl RlpStreamer {
    pub fn new(
        endpoint: impl Into<String>,
        token_refresher: Arc<dyn TokenRefresher>,
        config: RlpConfig,
    ) -> Result<Self, TransportError> {
        let client = Client::builder()
            .danger_accept_invalid_certs(config.skip_ssl_validation)
            .build()
            .map_err(|e| TransportError::Io(e.to_string()))?;
        Ok(RlpStreamer {
            client,
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            token_refresher,
            config,
        })
    }

    fn read_url(&self, subscription_id: &str) -> Result<Url, TransportError> {
        let mut url = Url::parse(&format!("{}{READ_PATH}", self.endpoint))
            .map_err(|e| TransportError::Io(e.to_string()))?;
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("shard_id", subscription_id);
            for selector in SELECTORS {
                query.append_key_only(selector);
            }
        }
        Ok(url)
    }

    async fn run_session(
        self,
        subscription_id: String,
        envelopes: mpsc::Sender<Envelope>,
        errors: mpsc::Sender<TransportError>,
        cancel_token: CancellationToken,
    ) {
        let url = match self.read_url(&subscription_id) {
            Ok(url) => url,
            Err(e) => {
                let _ = errors.send(e).await;
                return;
            }
        };
        let mut backoff = BackoffState::new(self.config.min_retry_delay, self.config.max_retry_delay);
        let mut token: Option<String> = None;

        loop {
            let result = tokio::select! {
                result = self.read_stream(&url, &mut token, &envelopes, &errors, &mut backoff) => result,
                () = cancel_token.cancelled() => {
                    debug!("Streaming session for {subscription_id} cancelled");
                    return;
                }
            };
            let error = match result {
                Ok(()) if envelopes.is_closed() => return,
                Ok(()) => TransportError::NormalClosure,
                Err(e) => e,
            };
            if error == TransportError::Unauthorized {
                token = None;
            }
            if !error.is_retryable() {
                let _ = errors.send(error).await;
                return;
            }

            let delay = backoff.register_error();
            if errors.send(error).await.is_err() {
                return;
            }
            if backoff.error_count() >= self.config.max_retry_count {
                let _ = errors
                    .send(TransportError::RetriesExhausted(backoff.error_count()))
                    .await;
                return;
            }
            tokio::select! {
                () = tokio::time::sleep(delay) => {}
                () = cancel_token.cancelled() => return,
            }
        }
    }

    async fn read_stream(
        &self,
        url: &Url,
        token: &mut Option<String>,
        envelopes: &mpsc::Sender<Envelope>,
        errors: &mpsc::Sender<TransportError>,
        backoff: &mut BackoffState,
    ) -> Result<(), TransportError> {
        let auth = match token {
            Some(auth) => auth.clone(),
            None => {
                let auth = self
                    .token_refresher
                    .refresh_auth_token()
                    .await
                    .map_err(|e| TransportError::Io(e.to_string()))?;
                *token = Some(auth.clone());
                auth
            }
        };

        let response = self
            .client
            .get(url.clone())
            .header(AUTHORIZATION, auth)
            .header(ACCEPT, "text/event-stream")
            .send()
            .await
            .map_err(|e| TransportError::Io(e.to_string()))?;
        classify_status(response.status())?;
        info!("Connected to {}", self.endpoint);

        let mut body = response.bytes_stream();
        let mut decoder = SseDecoder::default();
        loop {
            let chunk = match timeout(self.config.idle_timeout, body.next()).await {
                Err(_) => return Err(TransportError::IdleTimeout),
                Ok(None) => return Ok(()),
                Ok(Some(Err(e))) => return Err(TransportError::Io(e.to_string())),
                Ok(Some(Ok(chunk))) => chunk,
            };
            for event in decoder.push(&chunk) {
                match event.event.as_deref() {
                    Some("heartbeat") => continue,
                    Some("closing") => return Ok(()),
                    _ => {}
                }
                let batch: V2Batch = match serde_json::from_str(&event.data) {
                    Ok(batch) => batch,
                    Err(e) => {
                        warn!("Dropping undecodable batch: {e}");
                        let _ = errors.try_send(TransportError::Decode(e.to_string()));
                        continue;
                    }
                };
                backoff.register_success();
                for v2 in batch.batch {
                    for envelope in to_envelopes(v2) {
                        if envelopes.send(envelope).await.is_err() {
                            return Ok(());
                        }
                    }
                }
            }
        }
    }
}

impl Streamer for RlpStreamer {
    fn stream(&self, subscription_id: &str, cancel_token: CancellationToken) -> EnvelopeStream {
        let channel_size = self.config.channel_size.max(1);
        let (envelope_tx, envelope_rx) = mpsc::channel(channel_size);
        let (error_tx, error_rx) = mpsc::channel(channel_size);
        tokio::spawn(self.clone().run_session(
            subscription_id.to_string(),
            envelope_tx,
            error_tx,
            cancel_token,
        ));
        EnvelopeStream {
            envelopes: envelope_rx,
            errors: error_rx,
        }
    }
}
