// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The nozzle owns one firehose subscription and moves its envelopes through the diode to the
//! router.
//!
//! Two long-lived tasks run while streaming. The producer drains the session channels into the
//! diode and the consumer polls the diode and routes each envelope. The diode is the only state
//! the two tasks share besides the atomic stats counters.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{oneshot, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::diode::Diode;
use crate::envelope::{Envelope, EventType};
use crate::errors::{NozzleError, TransportError};
use crate::rlp::{EnvelopeStream, Streamer};
use crate::stats::{Stats, StatsType};

const DEFAULT_IDLE_POLL: Duration = Duration::from_millis(1);

/// Receives every envelope the consumer pulls out of the diode.
#[async_trait]
pub trait EventRouter: Send + Sync {
    /// Annotates, filters and ships one envelope. Failures are handled by the router.
    async fn route_event(&self, envelope: Envelope);

    /// Event types the producer lets into the diode.
    fn selected_events(&self) -> HashSet<EventType>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NozzleState {
    Idle,
    Streaming,
    Stopping,
    Draining,
    Stopped,
    /// The session hit a non-retryable transport error.
    Errored,
}

#[derive(Debug, Clone)]
pub struct NozzleConfig {
    pub subscription_id: String,
    /// Diode capacity, rounded up to a power of two.
    pub buffer_size: usize,
    /// Consumer sleep when the diode is empty.
    pub idle_poll: Duration,
}

impl Default for NozzleConfig {
    fn default() -> Self {
        NozzleConfig {
            subscription_id: "firehose".to_string(),
            buffer_size: 10000,
            idle_poll: DEFAULT_IDLE_POLL,
        }
    }
}

pub struct Nozzle {
    config: NozzleConfig,
    streamer: Arc<dyn Streamer>,
    router: Arc<dyn EventRouter>,
    stats: Arc<Stats>,
    diode: Arc<Diode<Envelope>>,
    state: Arc<RwLock<NozzleState>>,
    cancel_token: CancellationToken,
    producer: Option<JoinHandle<()>>,
    consumer: Option<JoinHandle<()>>,
}

impl std::fmt::Debug for Nozzle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Nozzle")
            .field("config", &self.config)
            .field("diode", &self.diode)
            .finish_non_exhaustive()
    }
}

impl Nozzle {
    pub fn new(
        config: NozzleConfig,
        streamer: Arc<dyn Streamer>,
        router: Arc<dyn EventRouter>,
        stats: Arc<Stats>,
    ) -> Self {
        let alert_stats = Arc::clone(&stats);
        let diode = Diode::new(config.buffer_size, move |missed: u64| {
            alert_stats.add(StatsType::Missed, missed);
            alert_stats.sub(StatsType::SubInputBuffer, missed);
            warn!("Dropped {missed} envelopes, the consumer is falling behind");
        });
        Nozzle {
            config,
            streamer,
            router,
            stats,
            diode: Arc::new(diode),
            state: Arc::new(RwLock::new(NozzleState::Idle)),
            cancel_token: CancellationToken::new(),
            producer: None,
            consumer: None,
        }
    }

    pub async fn state(&self) -> NozzleState {
        *self.state.read().await
    }

    #[must_use]
    pub fn stats(&self) -> Arc<Stats> {
        Arc::clone(&self.stats)
    }

    /// Opens the streaming session and launches the producer and consumer tasks.
    ///
    /// The returned receiver resolves if the session fails with a non-retryable error. It is
    /// closed without a value when the nozzle is stopped normally.
    pub async fn start(&mut self) -> Result<oneshot::Receiver<NozzleError>, NozzleError> {
        let mut state = self.state.write().await;
        if *state != NozzleState::Idle {
            return Err(NozzleError::AlreadyStarted);
        }

        let stream = self
            .streamer
            .stream(&self.config.subscription_id, self.cancel_token.child_token());
        let selected = self.router.selected_events();
        let (fatal_tx, fatal_rx) = oneshot::channel();

        self.producer = Some(tokio::spawn(produce(
            stream,
            Arc::clone(&self.diode),
            Arc::clone(&self.stats),
            selected,
            Arc::clone(&self.state),
            fatal_tx,
            self.cancel_token.clone(),
        )));
        self.consumer = Some(tokio::spawn(consume(
            Arc::clone(&self.diode),
            Arc::clone(&self.router),
            Arc::clone(&self.stats),
            self.config.idle_poll,
            self.cancel_token.clone(),
        )));

        *state = NozzleState::Streaming;
        info!(
            "Nozzle streaming subscription {} with a buffer of {}",
            self.config.subscription_id,
            self.diode.capacity()
        );
        Ok(fatal_rx)
    }

    /// Stops both tasks and waits for them to exit. Calling it again is a no-op.
    pub async fn stop_reading(&mut self) -> Result<(), NozzleError> {
        {
            let mut state = self.state.write().await;
            match *state {
                NozzleState::Idle => return Err(NozzleError::NotRunning),
                NozzleState::Stopping | NozzleState::Draining | NozzleState::Stopped => {
                    return Ok(())
                }
                NozzleState::Streaming => *state = NozzleState::Stopping,
                NozzleState::Errored => {}
            }
        }

        debug!("Stopping nozzle tasks");
        self.cancel_token.cancel();
        for handle in [self.producer.take(), self.consumer.take()]
            .into_iter()
            .flatten()
        {
            if let Err(e) = handle.await {
                error!("Nozzle task failed: {e}");
            }
        }
        Ok(())
    }

    /// Routes whatever is still buffered, giving up after `deadline`. Returns the number of
    /// envelopes routed.
    pub async fn draining(&mut self, deadline: Duration) -> Result<usize, NozzleError> {
        {
            let mut state = self.state.write().await;
            match *state {
                NozzleState::Stopping | NozzleState::Errored => *state = NozzleState::Draining,
                NozzleState::Idle => return Err(NozzleError::NotRunning),
                NozzleState::Streaming => return Err(NozzleError::StillReading),
                NozzleState::Draining | NozzleState::Stopped => return Ok(0),
            }
        }

        info!("Draining {} buffered envelopes", self.diode.len());
        let mut drained = 0;
        let drain = async {
            while let Some(envelope) = self.diode.try_next() {
                self.stats.dec(StatsType::SubInputBuffer);
                self.router.route_event(envelope).await;
                drained += 1;
            }
        };
        if tokio::time::timeout(deadline, drain).await.is_err() {
            warn!(
                "Drain timed out after {:?}, {} envelopes left behind",
                deadline,
                self.diode.len()
            );
        }

        *self.state.write().await = NozzleState::Stopped;
        info!("Nozzle stopped after draining {drained} envelopes");
        Ok(drained)
    }
}

impl Drop for Nozzle {
    fn drop(&mut self) {
        self.cancel_token.cancel();
    }
}

async fn produce(
    mut stream: EnvelopeStream,
    diode: Arc<Diode<Envelope>>,
    stats: Arc<Stats>,
    selected: HashSet<EventType>,
    state: Arc<RwLock<NozzleState>>,
    fatal_tx: oneshot::Sender<NozzleError>,
    cancel_token: CancellationToken,
) {
    let fatal = loop {
        tokio::select! {
            biased;
            () = cancel_token.cancelled() => {
                debug!("Producer stopped");
                return;
            }
            envelope = stream.envelopes.recv() => {
                let Some(envelope) = envelope else {
                    // session ended: the last non-retryable error, if any, is the cause
                    let mut fatal = TransportError::NormalClosure;
                    while let Some(error) = stream.errors.recv().await {
                        if !error.is_retryable() {
                            fatal = error;
                        }
                    }
                    break fatal;
                };
                stats.inc(StatsType::Consume);
                let event_type = envelope.event_type();
                if selected.contains(&event_type) {
                    stats.inc(StatsType::consume_for(event_type));
                    diode.set(envelope);
                    stats.inc(StatsType::SubInputBuffer);
                } else {
                    stats.inc(StatsType::ConsumeUnknown);
                }
            }
            Some(error) = stream.errors.recv() => {
                if error.is_retryable() {
                    warn!("Streaming session error, reconnecting: {error}");
                    continue;
                }
                break error;
            }
        }
    };

    if matches!(fatal, TransportError::PolicyViolation(_)) {
        stats.inc(StatsType::SlowConsumerAlert);
    }
    error!("Nozzle stopping on fatal error: {fatal}");
    *state.write().await = NozzleState::Errored;
    cancel_token.cancel();
    let _ = fatal_tx.send(NozzleError::Transport(fatal));
}

async fn consume(
    diode: Arc<Diode<Envelope>>,
    router: Arc<dyn EventRouter>,
    stats: Arc<Stats>,
    idle_poll: Duration,
    cancel_token: CancellationToken,
) {
    while !cancel_token.is_cancelled() {
        match diode.try_next() {
            Some(envelope) => {
                stats.dec(StatsType::SubInputBuffer);
                router.route_event(envelope).await;
            }
            None => {
                tokio::select! {
                    () = cancel_token.cancelled() => break,
                    () = tokio::time::sleep(idle_poll) => {}
                }
            }
        }
    }
    debug!("Consumer stopped");
}
