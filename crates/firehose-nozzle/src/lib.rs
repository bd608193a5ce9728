// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Firehose ingestion: typed envelopes, the envelope diode, and the nozzle that moves envelopes
//! from a streaming session to an event router.
//!
//! - [`rlp`]: streaming session against the RLP gateway
//! - [`diode`]: lock-free single-producer/single-consumer ring buffer
//! - [`nozzle`]: producer/consumer tasks and the stop/drain state machine
//! - [`stats`]: atomic pipeline counters

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

pub mod conversion;
pub mod diode;
pub mod envelope;
pub mod errors;
pub mod nozzle;
pub mod rlp;
pub mod stats;
pub mod uaa;

pub use diode::{Alerter, Diode};
pub use envelope::{Envelope, Event, EventType};
pub use errors::{NozzleError, TransportError};
pub use nozzle::{EventRouter, Nozzle, NozzleConfig, NozzleState};
pub use rlp::{EnvelopeStream, RlpConfig, RlpStreamer, Streamer};
pub use stats::{Stats, StatsSnapshot, StatsType};
pub use uaa::{TokenRefresher, UaaTokenRefresher};
