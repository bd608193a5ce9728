// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Turns firehose envelopes into enriched, filtered events and ships them to a [`Sink`].

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

pub mod event;
pub mod filters;
pub mod router;
pub mod setup;
pub mod sink;

pub use event::{Event, Fields};
pub use filters::{
    has_ignore_field, not_in_certain_orgs, not_in_certain_spaces, parse_space_filters, EventFilter,
};
pub use router::{Router, TOTALS_EVENT_TYPE};
pub use setup::{authorized_events, cache_needed, parse_extra_fields, setup_event_routing, SetupError};
pub use sink::{JsonLinesSink, Sink, SinkError};
