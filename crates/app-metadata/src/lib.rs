// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Resolves application guids to their name, space and org.

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

pub mod app;
pub mod cache;
pub mod client;
pub mod errors;
pub mod populate;
pub mod rate_limit;
pub mod store;

pub use app::{App, AppSummary, CacheEntry, Org, Space};
pub use cache::{AppCache, AppResolver, CacheConfig, EmptyResolver, MISSING_APP_BUCKET};
pub use client::{discover_info, ApiInfo, AppClient, CfClient};
pub use errors::{CacheError, ClientError, StoreError};
pub use populate::{BulkPopulator, APP_BUCKET};
pub use rate_limit::RateLimiter;
pub use store::{KvStore, MemoryStore, SledStore};
