// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Bulk population of the app bucket.
//!
//! Orgs are enumerated first, then one task per org lists its spaces and one task per space
//! fetches its app summary. The client rate-limits each request it sends. Apps are written to
//! the store space by space; the final map is read back from the store so a failed branch only
//! loses that branch.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::app::{canonical_guid, strip_suffixes, App, AppSummary, CacheEntry, Org, Space};
use crate::client::AppClient;
use crate::errors::{CacheError, ClientError, StoreError};
use crate::store::KvStore;

pub const APP_BUCKET: &str = "AppBucket";

#[derive(Clone)]
pub struct BulkPopulator {
    client: Arc<dyn AppClient>,
    store: Arc<dyn KvStore>,
    ttl: Duration,
    strip_app_suffixes: Arc<[String]>,
    cancel_token: CancellationToken,
}

impl BulkPopulator {
    pub fn new(
        client: Arc<dyn AppClient>,
        store: Arc<dyn KvStore>,
            ttl: Duration,
        strip_app_suffixes: Vec<String>,
        cancel_token: CancellationToken,
    ) -> Self {
        BulkPopulator {
            client,
            store,
            ttl,
            strip_app_suffixes: strip_app_suffixes.into(),
            cancel_token,
        }
    }

    /// Applies name suffix stripping and canonicalises the guid.
    pub fn normalise(&self, mut app: App) -> App {
        if let Ok(guid) = canonical_guid(&app.guid) {
            app.guid = guid;
        }
        app.name = strip_suffixes(&app.name, &self.strip_app_suffixes);
        app
    }

    /// Writes one app through to the store, returning the entry that was written.
    pub fn write_through(&self, app: App) -> Result<CacheEntry, StoreError> {
        let entry = CacheEntry::new(app, self.ttl);
        let value = serde_json::to_vec(&entry)?;
        self.store.put(APP_BUCKET, &entry.app.guid, &value)?;
        Ok(entry)
    }

    /// Loads every unexpired entry from the store.
    pub fn read_back(&self) -> Result<HashMap<String, CacheEntry>, StoreError> {
        let now = SystemTime::now();
        let mut apps = HashMap::new();
        self.store.for_each(APP_BUCKET, &mut |key, value| {
            match serde_json::from_slice::<CacheEntry>(value) {
                Ok(entry) if !entry.is_expired(now) => {
                    apps.insert(key.to_string(), entry);
                }
                Ok(_) => {}
                Err(e) => warn!("Skipping undecodable cache entry {key}: {e}"),
            }
        })?;
        Ok(apps)
    }

    /// Fetches every app from the remote API and returns the refreshed contents of the store.
    pub async fn populate(&self) -> Result<HashMap<String, CacheEntry>, CacheError> {
        let orgs = self.client.list_orgs().await?;
        debug!("Populating apps from {} orgs", orgs.len());

        let mut org_tasks = JoinSet::new();
        for org in orgs {
            let populator = self.clone();
            org_tasks.spawn(async move {
                let org_guid = org.guid.clone();
                (org_guid, populator.populate_org(org).await)
            });
        }
        let mut written = 0;
        while let Some(result) = org_tasks.join_next().await {
            match result {
                Ok((_, Ok(count))) => written += count,
                Ok((org_guid, Err(e))) => warn!("Failed to list spaces of org {org_guid}: {e}"),
                Err(e) => error!("Org population task failed: {e}"),
            }
        }
        debug!("Wrote {written} apps to the store");

        Ok(self.read_back()?)
    }

    async fn populate_org(&self, org: Org) -> Result<usize, ClientError> {
        if self.cancel_token.is_cancelled() {
            return Ok(0);
        }
        let spaces = self.client.org_spaces(&org.guid).await?;

        let mut space_tasks = JoinSet::new();
        for space in spaces {
            let populator = self.clone();
            let org = org.clone();
            space_tasks.spawn(async move {
                let space_guid = space.guid.clone();
                (space_guid, populator.populate_space(&org, space).await)
            });
        }
        let mut written = 0;
        while let Some(result) = space_tasks.join_next().await {
            match result {
                Ok((_, Ok(count))) => written += count,
                Ok((space_guid, Err(e))) => {
                    warn!("Failed to fetch summary of space {space_guid}: {e}");
                }
                Err(e) => error!("Space population task failed: {e}"),
            }
        }
        Ok(written)
    }

    async fn populate_space(&self, org: &Org, space: Space) -> Result<usize, ClientError> {
        if self.cancel_token.is_cancelled() {
            return Ok(0);
        }
        let summaries = self.client.space_summary(&space.guid).await?;

        let mut written = 0;
        for summary in summaries {
            let app = self.normalise(app_from_summary(org, &space, summary));
            match self.write_through(app) {
                Ok(_) => written += 1,
                Err(e) => warn!("Failed to store app of space {}: {e}", space.guid),
            }
        }
        Ok(written)
    }
}

fn app_from_summary(org: &Org, space: &Space, summary: AppSummary) -> App {
    let ignored_app = summary.is_opt_out();
    App {
        guid: summary.guid,
        name: summary.name,
        space_guid: space.guid.clone(),
        space_name: space.name.clone(),
        org_guid: org.guid.clone(),
        org_name: org.name.clone(),
        ignored_app,
    }
}
