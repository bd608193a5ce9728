// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Bucket-oriented key/value stores backing the app cache.
//!
//! Buckets map to sled trees. Values are opaque bytes; the cache stores JSON-encoded
//! [`CacheEntry`](crate::app::CacheEntry) records.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{PoisonError, RwLock};

use sled::{Config as SledConfig, Db};
use tracing::debug;

use crate::errors::StoreError;

/// Durable store contract. Implementations must allow concurrent readers and writers.
pub trait KvStore: Send + Sync {
    fn open(&self) -> Result<(), StoreError>;

    /// Flushes and releases the store. Every later call fails with [`StoreError::Closed`].
    fn close(&self) -> Result<(), StoreError>;

    fn create_bucket_if_not_exists(&self, bucket: &str) -> Result<(), StoreError>;

    /// Removes every key of `bucket`. The bucket stays usable throughout.
    fn clear_bucket(&self, bucket: &str) -> Result<(), StoreError>;

    fn get(&self, bucket: &str, key: &str) -> Result<Option<Vec<u8>>, StoreError>;

    fn put(&self, bucket: &str, key: &str, value: &[u8]) -> Result<(), StoreError>;

    /// Visits every key/value pair in `bucket`, in key order.
    fn for_each(
        &self,
        bucket: &str,
        visit: &mut dyn FnMut(&str, &[u8]),
    ) -> Result<(), StoreError>;
}

/// sled-backed [`KvStore`].
#[derive(Debug)]
pub struct SledStore {
    path: PathBuf,
    db: RwLock<Option<Db>>,
}

impl SledStore {
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        SledStore {
            path: path.into(),
            db: RwLock::new(None),
        }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn with_db<T>(&self, f: impl FnOnce(&Db) -> Result<T, StoreError>) -> Result<T, StoreError> {
        let guard = self.db.read().unwrap_or_else(PoisonError::into_inner);
        match guard.as_ref() {
            Some(db) => f(db),
            None => Err(StoreError::Closed),
        }
    }

    fn bucket_exists(db: &Db, bucket: &str) -> bool {
        db.tree_names()
            .iter()
            .any(|name| name.as_ref() == bucket.as_bytes())
    }
}

fn sled_config(path: &Path) -> SledConfig {
    SledConfig::new().path(path).cache_capacity(16 * 1024 * 1024)
}

impl KvStore for SledStore {
    fn open(&self) -> Result<(), StoreError> {
        let mut guard = self.db.write().unwrap_or_else(PoisonError::into_inner);
        if guard.is_some() {
            return Ok(());
        }
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                // sled does not create intermediate directories
                fs::create_dir_all(parent)?;
            }
        }
        debug!("Opening app store at {}", self.path.display());
        *guard = Some(sled_config(&self.path).open()?);
        Ok(())
    }

    fn close(&self) -> Result<(), StoreError> {
        let mut guard = self.db.write().unwrap_or_else(PoisonError::into_inner);
        match guard.take() {
            Some(db) => {
                db.flush()?;
                debug!("Closed app store at {}", self.path.display());
                Ok(())
            }
            None => Ok(()),
        }
    }

    fn create_bucket_if_not_exists(&self, bucket: &str) -> Result<(), StoreError> {
        self.with_db(|db| {
            db.open_tree(bucket)?;
            Ok(())
        })
    }

    fn clear_bucket(&self, bucket: &str) -> Result<(), StoreError> {
        self.with_db(|db| {
            if !Self::bucket_exists(db, bucket) {
                return Err(StoreError::BucketNotFound(bucket.to_string()));
            }
            db.open_tree(bucket)?.clear()?;
            Ok(())
        })
    }

    fn get(&self, bucket: &str, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        self.with_db(|db| {
            if !Self::bucket_exists(db, bucket) {
                return Err(StoreError::BucketNotFound(bucket.to_string()));
            }
            Ok(db.open_tree(bucket)?.get(key)?.map(|value| value.to_vec()))
        })
    }

    fn put(&self, bucket: &str, key: &str, value: &[u8]) -> Result<(), StoreError> {
        self.with_db(|db| {
            if !Self::bucket_exists(db, bucket) {
                return Err(StoreError::BucketNotFound(bucket.to_string()));
            }
            db.open_tree(bucket)?.insert(key, value)?;
            Ok(())
        })
    }

    fn for_each(
        &self,
        bucket: &str,
        visit: &mut dyn FnMut(&str, &[u8]),
    ) -> Result<(), StoreError> {
        self.with_db(|db| {
            if !Self::bucket_exists(db, bucket) {
                return Err(StoreError::BucketNotFound(bucket.to_string()));
            }
            for result in db.open_tree(bucket)?.iter() {
                let (key, value) = result?;
                visit(&String::from_utf8_lossy(&key), &value);
            }
            Ok(())
        })
    }
}

type Buckets = HashMap<String, BTreeMap<String, Vec<u8>>>;

/// Non-durable [`KvStore`]. Contents survive `close`/`open` cycles of the same instance.
#[derive(Debug, Default)]
pub struct MemoryStore {
    buckets: RwLock<Buckets>,
    open: RwLock<bool>,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn check_open(&self) -> Result<(), StoreError> {
        if *self.open.read().unwrap_or_else(PoisonError::into_inner) {
            Ok(())
        } else {
            Err(StoreError::Closed)
        }
    }
}

impl KvStore for MemoryStore {
    fn open(&self) -> Result<(), StoreError> {
        *self.open.write().unwrap_or_else(PoisonError::into_inner) = true;
        Ok(())
    }

    fn close(&self) -> Result<(), StoreError> {
        *self.open.write().unwrap_or_else(PoisonError::into_inner) = false;
        Ok(())
    }

    fn create_bucket_if_not_exists(&self, bucket: &str) -> Result<(), StoreError> {
        self.check_open()?;
        self.buckets
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(bucket.to_string())
            .or_default();
        Ok(())
    }

    fn clear_bucket(&self, bucket: &str) -> Result<(), StoreError> {
        self.check_open()?;
        self.buckets
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .get_mut(bucket)
            .ok_or_else(|| StoreError::BucketNotFound(bucket.to_string()))?
            .clear();
        Ok(())
    }

    fn get(&self, bucket: &str, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        self.check_open()?;
        let buckets = self.buckets.read().unwrap_or_else(PoisonError::into_inner);
        let bucket = buckets
            .get(bucket)
            .ok_or_else(|| StoreError::BucketNotFound(bucket.to_string()))?;
        Ok(bucket.get(key).cloned())
    }

    fn put(&self, bucket: &str, key: &str, value: &[u8]) -> Result<(), StoreError> {
        self.check_open()?;
        let mut buckets = self.buckets.write().unwrap_or_else(PoisonError::into_inner);
        let bucket = buckets
            .get_mut(bucket)
            .ok_or_else(|| StoreError::BucketNotFound(bucket.to_string()))?;
        bucket.insert(key.to_string(), value.to_vec());
        Ok(())
    }

    fn for_each(
        &self,
        bucket: &str,
        visit: &mut dyn FnMut(&str, &[u8]),
    ) -> Result<(), StoreError> {
        self.check_open()?;
        let buckets = self.buckets.read().unwrap_or_else(PoisonError::into_inner);
        let bucket = buckets
            .get(bucket)
            .ok_or_else(|| StoreError::BucketNotFound(bucket.to_string()))?;
        for (key, value) in bucket {
            visit(key, value);
        }
        Ok(())
    }
}
