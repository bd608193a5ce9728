// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use thiserror::Error;

/// Failures talking to the Cloud Controller.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("unexpected status code: {0}")]
    Status(u16),

    #[error("resource not found")]
    NotFound,

    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("failed to decode response: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("failed to obtain token: {0}")]
    Token(String),
}

/// Failures of the durable key/value store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Db(#[from] sled::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("store is closed")]
    Closed,

    #[error("bucket {0} does not exist")]
    BucketNotFound(String),

    #[error("filesystem error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("app {0} not found")]
    NotFound(String),

    #[error("invalid guid {0:?}")]
    InvalidGuid(String),

    #[error("upstream error: {0}")]
    Upstream(#[from] ClientError),

    #[error("storage error: {0}")]
    Storage(#[from] StoreError),
}
