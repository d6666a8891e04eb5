// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Shared counter/queue store.
//!
//! Every rate-limit window, queue lane and blob-cache entry lives in an
//! external key-value store that offers atomic increment, TTLs and list
//! push/pop. The store is never implemented locally in production; the
//! in-memory variant exists for tests and single-process development.

pub mod memory;
pub mod rest;

pub use memory::MemoryStore;
pub use rest::RestStore;

use async_trait::async_trait;

/// Errors from the key-value store.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    #[error("store unreachable: {0}")]
    Unavailable(String),

    #[error("store protocol error: {0}")]
    Protocol(String),
}

/// Operations the rate limiter, work queue and blob cache need.
///
/// Only single commands are atomic. There is no cross-command transaction,
/// so `incr_by` followed by `expire` is two independent round-trips.
#[async_trait]
pub trait KvStore: Send + Sync {
    /// `INCRBY key amount`, returning the new value.
    async fn incr_by(&self, key: &str, amount: i64) -> Result<i64, StoreError>;

    /// `EXPIRE key seconds`. Returns false when the key does not exist.
    async fn expire(&self, key: &str, seconds: u64) -> Result<bool, StoreError>;

    /// `GET key`.
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    /// `SETEX key seconds value`.
    async fn set_ex(&self, key: &str, seconds: u64, value: &str) -> Result<(), StoreError>;

    /// `DEL key`. Returns true when a key was removed.
    async fn del(&self, key: &str) -> Result<bool, StoreError>;

    /// `RPUSH key value`, returning the new list length.
    async fn rpush(&self, key: &str, value: &str) -> Result<u64, StoreError>;

    /// `LPUSH key value`, returning the new list length.
    async fn lpush(&self, key: &str, value: &str) -> Result<u64, StoreError>;

    /// `LPOP key`. Never blocks; `None` when the list is empty.
    async fn lpop(&self, key: &str) -> Result<Option<String>, StoreError>;

    /// `LLEN key`.
    async fn llen(&self, key: &str) -> Result<u64, StoreError>;

    /// `LRANGE key start stop` (inclusive, negative indexes count from the end).
    async fn lrange(&self, key: &str, start: i64, stop: i64) -> Result<Vec<String>, StoreError>;
}
