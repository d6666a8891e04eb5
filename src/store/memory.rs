// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! In-process key-value store with Redis-like semantics.
//!
//! Expiry is evaluated lazily against an injectable [`Clock`], so tests can
//! step across window boundaries and TTLs without sleeping.

use super::{KvStore, StoreError};
use crate::time_utils::{SharedClock, SystemClock};
use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

#[derive(Debug, Clone)]
enum SlotValue {
    Text(String),
    List(VecDeque<String>),
}

#[derive(Debug, Clone)]
struct Slot {
    value: SlotValue,
    expires_at_ms: Option<i64>,
}

impl Slot {
    fn is_expired(&self, now_ms: i64) -> bool {
        self.expires_at_ms.is_some_and(|at| at <= now_ms)
    }
}

/// Memory-backed [`KvStore`].
#[derive(Clone)]
pub struct MemoryStore {
    slots: Arc<DashMap<String, Slot>>,
    clock: SharedClock,
    offline: Arc<AtomicBool>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new(Arc::new(SystemClock))
    }
}

impl MemoryStore {
    pub fn new(clock: SharedClock) -> Self {
        Self {
            slots: Arc::new(DashMap::new()),
            clock,
            offline: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Simulate an outage: every command fails with `StoreError::Unavailable`.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Remaining TTL in whole seconds, like `TTL key`.
    /// `None` when the key is missing or has no expiry.
    pub fn ttl_secs(&self, key: &str) -> Option<i64> {
        let now = self.clock.now_ms();
        let slot = self.slots.get(key)?;
        if slot.is_expired(now) {
            return None;
        }
        slot.expires_at_ms.map(|at| (at - now + 999) / 1000)
    }

    fn check_online(&self) -> Result<(), StoreError> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("memory store offline".to_string()));
        }
        Ok(())
    }

    /// Drop the slot if it has expired so the caller sees a fresh key.
    fn evict_expired(&self, key: &str) {
        let now = self.clock.now_ms();
        self.slots.remove_if(key, |_, slot| slot.is_expired(now));
    }

    fn push(&self, key: &str, value: &str, front: bool) -> Result<u64, StoreError> {
        self.check_online()?;
        self.evict_expired(key);
        let mut slot = self.slots.entry(key.to_string()).or_insert_with(|| Slot {
            value: SlotValue::List(VecDeque::new()),
            expires_at_ms: None,
        });
        match &mut slot.value {
            SlotValue::List(items) => {
                if front {
                    items.push_front(value.to_string());
                } else {
                    items.push_back(value.to_string());
                }
                Ok(items.len() as u64)
            }
            SlotValue::Text(_) => Err(StoreError::Protocol(format!(
                "WRONGTYPE list operation on string key {}",
                key
            ))),
        }
    }
}

#[async_trait]
impl KvStore for MemoryStore {
    async fn incr_by(&self, key: &str, amount: i64) -> Result<i64, StoreError> {
        self.check_online()?;
        self.evict_expired(key);
        match self.slots.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                let slot = occupied.get_mut();
                let current = match &slot.value {
                    SlotValue::Text(text) => text.parse::<i64>().map_err(|_| {
                        StoreError::Protocol(format!("value at {} is not an integer", key))
                    })?,
                    SlotValue::List(_) => {
                        return Err(StoreError::Protocol(format!(
                            "WRONGTYPE increment on list key {}",
                            key
                        )))
                    }
                };
                let next = current + amount;
                slot.value = SlotValue::Text(next.to_string());
                Ok(next)
            }
            Entry::Vacant(vacant) => {
                vacant.insert(Slot {
                    value: SlotValue::Text(amount.to_string()),
                    expires_at_ms: None,
                });
                Ok(amount)
            }
        }
    }

    async fn expire(&self, key: &str, seconds: u64) -> Result<bool, StoreError> {
        self.check_online()?;
        self.evict_expired(key);
        let expires_at = self.clock.now_ms() + (seconds as i64) * 1000;
        match self.slots.get_mut(key) {
            Some(mut slot) => {
                slot.expires_at_ms = Some(expires_at);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        self.check_online()?;
        self.evict_expired(key);
        match self.slots.get(key) {
            Some(slot) => match &slot.value {
                SlotValue::Text(text) => Ok(Some(text.clone())),
                SlotValue::List(_) => Err(StoreError::Protocol(format!(
                    "WRONGTYPE get on list key {}",
                    key
                ))),
            },
            None => Ok(None),
        }
    }

    async fn set_ex(&self, key: &str, seconds: u64, value: &str) -> Result<(), StoreError> {
        self.check_online()?;
        let expires_at = self.clock.now_ms() + (seconds as i64) * 1000;
        self.slots.insert(
            key.to_string(),
            Slot {
                value: SlotValue::Text(value.to_string()),
                expires_at_ms: Some(expires_at),
            },
        );
        Ok(())
    }

    async fn del(&self, key: &str) -> Result<bool, StoreError> {
        self.check_online()?;
        self.evict_expired(key);
        Ok(self.slots.remove(key).is_some())
    }

    async fn rpush(&self, key: &str, value: &str) -> Result<u64, StoreError> {
        self.push(key, value, false)
    }

    async fn lpush(&self, key: &str, value: &str) -> Result<u64, StoreError> {
        self.push(key, value, true)
    }

    async fn lpop(&self, key: &str) -> Result<Option<String>, StoreError> {
        self.check_online()?;
        self.evict_expired(key);
        let popped = match self.slots.get_mut(key) {
            Some(mut slot) => match &mut slot.value {
                SlotValue::List(items) => items.pop_front(),
                SlotValue::Text(_) => {
                    return Err(StoreError::Protocol(format!(
                        "WRONGTYPE pop on string key {}",
                        key
                    )))
                }
            },
            None => None,
        };
        // Redis deletes a list once it is empty.
        self.slots
            .remove_if(key, |_, slot| matches!(&slot.value, SlotValue::List(items) if items.is_empty()));
        Ok(popped)
    }

    async fn llen(&self, key: &str) -> Result<u64, StoreError> {
        self.check_online()?;
        self.evict_expired(key);
        match self.slots.get(key) {
            Some(slot) => match &slot.value {
                SlotValue::List(items) => Ok(items.len() as u64),
                SlotValue::Text(_) => Err(StoreError::Protocol(format!(
                    "WRONGTYPE llen on string key {}",
                    key
                ))),
            },
            None => Ok(0),
        }
    }

    async fn lrange(&self, key: &str, start: i64, stop: i64) -> Result<Vec<String>, StoreError> {
        self.check_online()?;
        self.evict_expired(key);
        let slot = match self.slots.get(key) {
            Some(slot) => slot,
            None => return Ok(Vec::new()),
        };
        let items = match &slot.value {
            SlotValue::List(items) => items,
            SlotValue::Text(_) => {
                return Err(StoreError::Protocol(format!(
                    "WRONGTYPE lrange on string key {}",
                    key
                )))
            }
        };

        let len = items.len() as i64;
        let start = if start < 0 { (len + start).max(0) } else { start };
        let stop = if stop < 0 { len + stop } else { stop.min(len - 1) };
        if len == 0 || start > stop {
            return Ok(Vec::new());
        }

        Ok(items
            .iter()
            .skip(start as usize)
            .take((stop - start + 1) as usize)
            .cloned()
            .collect())
    }
}
