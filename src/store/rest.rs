// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! REST-over-HTTP key-value store client (Upstash-compatible).
//!
//! Each command is a `POST` of a JSON array such as `["INCRBY", "k", "1"]`
//! to the store URL with a bearer token. Replies are `{"result": ...}` or
//! `{"error": "..."}`.

use super::{KvStore, StoreError};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use std::time::Duration;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// REST store client. Create once per process and share via `Arc`.
#[derive(Clone)]
pub struct RestStore {
    http: reqwest::Client,
    url: String,
    token: String,
}

#[derive(Debug, Deserialize)]
struct CommandReply {
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<String>,
}

impl RestStore {
    pub fn new(url: impl Into<String>, token: impl Into<String>) -> Result<Self, StoreError> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| StoreError::Unavailable(format!("HTTP client build failed: {}", e)))?;

        Ok(Self {
            http,
            url: url.into().trim_end_matches('/').to_string(),
            token: token.into(),
        })
    }

    /// Send one command and return its `result`.
    async fn command(&self, args: &[&str]) -> Result<Value, StoreError> {
        let response = self
            .http
            .post(&self.url)
            .bearer_auth(&self.token)
            .json(args)
            .send()
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;

        let status = response.status();
        if status.is_server_error() {
            return Err(StoreError::Unavailable(format!("HTTP {}", status)));
        }

        let reply: CommandReply = response
            .json()
            .await
            .map_err(|e| StoreError::Protocol(format!("invalid reply: {}", e)))?;

        if let Some(error) = reply.error {
            return Err(StoreError::Protocol(error));
        }
        if !status.is_success() {
            return Err(StoreError::Protocol(format!("HTTP {}", status)));
        }

        Ok(reply.result.unwrap_or(Value::Null))
    }
}

fn as_int(value: &Value, command: &str) -> Result<i64, StoreError> {
    match value {
        Value::Number(n) => n
            .as_i64()
            .ok_or_else(|| StoreError::Protocol(format!("{}: non-integer reply", command))),
        Value::String(s) => s
            .parse()
            .map_err(|_| StoreError::Protocol(format!("{}: non-integer reply", command))),
        other => Err(StoreError::Protocol(format!(
            "{}: unexpected reply {}",
            command, other
        ))),
    }
}

fn as_opt_string(value: Value, command: &str) -> Result<Option<String>, StoreError> {
    match value {
        Value::Null => Ok(None),
        Value::String(s) => Ok(Some(s)),
        Value::Number(n) => Ok(Some(n.to_string())),
        other => Err(StoreError::Protocol(format!(
            "{}: unexpected reply {}",
            command, other
        ))),
    }
}

#[async_trait]
impl KvStore for RestStore {
    async fn incr_by(&self, key: &str, amount: i64) -> Result<i64, StoreError> {
        let amount = amount.to_string();
        let value = self.command(&["INCRBY", key, &amount]).await?;
        as_int(&value, "INCRBY")
    }

    async fn expire(&self, key: &str, seconds: u64) -> Result<bool, StoreError> {
        let seconds = seconds.to_string();
        let value = self.command(&["EXPIRE", key, &seconds]).await?;
        Ok(as_int(&value, "EXPIRE")? == 1)
    }

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let value = self.command(&["GET", key]).await?;
        as_opt_string(value, "GET")
    }

    async fn set_ex(&self, key: &str, seconds: u64, value: &str) -> Result<(), StoreError> {
        let seconds = seconds.to_string();
        self.command(&["SETEX", key, &seconds, value]).await?;
        Ok(())
    }

    async fn del(&self, key: &str) -> Result<bool, StoreError> {
        let value = self.command(&["DEL", key]).await?;
        Ok(as_int(&value, "DEL")? > 0)
    }

    async fn rpush(&self, key: &str, value: &str) -> Result<u64, StoreError> {
        let reply = self.command(&["RPUSH", key, value]).await?;
        Ok(as_int(&reply, "RPUSH")? as u64)
    }

    async fn lpush(&self, key: &str, value: &str) -> Result<u64, StoreError> {
        let reply = self.command(&["LPUSH", key, value]).await?;
        Ok(as_int(&reply, "LPUSH")? as u64)
    }

    async fn lpop(&self, key: &str) -> Result<Option<String>, StoreError> {
        let value = self.command(&["LPOP", key]).await?;
        as_opt_string(value, "LPOP")
    }

    async fn llen(&self, key: &str) -> Result<u64, StoreError> {
        let value = self.command(&["LLEN", key]).await?;
        Ok(as_int(&value, "LLEN")? as u64)
    }

    async fn lrange(&self, key: &str, start: i64, stop: i64) -> Result<Vec<String>, StoreError> {
        let (start, stop) = (start.to_string(), stop.to_string());
        match self.command(&["LRANGE", key, &start, &stop]).await? {
            Value::Array(items) => items
                .into_iter()
                .map(|item| {
                    as_opt_string(item, "LRANGE")?
                        .ok_or_else(|| StoreError::Protocol("LRANGE: null item".to_string()))
                })
                .collect(),
            Value::Null => Ok(Vec::new()),
            other => Err(StoreError::Protocol(format!(
                "LRANGE: unexpected reply {}",
                other
            ))),
        }
    }
}
