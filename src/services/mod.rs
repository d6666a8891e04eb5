// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Services module - business logic layer.

pub mod audit;
pub mod cache;
pub mod drainer;
pub mod ingest;
pub mod queue;
pub mod rate_limit;
pub mod reader;
pub mod scheduler;
pub mod strava;
pub mod tokens;

pub use audit::AuditLog;
pub use cache::CacheLayer;
pub use drainer::{DrainReport, Drainer};
pub use ingest::WebhookIngester;
pub use queue::WorkQueue;
pub use rate_limit::RateLimiter;
pub use reader::ActivityReader;
pub use strava::StravaClient;
pub use tokens::TokenManager;
