// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@kernel.org>

//! Data models for the application.

pub mod activity;
pub mod audit;
pub mod credential;

pub use activity::ActivitySummary;
pub use audit::{AuditKind, AuditLogEntry};
pub use credential::AthleteCredential;
