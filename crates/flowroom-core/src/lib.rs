// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Flowroom Core - contact sessions, campaigns and outgoing messages
//!
//! This crate sits between a flow engine and the stores a messaging platform keeps its state
//! in. It loads contacts and org assets for the engine, runs sprints under per-contact locks,
//! and persists what happened: sessions and runs, messages, group and field changes, tickets,
//! campaign fires and the counts behind the dashboards.
//!
//! # Architecture
//!
//! ```text
//!   flow starts / broadcasts / fires / channel events / imports
//!                              │
//!                              ▼
//!                    ┌───────────────────┐      ┌──────────────┐
//!                    │      runner       │─────▶│    engine    │
//!                    │ (contact locks)   │◀─────│ (sprints)    │
//!                    └─────────┬─────────┘      └──────────────┘
//!                              │ events
//!                              ▼
//!                    ┌───────────────────┐
//!                    │       hooks       │  pre-commit in one transaction,
//!                    │                   │  post-commit after it
//!                    └─────────┬─────────┘
//!                              │
//!          ┌───────────────────┼────────────────────┐
//!          ▼                   ▼                    ▼
//!    ┌──────────┐        ┌──────────┐        ┌─────────────┐
//!    │PostgreSQL│        │  Redis   │        │ S3 / logs   │
//!    └──────────┘        └──────────┘        └─────────────┘
//! ```
//!
//! # Modules
//!
//! - [`runtime`]: the shared clients every operation takes
//! - [`runner`]: starting, resuming and modifying contacts
//! - [`hooks`]: turning engine events into writes
//! - [`workers`]: background polling for fires, retries and queued work
//! - [`models`]: rows and their SQL
//! - [`assets`]: cached per-org snapshots of flows, channels, fields and the rest

#[macro_use]
mod macros;

/// Per-org asset snapshots and their cache.
pub mod assets;

/// Resolving flow start and broadcast audiences to contacts.
pub mod audience;

/// Configuration loaded from environment variables.
pub mod config;

/// Publishing outgoing messages to the courier's queues.
pub mod courier;

/// The flow engine interface.
pub mod engine;

/// Error types.
pub mod error;

/// GSM 03.38 segment counting.
pub mod gsm7;

/// Event hooks run around each sprint's transaction.
pub mod hooks;

/// Per-contact locks in Redis.
pub mod locks;

/// Database migrations.
pub mod migrations;

/// Database rows and queries.
pub mod models;

/// Driving contacts through the engine.
pub mod runner;

/// The process-wide runtime handle.
pub mod runtime;

/// The contact search interface.
pub mod search;

/// Retry policies for calls to external services.
pub mod services;

/// Daily counts and other statistics.
pub mod stats;

/// Object storage.
pub mod storage;

/// Background workers.
pub mod workers;

pub use error::{CoreError, Result};
pub use runtime::Runtime;
