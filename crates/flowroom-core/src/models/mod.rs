// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Rows, their typed ids and the SQL that reads and writes them.
//!
//! Queries are free functions taking an executor, so callers choose whether they run on the
//! pool or inside a transaction.

pub mod ids;

pub mod broadcast;
pub mod call;
pub mod campaign;
pub mod channel;
pub mod channel_event;
pub mod channel_log;
pub mod classifier;
pub mod contact;
pub mod contact_fire;
pub mod field;
pub mod flow;
pub mod flow_start;
pub mod group;
pub mod http_log;
pub mod import;
pub mod incident;
pub mod label;
pub mod location;
pub mod msg;
pub mod notification;
pub mod optin;
pub mod org;
pub mod run;
pub mod session;
pub mod template;
pub mod ticket;
pub mod topic;
pub mod trigger;
pub mod urn;
