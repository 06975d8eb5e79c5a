// Copyright (c) 2026 Dispersy
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//     http://www.apache.org/licenses/LICENSE-2.0
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

//! Dispersy - the messaging core of an elastic peer-to-peer database.
//!
//! This crate provides:
//! - A declarative policy model (authentication, resolution, distribution,
//!   destination) with a validated compatibility matrix
//! - Signed wire packets with canonical encoding and a Delay/Drop decoder
//! - Per-community message stores over SQLite with full-sync and last-N
//!   retention
//! - A sync responder driven by (range, modulo, bloom) tuples with ordering
//!   and priority policies
//! - Windowed ingestion batching, sequence backfill, and a double-member
//!   signing handshake
//! - Monitoring via prometheus counters and structured logging

/// Node configuration (TOML) and core tunables.
pub mod config;
/// Protocol core (policies, messages, codec, communities).
pub mod core;
/// Observability (prometheus metrics).
pub mod monitoring;
/// Networking (endpoint abstraction, peer cache).
pub mod networking;
/// Event-loop driver tying endpoint, batches, and communities together.
pub mod node;
/// Durable storage (SQLite manager and message operations).
pub mod store;
