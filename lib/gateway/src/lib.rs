// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Control plane for a fleet of Ollama-compatible inference backends.
//!
//! The registry holds per-backend state, the sync engine keeps it fresh using
//! the probe, and the HTTP service routes OpenAI-style traffic to a backend
//! chosen by the selector. Background refreshes go through the task queue.

pub mod auth;
pub mod catalog;
pub mod config;
pub mod http;
pub mod metrics;
pub mod probe;
pub mod registry;
pub mod selector;
pub mod sync;
pub mod tasks;

pub use registry::{BackendRegistry, BackendState};
pub use selector::{Route, RoutingError};
pub use sync::SyncEngine;
