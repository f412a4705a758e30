// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Llamero runtime
//!
//! Process-level plumbing shared by the gateway and its launchers: environment
//! helpers, logging setup, durable key-value storage and shutdown tracking.

pub use anyhow::{
    Context as ErrorContext, Error, Ok as OK, Result, anyhow as error, bail as raise,
};

pub mod config;
pub mod logging;
pub mod storage;
pub mod utils;

pub use tokio_util::sync::CancellationToken;
pub use utils::GracefulShutdownTracker;
