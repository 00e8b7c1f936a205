// Copyright 2025 Meta-Hybrid Mount Authors
// SPDX-License-Identifier: GPL-3.0-or-later

pub mod client;
pub mod protocol;

pub use client::{HymoClient, HymoFsStatus};
