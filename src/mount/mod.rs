// Copyright 2025 Meta-Hybrid Mount Authors
// SPDX-License-Identifier: GPL-3.0-or-later

pub mod hymofs;
pub mod magic;
pub mod node;
