// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Shared test utilities for integration and chaos tests.
//!
//! This module provides:
//! - Elasticsearch testcontainer setup
//! - Seeded in-memory stores and config builders

#![allow(dead_code)]

pub mod containers;
pub mod fixtures;

pub use containers::*;
pub use fixtures::*;
