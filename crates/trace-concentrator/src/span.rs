// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// A single recorded unit of work of a distributed trace.
///
/// The concentrator only reads spans; they are forwarded to the write path
/// exactly as they were received.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Span {
    pub service: String,
    pub name: String,
    pub resource: String,
    pub trace_id: u64,
    pub span_id: u64,
    pub parent_id: u64,
    /// Start time in nanoseconds since the Unix epoch.
    pub start: i64,
    /// Duration in nanoseconds.
    pub duration: i64,
    /// Non-zero when the span recorded an error.
    pub error: i32,
    pub meta: HashMap<String, String>,
    pub metrics: HashMap<String, f64>,
}

impl Span {
    #[must_use]
    pub fn is_error(&self) -> bool {
        self.error != 0
    }

    /// Top-level spans have no parent inside the trace.
    #[must_use]
    pub fn is_top_level(&self) -> bool {
        self.parent_id == 0
    }
}
