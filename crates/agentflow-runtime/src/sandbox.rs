// Copyright (c) 2025 AgentFlow Runtime Team
// SPDX-License-Identifier: Apache-2.0

//! Sandbox boundary for script-bodied facets.
//!
//! The runtime hands the collaborator `(language, code, params)` and
//! expects a result mapping. Only transport for `python` is guaranteed;
//! other languages pass through unchanged. Implementations must not wait
//! on network replies or external subprocesses: a script that needs
//! external work belongs in an event facet.

use serde_json::{Map, Value};

/// A sandboxed script executor.
pub trait Sandbox: Send + Sync {
    /// Execute `code` with `params` bound as inputs and return the
    /// script's output mapping. Failures surface as step errors in
    /// `FacetScriptsBegin`.
    fn execute(
        &self,
        language: &str,
        code: &str,
        params: &Map<String, Value>,
    ) -> Result<Map<String, Value>, String>;
}
