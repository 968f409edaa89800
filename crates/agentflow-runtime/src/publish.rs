// Copyright (c) 2025 AgentFlow Runtime Team
// SPDX-License-Identifier: Apache-2.0

//! Source publishing.
//!
//! Published sources are immutable under a `(namespace, version)` key:
//! re-publishing identical content is a no-op, different content is
//! rejected unless explicitly forced.

use std::sync::Arc;

use agentflow_core::{AflError, Result};
use agentflow_state::{PublishedSourceRecord, Store, StoreError};
use tracing::info;

/// Publish a namespace's combined source under a version.
pub async fn publish(
    store: &Arc<dyn Store>,
    namespace_name: &str,
    version: &str,
    content: &str,
    force: bool,
) -> Result<PublishedSourceRecord> {
    let record = PublishedSourceRecord::create(namespace_name, version, content);

    match store.save_published_source(&record, force).await {
        Ok(()) => {
            info!(namespace = namespace_name, version, force, "Source published");
            Ok(record)
        }
        Err(StoreError::AlreadyPublished(key)) => Err(AflError::other(format!(
            "'{key}' is already published with different content; re-publish with force to replace"
        ))),
        Err(err) => Err(AflError::Store(err.to_string())),
    }
}

/// Fetch a published source by its unique key.
pub async fn get_published(
    store: &Arc<dyn Store>,
    namespace_name: &str,
    version: &str,
) -> Result<Option<PublishedSourceRecord>> {
    store
        .get_published_source(namespace_name, version)
        .await
        .map_err(|e| AflError::Store(e.to_string()))
}
