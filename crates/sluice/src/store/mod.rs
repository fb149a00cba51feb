/*
 *  Copyright 2025-2026 Sluice Contributors
 *
 *  Licensed under the Apache License, Version 2.0 (the "License");
 *  you may not use this file except in compliance with the License.
 *  You may obtain a copy of the License at
 *
 *      http://www.apache.org/licenses/LICENSE-2.0
 *
 *  Unless required by applicable law or agreed to in writing, software
 *  distributed under the License is distributed on an "AS IS" BASIS,
 *  WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 *  See the License for the specific language governing permissions and
 *  limitations under the License.
 */

//! Versioned Config Store
//!
//! The external key-value store that CDN edge servers read to resolve a
//! request path to content. Keys are `(config_id, from_date)` pairs: a path
//! can carry many dated entries, and a reader resolves the entry with the
//! greatest `from_date` at or before its own clock. Commits exploit this by
//! stamping every entry of a publish with one shared `from_date`, so the
//! whole publish becomes visible at a single instant.
//!
//! Writes are batched and must be idempotent: redoing a batch with identical
//! content leaves the store unchanged, which is what makes commit retries
//! safe without any rollback machinery.

pub mod memory;

use async_trait::async_trait;
use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

use crate::error::StoreError;

pub use memory::MemoryStore;

/// One versioned store entry: a CDN path bound to content from a given date.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigEntry {
    /// Store key: the `web_uri` of the published item
    pub config_id: String,
    /// Date from which this entry is the live mapping for `config_id`
    pub from_date: NaiveDateTime,
    /// Checksum key of the content object
    pub object_key: String,
    /// MIME type served for this path
    pub content_type: Option<String>,
}

impl ConfigEntry {
    /// Creates a new entry.
    pub fn new(
        config_id: impl Into<String>,
        from_date: NaiveDateTime,
        object_key: impl Into<String>,
        content_type: Option<String>,
    ) -> Self {
        Self {
            config_id: config_id.into(),
            from_date,
            object_key: object_key.into(),
            content_type,
        }
    }
}

/// Client interface to the versioned config store.
///
/// Implementations are table-scoped per call: the same client serves every
/// environment, with the environment's configured table name selecting the
/// destination.
#[async_trait]
pub trait ConfigStore: Send + Sync {
    /// Writes one batch of entries to `table`.
    ///
    /// A batch either lands completely or not at all. Handing over a batch
    /// larger than the store's write limit is a programming error and fails
    /// with [`StoreError::Permanent`]; retrying cannot help, the caller must
    /// chunk correctly.
    async fn write_batch(&self, table: &str, entries: &[ConfigEntry]) -> Result<(), StoreError>;

    /// Resolves `config_id` in `table` to the entry with the greatest
    /// `from_date` at or before `as_of`, the way an edge reader would.
    async fn get(
        &self,
        table: &str,
        config_id: &str,
        as_of: NaiveDateTime,
    ) -> Result<Option<ConfigEntry>, StoreError>;
}
