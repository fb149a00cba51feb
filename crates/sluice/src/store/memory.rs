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

//! In-memory config store.
//!
//! Backs development and tests. Besides the [`ConfigStore`] contract it
//! keeps an ordered log of completed writes (to assert phase ordering) and
//! supports fault injection per path (to exercise the writer's retry and
//! partial-failure behavior).

use std::collections::BTreeMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::NaiveDateTime;

use super::{ConfigEntry, ConfigStore};
use crate::error::StoreError;

/// The write limit shared by real versioned stores; batches beyond it are
/// rejected outright.
pub const MAX_WRITE_BATCH: usize = 25;

/// An injected fault matching writes to one path.
#[derive(Debug)]
struct Fault {
    config_id: String,
    error: StoreError,
    remaining: usize,
}

#[derive(Debug, Default)]
struct Inner {
    /// Entries keyed by `(table, config_id, from_date)`.
    entries: BTreeMap<(String, String, NaiveDateTime), ConfigEntry>,
    /// Paths of successfully written entries, in completion order.
    write_log: Vec<String>,
    faults: Vec<Fault>,
    /// Batch write calls made, successful or not.
    write_attempts: usize,
}

/// In-memory [`ConfigStore`] implementation.
#[derive(Debug)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
    max_batch_size: usize,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    /// Creates an empty store with the standard write limit.
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            max_batch_size: MAX_WRITE_BATCH,
        }
    }

    /// Creates an empty store with a custom write limit.
    pub fn with_max_batch_size(max_batch_size: usize) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            max_batch_size,
        }
    }

    /// Injects a fault: the next `times` batches containing `config_id`
    /// fail with (a clone of) `error` and write nothing.
    pub fn fail_path(&self, config_id: impl Into<String>, error: StoreError, times: usize) {
        let mut inner = self.inner.lock().unwrap();
        inner.faults.push(Fault {
            config_id: config_id.into(),
            error,
            remaining: times,
        });
    }

    /// Paths of all successfully written entries, in completion order.
    pub fn written_paths(&self) -> Vec<String> {
        self.inner.lock().unwrap().write_log.clone()
    }

    /// Number of distinct `(table, config_id, from_date)` entries held.
    pub fn entry_count(&self) -> usize {
        self.inner.lock().unwrap().entries.len()
    }

    /// Number of batch write calls made so far, successful or not.
    pub fn write_attempts(&self) -> usize {
        self.inner.lock().unwrap().write_attempts
    }

    /// All entries of `table`, ordered by `(config_id, from_date)`.
    pub fn snapshot(&self, table: &str) -> Vec<ConfigEntry> {
        let inner = self.inner.lock().unwrap();
        inner
            .entries
            .iter()
            .filter(|((t, _, _), _)| t == table)
            .map(|(_, entry)| entry.clone())
            .collect()
    }
}

#[async_trait]
impl ConfigStore for MemoryStore {
    async fn write_batch(&self, table: &str, entries: &[ConfigEntry]) -> Result<(), StoreError> {
        if entries.len() > self.max_batch_size {
            return Err(StoreError::Permanent(format!(
                "batch of {} entries exceeds write limit of {}",
                entries.len(),
                self.max_batch_size
            )));
        }
        if entries.is_empty() {
            return Ok(());
        }

        let mut inner = self.inner.lock().unwrap();
        inner.write_attempts += 1;

        // Fault check first: a faulted batch writes nothing.
        let fault_index = inner
            .faults
            .iter()
            .position(|fault| entries.iter().any(|e| e.config_id == fault.config_id));
        if let Some(index) = fault_index {
            let error = inner.faults[index].error.clone();
            inner.faults[index].remaining -= 1;
            if inner.faults[index].remaining == 0 {
                inner.faults.remove(index);
            }
            return Err(error);
        }

        for entry in entries {
            let key = (
                table.to_string(),
                entry.config_id.clone(),
                entry.from_date,
            );
            inner.entries.insert(key, entry.clone());
            inner.write_log.push(entry.config_id.clone());
        }

        Ok(())
    }

    async fn get(
        &self,
        table: &str,
        config_id: &str,
        as_of: NaiveDateTime,
    ) -> Result<Option<ConfigEntry>, StoreError> {
        let inner = self.inner.lock().unwrap();
        let start = (table.to_string(), config_id.to_string(), NaiveDateTime::MIN);
        let end = (table.to_string(), config_id.to_string(), as_of);

        Ok(inner
            .entries
            .range(start..=end)
            .next_back()
            .map(|(_, entry)| entry.clone()))
    }
}
