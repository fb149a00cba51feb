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

//! Batched Concurrent Writer
//!
//! Drives bulk store writes for a commit phase. Entries are chunked into
//! batches no larger than the store's write limit, fed through a bounded
//! queue to a fixed pool of consumers, and retried with capped exponential
//! backoff on transient errors. The producer blocks (up to
//! `write_queue_timeout`) when the queue is full, so memory stays bounded
//! however large the publish.
//!
//! A pass never fails fast: every batch is driven to success or to its
//! final failure, and the caller gets the full accounting. The caller
//! decides what a partial result means; for a commit phase, anything short
//! of complete success fails the phase.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::SendTimeoutError;
use tokio::sync::Mutex;
use tracing::{debug, error, warn};

use crate::config::Settings;
use crate::error::StoreError;
use crate::store::{ConfigEntry, ConfigStore};

/// Base delay for the first retry; doubles per attempt up to the cap.
const RETRY_BASE_DELAY: Duration = Duration::from_millis(500);

/// One entry that could not be written, with the error that stopped it.
#[derive(Debug, Clone)]
pub struct FailedWrite {
    pub entry: ConfigEntry,
    pub error: StoreError,
}

/// Accounting for one writer pass.
#[derive(Debug, Default)]
pub struct WriteResult {
    /// Entries confirmed written.
    pub succeeded: usize,
    /// Entries that failed after the retry budget was spent.
    pub failed: Vec<FailedWrite>,
}

impl WriteResult {
    /// Whether the pass wrote everything it was given.
    pub fn is_complete(&self, expected: usize) -> bool {
        self.failed.is_empty() && self.succeeded == expected
    }
}

/// Writes config entries to the store in bounded concurrent batches.
pub struct BatchWriter {
    store: Arc<dyn ConfigStore>,
    settings: Arc<Settings>,
}

impl BatchWriter {
    /// Creates a writer over the given store.
    pub fn new(store: Arc<dyn ConfigStore>, settings: Arc<Settings>) -> Self {
        Self { store, settings }
    }

    /// Runs one full pass, writing every entry to `table`.
    ///
    /// Returns only after every batch has either been written or has
    /// exhausted its retries; failures are collected, not propagated early.
    pub async fn write_pass(&self, table: &str, entries: Vec<ConfigEntry>) -> WriteResult {
        let total = entries.len();
        if total == 0 {
            return WriteResult::default();
        }

        let batch_size = self.settings.write_batch_size().max(1);
        let worker_count = self.settings.write_max_workers().max(1);
        let queue_timeout = self.settings.write_queue_timeout();

        let (tx, rx) = mpsc::channel::<Vec<ConfigEntry>>(self.settings.write_queue_size().max(1));
        let rx = Arc::new(Mutex::new(rx));

        let mut consumers = Vec::with_capacity(worker_count);
        for worker in 0..worker_count {
            let rx = rx.clone();
            let store = self.store.clone();
            let settings = self.settings.clone();
            let table = table.to_string();

            consumers.push(tokio::spawn(async move {
                let mut succeeded = 0usize;
                let mut failed: Vec<FailedWrite> = Vec::new();

                loop {
                    // Holding the lock while waiting parks idle consumers in
                    // line; each batch is taken by exactly one of them.
                    let batch = { rx.lock().await.recv().await };
                    let Some(batch) = batch else { break };

                    match write_batch_with_retries(store.as_ref(), &table, batch, &settings).await
                    {
                        Ok(count) => succeeded += count,
                        Err(mut batch_failures) => failed.append(&mut batch_failures),
                    }
                }

                debug!(worker, succeeded, failed = failed.len(), "Writer consumer finished");
                (succeeded, failed)
            }));
        }

        // Produce batches into the bounded queue. A send timeout means the
        // store cannot keep up; the affected batch is recorded as a
        // transient failure instead of blocking the pass forever.
        let mut result = WriteResult::default();
        for chunk in entries.chunks(batch_size) {
            let batch = chunk.to_vec();
            match tx.send_timeout(batch, queue_timeout).await {
                Ok(()) => {}
                Err(SendTimeoutError::Timeout(batch)) => {
                    warn!(
                        batch_len = batch.len(),
                        timeout_secs = queue_timeout.as_secs(),
                        "Write queue full, dropping batch as failed"
                    );
                    let error =
                        StoreError::Transient("write queue full past its timeout".to_string());
                    result.failed.extend(batch.into_iter().map(|entry| FailedWrite {
                        entry,
                        error: error.clone(),
                    }));
                }
                Err(SendTimeoutError::Closed(batch)) => {
                    let error = StoreError::Transient("write queue closed".to_string());
                    result.failed.extend(batch.into_iter().map(|entry| FailedWrite {
                        entry,
                        error: error.clone(),
                    }));
                }
            }
        }
        drop(tx);

        for consumer in consumers {
            match consumer.await {
                Ok((succeeded, mut failed)) => {
                    result.succeeded += succeeded;
                    result.failed.append(&mut failed);
                }
                Err(e) => error!(error = %e, "Writer consumer aborted"),
            }
        }

        result
    }
}

/// Writes one batch, retrying transient errors up to `write_max_tries`.
async fn write_batch_with_retries(
    store: &dyn ConfigStore,
    table: &str,
    batch: Vec<ConfigEntry>,
    settings: &Settings,
) -> Result<usize, Vec<FailedWrite>> {
    let max_tries = settings.write_max_tries().max(1);
    let max_backoff = settings.actor_max_backoff();
    let mut tries = 0u32;

    loop {
        tries += 1;
        match store.write_batch(table, &batch).await {
            Ok(()) => return Ok(batch.len()),
            Err(error) if error.is_transient() && tries < max_tries => {
                let delay = backoff_delay(tries, max_backoff);
                warn!(
                    tries,
                    delay_ms = delay.as_millis() as u64,
                    error = %error,
                    "Transient store error, backing off"
                );
                tokio::time::sleep(delay).await;
            }
            Err(error) => {
                return Err(batch
                    .into_iter()
                    .map(|entry| FailedWrite {
                        entry,
                        error: error.clone(),
                    })
                    .collect());
            }
        }
    }
}

/// Exponential backoff with jitter, capped at `cap`. Shared with the cache
/// flusher, whose retries follow the same policy.
pub(crate) fn backoff_delay(tries: u32, cap: Duration) -> Duration {
    let exponent = tries.saturating_sub(1).min(16);
    let delay = RETRY_BASE_DELAY.saturating_mul(1u32 << exponent).min(cap);
    let jitter = delay.mul_f64(rand::thread_rng().gen_range(0.0..0.25));
    (delay + jitter).min(cap)
}
