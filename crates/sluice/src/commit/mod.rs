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

//! Commit Engine
//!
//! Executes one commit task: resolves links, streams the publish's items in
//! pages, and drives the two write phases through the batched writer.
//! Ordinary content is written first; entrypoint paths and link aliases are
//! held back until every ordinary write is durable, so a client following a
//! listing never reaches content that is not yet live.
//!
//! Every store entry of one commit shares the `from_date` chosen when the
//! commit was requested, which makes the whole run idempotent: a crashed or
//! requeued attempt redoes its writes over identical keys and values.
//!
//! The engine reports outcomes as [`CommitError`] values and moves the
//! publish to `COMMITTED` on success. Failing the publish on a rejected task
//! is left to the worker, which owns task state accounting.

use std::sync::Arc;

use chrono::Utc;
use serde_json::json;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::{Environment, Settings};
use crate::dal::DAL;
use crate::error::{CommitError, ConfigError};
use crate::flush::{Flusher, PurgeClient};
use crate::models::publish::PublishState;
use crate::models::task::{CommitPayload, Task};
use crate::publish::PublishManager;
use crate::store::ConfigStore;
use crate::writer::BatchWriter;

/// Runs commit tasks against the versioned config store.
pub struct CommitEngine {
    dal: Arc<DAL>,
    settings: Arc<Settings>,
    manager: PublishManager,
    writer: BatchWriter,
    purge: Arc<dyn PurgeClient>,
}

impl CommitEngine {
    /// Creates a new engine writing through `store` and purging through
    /// `purge`.
    pub fn new(
        dal: Arc<DAL>,
        settings: Arc<Settings>,
        store: Arc<dyn ConfigStore>,
        purge: Arc<dyn PurgeClient>,
    ) -> Self {
        Self {
            manager: PublishManager::new(dal.clone(), settings.clone()),
            writer: BatchWriter::new(store, settings.clone()),
            dal,
            settings,
            purge,
        }
    }

    /// Executes one commit attempt for `task`.
    ///
    /// Returns the JSON value to record as the task's result. Terminal tasks
    /// never reach this point: claiming only flips `queued` rows, so the
    /// remaining preconditions are the deadline and the publish state.
    pub async fn run(&self, task: &Task) -> Result<serde_json::Value, CommitError> {
        let payload: CommitPayload = serde_json::from_str(&task.payload)?;
        let publish_id = payload.publish_id;

        let now = Utc::now().naive_utc();
        if task.deadline_expired(now) {
            warn!(task_id = %task.id, deadline = ?task.deadline, "Commit task expired");
            return Err(CommitError::DeadlineExceeded { id: publish_id });
        }

        let env = self.settings.environment(&payload.env).ok_or_else(|| {
            ConfigError::Invalid(format!("unknown environment '{}'", payload.env))
        })?;

        let publish = self
            .dal
            .publish()
            .get(publish_id)
            .await?
            .ok_or(CommitError::PublishNotFound(publish_id))?;
        if publish.state != PublishState::Committing.as_str() {
            warn!(
                publish_id = %publish_id,
                state = %publish.state,
                "Publish in unexpected state"
            );
            return Err(CommitError::WrongPublishState {
                id: publish_id,
                state: publish.state,
                expected: PublishState::Committing.as_str().to_string(),
            });
        }

        let total = self.dal.item().count(publish_id).await?;
        if total == 0 {
            debug!(publish_id = %publish_id, "No items to write");
            self.finish(publish_id).await?;
            return Ok(commit_result(&payload, 0, 0, 0));
        }

        info!(
            publish_id = %publish_id,
            env = %payload.env,
            items = total,
            attempt = task.attempt,
            "Committing publish"
        );

        self.manager.resolve_links(publish_id).await?;
        let plan = self.manager.build_write_plan(payload.from_date)?;

        let flusher = self.build_flusher(env);
        let mut flush_paths: Vec<String> = Vec::new();

        // Phase 1: write ordinary content page by page, holding every
        // deferred entry back until the last ordinary write has landed.
        let mut deferred = Vec::new();
        let mut written = 0usize;
        let mut offset = 0i64;
        let page_size = self.settings.item_yield_size() as i64;

        loop {
            let page = self.dal.item().page(publish_id, offset, page_size).await?;
            if page.is_empty() {
                break;
            }
            offset += page.len() as i64;

            if let Some(flusher) = &flusher {
                flush_paths.extend(
                    page.iter()
                        .filter(|item| flusher.matches(&item.web_uri))
                        .map(|item| item.web_uri.clone()),
                );
            }

            let (phase1, mut phase2) = plan.partition(page);
            deferred.append(&mut phase2);

            if !phase1.is_empty() {
                let expected = phase1.len();
                let result = self.writer.write_pass(env.table(), phase1).await;
                if !result.is_complete(expected) {
                    return Err(CommitError::PhaseFailed {
                        phase: "phase 1",
                        failed: expected.saturating_sub(result.succeeded),
                        total: expected,
                    });
                }
                written += expected;
                debug!(publish_id = %publish_id, written, "Phase 1 progress");
            }
        }

        // Phase 2: entrypoints and aliases become visible in one pass.
        let deferred_total = deferred.len();
        if deferred_total > 0 {
            let result = self.writer.write_pass(env.table(), deferred).await;
            if !result.is_complete(deferred_total) {
                return Err(CommitError::PhaseFailed {
                    phase: "phase 2",
                    failed: deferred_total.saturating_sub(result.succeeded),
                    total: deferred_total,
                });
            }
        }

        let mut flushed = 0usize;
        if let Some(flusher) = &flusher {
            // Entries are already live; a failed purge is logged by the
            // flusher and must not fail the commit.
            flushed = flusher.flush(&flush_paths).await.unwrap_or(0);
        }

        self.finish(publish_id).await?;

        info!(
            publish_id = %publish_id,
            env = %payload.env,
            written,
            deferred = deferred_total,
            flushed,
            "Publish committed"
        );
        Ok(commit_result(&payload, written, deferred_total, flushed))
    }

    /// Moves the publish of a rejected commit task to `FAILED`.
    ///
    /// Called by the worker once the task has no attempts left. A publish
    /// that already left `COMMITTING` is deliberately untouched.
    pub async fn fail_publish(&self, task: &Task) {
        let Ok(payload) = serde_json::from_str::<CommitPayload>(&task.payload) else {
            warn!(task_id = %task.id, "Rejected commit task has unreadable payload");
            return;
        };

        match self
            .dal
            .publish()
            .transition(
                payload.publish_id,
                PublishState::Committing,
                PublishState::Failed,
            )
            .await
        {
            Ok(true) => {
                warn!(publish_id = %payload.publish_id, "Publish failed");
            }
            Ok(false) => {
                debug!(
                    publish_id = %payload.publish_id,
                    "Publish no longer committing, leaving state unchanged"
                );
            }
            Err(error) => {
                warn!(
                    publish_id = %payload.publish_id,
                    %error,
                    "Unable to fail publish"
                );
            }
        }
    }

    /// Marks the publish committed, surfacing a lost race as an error.
    async fn finish(&self, publish_id: Uuid) -> Result<(), CommitError> {
        let transitioned = self
            .dal
            .publish()
            .transition(publish_id, PublishState::Committing, PublishState::Committed)
            .await?;

        if !transitioned {
            let state = self
                .dal
                .publish()
                .get(publish_id)
                .await?
                .map(|p| p.state)
                .unwrap_or_else(|| "<deleted>".to_string());
            return Err(CommitError::WrongPublishState {
                id: publish_id,
                state,
                expected: PublishState::Committing.as_str().to_string(),
            });
        }
        Ok(())
    }

    /// Builds the flusher for `env`, or `None` when no rules are configured.
    /// A rule that fails to compile disables flushing for this run; the
    /// commit itself proceeds.
    fn build_flusher(&self, env: &Environment) -> Option<Flusher> {
        if !env.cache_flush_enabled() {
            return None;
        }

        match Flusher::new(env, self.settings.clone(), self.purge.clone()) {
            Ok(flusher) => Some(flusher),
            Err(error) => {
                warn!(env = env.name(), %error, "Cache flush disabled for this commit");
                None
            }
        }
    }
}

fn commit_result(
    payload: &CommitPayload,
    written: usize,
    deferred: usize,
    flushed: usize,
) -> serde_json::Value {
    json!({
        "publish_id": payload.publish_id,
        "env": payload.env,
        "items_written": written + deferred,
        "deferred_items": deferred,
        "flushed_urls": flushed,
    })
}
