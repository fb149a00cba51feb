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

//! Background maintenance for the task queue and publish history.
//!
//! Every worker process runs one janitor. Each pass rejects tasks that
//! overran their deadline, returns tasks stranded on dead workers to the
//! queue, and removes liveness rows nobody has refreshed. A slower
//! cron-gated cleanup fails abandoned publishes and deletes expired rows.
//!
//! Several janitors may run concurrently across processes; every sweep is a
//! single transaction over current state, so overlapping passes just find
//! less to do. The startup jitter (`scheduler_delay`) spreads their ticks
//! apart to keep them from contending on the same rows.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, NaiveDateTime, Utc};
use croner::Cron;
use rand::Rng;
use tokio::time;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::commit::CommitEngine;
use crate::config::{chrono_duration, Settings};
use crate::dal::DAL;
use crate::error::ConfigError;
use crate::models::task::COMMIT_QUEUE;

/// Periodic maintenance over tasks, workers and publish history.
pub struct Janitor {
    dal: Arc<DAL>,
    settings: Arc<Settings>,
    engine: Arc<CommitEngine>,
    cleanup_schedule: Cron,
    last_cleanup: DateTime<Utc>,
}

impl std::fmt::Debug for Janitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Janitor")
            .field("last_cleanup", &self.last_cleanup)
            .finish_non_exhaustive()
    }
}

impl Janitor {
    /// Creates a janitor. Fails if `cron_cleanup` is not a valid cron
    /// expression.
    pub fn new(
        dal: Arc<DAL>,
        settings: Arc<Settings>,
        engine: Arc<CommitEngine>,
    ) -> Result<Self, ConfigError> {
        let cleanup_schedule = Cron::new(settings.cron_cleanup())
            .parse()
            .map_err(|_| ConfigError::InvalidCron(settings.cron_cleanup().to_string()))?;

        Ok(Self {
            dal,
            settings,
            engine,
            cleanup_schedule,
            last_cleanup: Utc::now(),
        })
    }

    /// Runs maintenance passes forever at `scheduler_interval`, after an
    /// initial random delay of up to `scheduler_delay`.
    pub async fn run_loop(mut self) {
        let delay_cap = self.settings.scheduler_delay();
        if !delay_cap.is_zero() {
            let jitter = rand::thread_rng().gen_range(Duration::ZERO..delay_cap);
            debug!(delay_ms = jitter.as_millis() as u64, "Delaying first maintenance pass");
            time::sleep(jitter).await;
        }

        let mut interval = time::interval(self.settings.scheduler_interval());
        loop {
            interval.tick().await;
            self.run_pass(Utc::now()).await;
        }
    }

    /// One maintenance pass as of `now`.
    pub async fn run_pass(&mut self, now: DateTime<Utc>) {
        let naive_now = now.naive_utc();
        let result_expiry = naive_now + chrono_duration(self.settings.result_ttl());

        // Deadline expiry comes first so an overdue task stranded on a dead
        // worker is failed rather than requeued for a doomed retry.
        match self
            .dal
            .task()
            .expire_deadlines(naive_now, result_expiry)
            .await
        {
            Ok(expired) => {
                for task in &expired {
                    warn!(task_id = %task.id, queue = %task.queue, "Task exceeded its deadline");
                    if task.queue == COMMIT_QUEUE {
                        self.engine.fail_publish(task).await;
                    }
                }
            }
            Err(error) => warn!(%error, "Deadline expiry sweep failed"),
        }

        let alive_cutoff = naive_now - chrono_duration(self.settings.worker_keepalive_timeout());
        match self
            .dal
            .task()
            .reclaim_lost(alive_cutoff, result_expiry)
            .await
        {
            Ok((requeued, rejected)) => {
                for task_id in &requeued {
                    warn!(%task_id, "Requeued task from lost worker");
                }
                for task_id in &rejected {
                    warn!(%task_id, "Rejected task from lost worker");
                    self.fail_publish_for(task_id).await;
                }
            }
            Err(error) => warn!(%error, "Lost task sweep failed"),
        }

        match self.dal.worker().delete_stale(alive_cutoff).await {
            Ok(stale) => {
                for worker_id in &stale {
                    warn!(%worker_id, "Removed stale worker");
                }
            }
            Err(error) => warn!(%error, "Stale worker sweep failed"),
        }

        if self.cleanup_due(now) {
            self.run_cleanup(naive_now).await;
            self.last_cleanup = now;
        }
    }

    /// Fails the publish behind a rejected commit task, if there is one.
    async fn fail_publish_for(&self, task_id: &str) {
        let Ok(id) = Uuid::parse_str(task_id) else {
            warn!(%task_id, "Rejected task has a malformed id");
            return;
        };
        match self.dal.task().get(id).await {
            Ok(Some(task)) if task.queue == COMMIT_QUEUE => {
                self.engine.fail_publish(&task).await;
            }
            Ok(_) => {}
            Err(error) => warn!(%task_id, %error, "Failed to load rejected task"),
        }
    }

    /// Whether the cron schedule has fired since the last cleanup.
    fn cleanup_due(&self, now: DateTime<Utc>) -> bool {
        match self
            .cleanup_schedule
            .find_next_occurrence(&self.last_cleanup, false)
        {
            Ok(next) => next <= now,
            Err(error) => {
                warn!(%error, "Cleanup schedule evaluation failed");
                false
            }
        }
    }

    /// Slow cleanup: fails abandoned publishes and deletes rows past their
    /// retention windows. Normally gated by `cron_cleanup`; callable
    /// directly for one-off maintenance.
    pub async fn run_cleanup(&self, now: NaiveDateTime) {
        info!("Running scheduled cleanup");

        let abandoned_cutoff = now - chrono_duration(self.settings.publish_timeout());
        match self.dal.publish().fail_abandoned(abandoned_cutoff).await {
            Ok(0) => {}
            Ok(failed) => warn!(failed, "Failed abandoned publishes"),
            Err(error) => warn!(%error, "Abandoned publish sweep failed"),
        }

        let history_cutoff = now - chrono_duration(self.settings.history_timeout());
        match self.dal.publish().delete_old(history_cutoff).await {
            Ok(0) => {}
            Ok(deleted) => info!(deleted, "Deleted old publishes"),
            Err(error) => warn!(%error, "Publish history sweep failed"),
        }

        match self.dal.task().delete_expired(now).await {
            Ok(0) => {}
            Ok(deleted) => info!(deleted, "Deleted expired tasks"),
            Err(error) => warn!(%error, "Expired task sweep failed"),
        }
    }
}
