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

//! Worker pool for queued tasks.
//!
//! [`WorkerPool`] runs three background services per process: a claim loop
//! that polls the queue and executes tasks, a heartbeat loop that keeps the
//! worker's liveness row fresh, and a [`Janitor`] for periodic maintenance.
//!
//! The claim loop holds a semaphore sized to `max_concurrent_tasks` and
//! skips polling while all slots are busy, so the database only sees claim
//! attempts this process can actually serve. Each claimed task executes on
//! its own tokio task under a wall-clock limit (`actor_time_limit`).
//!
//! Task outcomes map onto queue bookkeeping here, not in the engines: a
//! retryable failure goes back to the queue until the attempt budget is
//! spent, a permanent failure is rejected outright, and a rejected commit
//! task also fails its publish.
//!
//! Shutdown stops the loops; executions already in flight are left to
//! finish. If the process exits before they do, another worker's janitor
//! reclaims them once the heartbeat goes stale.

use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use serde_json::json;
use tokio::sync::{broadcast, RwLock, Semaphore};
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::commit::CommitEngine;
use crate::config::{chrono_duration, Settings};
use crate::dal::DAL;
use crate::error::WorkerError;
use crate::flush::{Flusher, PurgeClient};
use crate::models::task::{FlushPayload, Task, TaskState, COMMIT_QUEUE, FLUSH_QUEUE};
use crate::store::ConfigStore;

pub mod janitor;

pub use janitor::Janitor;

/// How one execution attempt failed, deciding what happens to the task.
#[derive(Debug)]
enum ExecutionError {
    /// Another attempt may succeed; the task goes back to the queue.
    Retryable(String),
    /// Retrying cannot help; the task is rejected.
    Permanent(String),
}

/// Handles for the running background services.
#[derive(Default)]
struct RuntimeHandles {
    claim_handle: Option<JoinHandle<()>>,
    heartbeat_handle: Option<JoinHandle<()>>,
    janitor_handle: Option<JoinHandle<()>>,
    shutdown_sender: Option<broadcast::Sender<()>>,
}

/// Claims and executes queued tasks until shut down.
#[derive(Clone)]
pub struct WorkerPool {
    dal: Arc<DAL>,
    settings: Arc<Settings>,
    engine: Arc<CommitEngine>,
    purge: Arc<dyn PurgeClient>,
    worker_id: String,
    handles: Arc<RwLock<RuntimeHandles>>,
}

impl WorkerPool {
    /// Creates a pool executing commits against `store` and cache flushes
    /// against `purge`. Nothing runs until [`start`](Self::start).
    pub fn new(
        dal: Arc<DAL>,
        settings: Arc<Settings>,
        store: Arc<dyn ConfigStore>,
        purge: Arc<dyn PurgeClient>,
    ) -> Self {
        let engine = Arc::new(CommitEngine::new(
            dal.clone(),
            settings.clone(),
            store,
            purge.clone(),
        ));

        Self {
            dal,
            settings,
            engine,
            purge,
            worker_id: Uuid::new_v4().to_string(),
            handles: Arc::new(RwLock::new(RuntimeHandles::default())),
        }
    }

    /// This process's queue consumer id.
    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// Registers the worker and starts the background services.
    ///
    /// Fails if the liveness row cannot be written or `cron_cleanup` does
    /// not parse. Calling `start` on a pool that is already running is a
    /// no-op.
    pub async fn start(&self) -> Result<(), WorkerError> {
        let mut handles = self.handles.write().await;
        if handles.shutdown_sender.is_some() {
            warn!(worker_id = %self.worker_id, "Worker pool already running");
            return Ok(());
        }

        let janitor = Janitor::new(self.dal.clone(), self.settings.clone(), self.engine.clone())?;

        // Register before claiming anything, so a janitor elsewhere never
        // sees this worker's consumed tasks as orphans.
        self.dal
            .worker()
            .heartbeat(&self.worker_id, Utc::now().naive_utc())
            .await?;
        info!(
            worker_id = %self.worker_id,
            max_concurrent = self.settings.max_concurrent_tasks(),
            "Worker registered"
        );

        let (shutdown_tx, mut claim_shutdown_rx) = broadcast::channel(1);
        let mut heartbeat_shutdown_rx = shutdown_tx.subscribe();
        let mut janitor_shutdown_rx = shutdown_tx.subscribe();

        let claim_worker = self.clone();
        let claim_handle = tokio::spawn(async move {
            tokio::select! {
                _ = claim_worker.run_claim_loop() => {}
                _ = claim_shutdown_rx.recv() => {
                    info!("Claim loop shutdown requested");
                }
            }
        });

        let heartbeat_worker = self.clone();
        let heartbeat_handle = tokio::spawn(async move {
            tokio::select! {
                _ = heartbeat_worker.run_heartbeat_loop() => {}
                _ = heartbeat_shutdown_rx.recv() => {
                    info!("Heartbeat loop shutdown requested");
                }
            }
        });

        let janitor_handle = tokio::spawn(async move {
            tokio::select! {
                _ = janitor.run_loop() => {}
                _ = janitor_shutdown_rx.recv() => {
                    info!("Janitor shutdown requested");
                }
            }
        });

        handles.claim_handle = Some(claim_handle);
        handles.heartbeat_handle = Some(heartbeat_handle);
        handles.janitor_handle = Some(janitor_handle);
        handles.shutdown_sender = Some(shutdown_tx);

        Ok(())
    }

    /// Stops the background services and deregisters the worker.
    pub async fn shutdown(&self) {
        let mut handles = self.handles.write().await;

        if let Some(sender) = handles.shutdown_sender.take() {
            let _ = sender.send(());
        }

        if let Some(handle) = handles.claim_handle.take() {
            let _ = handle.await;
        }
        if let Some(handle) = handles.heartbeat_handle.take() {
            let _ = handle.await;
        }
        if let Some(handle) = handles.janitor_handle.take() {
            let _ = handle.await;
        }

        if let Err(error) = self.dal.worker().deregister(&self.worker_id).await {
            warn!(worker_id = %self.worker_id, %error, "Failed to deregister worker");
        } else {
            info!(worker_id = %self.worker_id, "Worker deregistered");
        }
    }

    /// Polls the queue and executes claimed tasks in background tasks.
    async fn run_claim_loop(&self) {
        let semaphore = Arc::new(Semaphore::new(self.settings.max_concurrent_tasks()));
        let mut interval = time::interval(self.settings.queue_poll_interval());

        loop {
            interval.tick().await;

            // Only poll while there is a free execution slot.
            if semaphore.available_permits() == 0 {
                debug!("All execution slots busy, skipping poll");
                continue;
            }

            match self.dal.task().claim(&self.worker_id).await {
                Ok(Some(task)) => {
                    let Ok(permit) = semaphore.clone().acquire_owned().await else {
                        break;
                    };
                    let worker = self.clone();

                    tokio::spawn(async move {
                        let _permit = permit; // Hold until the task completes

                        info!(
                            task_id = %task.id,
                            queue = %task.queue,
                            attempt = task.attempt,
                            "Executing task"
                        );
                        worker.process(task).await;
                    });
                }
                Ok(None) => {
                    debug!("No queued tasks found");
                }
                Err(error) => {
                    warn!(%error, "Failed to claim task");
                }
            }
        }
    }

    /// Refreshes the worker's liveness row at `worker_keepalive_interval`.
    async fn run_heartbeat_loop(&self) {
        let mut interval = time::interval(self.settings.worker_keepalive_interval());

        loop {
            interval.tick().await;
            if let Err(error) = self
                .dal
                .worker()
                .heartbeat(&self.worker_id, Utc::now().naive_utc())
                .await
            {
                warn!(worker_id = %self.worker_id, %error, "Heartbeat failed");
            }
        }
    }

    /// Executes one claimed task and records the outcome.
    async fn process(&self, task: Task) {
        let started = Instant::now();

        let outcome = match time::timeout(self.settings.actor_time_limit(), self.execute(&task))
            .await
        {
            Ok(result) => result,
            Err(_) => Err(ExecutionError::Retryable(format!(
                "timed out after {:?}",
                self.settings.actor_time_limit()
            ))),
        };

        let result_expiry = Utc::now().naive_utc() + chrono_duration(self.settings.result_ttl());

        match outcome {
            Ok(value) => {
                match self
                    .dal
                    .task()
                    .mark_done(&task.id, Some(value.to_string()), result_expiry)
                    .await
                {
                    Ok(()) => info!(
                        task_id = %task.id,
                        queue = %task.queue,
                        elapsed_ms = started.elapsed().as_millis() as u64,
                        "Task complete"
                    ),
                    Err(error) => {
                        warn!(task_id = %task.id, %error, "Failed to record task completion")
                    }
                }
            }
            Err(ExecutionError::Retryable(message)) => {
                warn!(task_id = %task.id, error = %message, "Task attempt failed");
                let result = json!({ "error": message }).to_string();
                match self
                    .dal
                    .task()
                    .requeue_or_reject(&task.id, Some(result), result_expiry)
                    .await
                {
                    Ok(TaskState::Rejected) => {
                        warn!(task_id = %task.id, "Task rejected after exhausting attempts");
                        self.fail_linked_publish(&task).await;
                    }
                    Ok(_) => {}
                    Err(error) => warn!(task_id = %task.id, %error, "Failed to requeue task"),
                }
            }
            Err(ExecutionError::Permanent(message)) => {
                warn!(task_id = %task.id, error = %message, "Task failed permanently");
                let result = json!({ "error": message }).to_string();
                if let Err(error) = self
                    .dal
                    .task()
                    .reject(&task.id, Some(result), result_expiry)
                    .await
                {
                    warn!(task_id = %task.id, %error, "Failed to reject task");
                }
                self.fail_linked_publish(&task).await;
            }
        }
    }

    /// Dispatches a task to the engine for its queue.
    async fn execute(&self, task: &Task) -> Result<serde_json::Value, ExecutionError> {
        match task.queue.as_str() {
            COMMIT_QUEUE => self.engine.run(task).await.map_err(|error| {
                if error.is_retryable() {
                    ExecutionError::Retryable(error.to_string())
                } else {
                    ExecutionError::Permanent(error.to_string())
                }
            }),
            FLUSH_QUEUE => self.run_flush(task).await,
            other => Err(ExecutionError::Permanent(format!(
                "unknown queue '{}'",
                other
            ))),
        }
    }

    /// Executes a standalone cache flush task.
    async fn run_flush(&self, task: &Task) -> Result<serde_json::Value, ExecutionError> {
        let payload: FlushPayload = serde_json::from_str(&task.payload)
            .map_err(|error| ExecutionError::Permanent(format!("bad flush payload: {}", error)))?;

        let env = self.settings.environment(&payload.env).ok_or_else(|| {
            ExecutionError::Permanent(format!("unknown environment '{}'", payload.env))
        })?;

        if !env.cache_flush_enabled() {
            debug!(env = %payload.env, "Cache flush not configured for environment");
            return Ok(json!({ "env": payload.env, "flushed_urls": 0 }));
        }

        let flusher = Flusher::new(env, self.settings.clone(), self.purge.clone())
            .map_err(|error| ExecutionError::Permanent(error.to_string()))?;

        match flusher.flush(&payload.paths).await {
            Ok(flushed) => Ok(json!({ "env": payload.env, "flushed_urls": flushed })),
            Err(error) if error.is_retryable() => {
                Err(ExecutionError::Retryable(error.to_string()))
            }
            Err(error) => Err(ExecutionError::Permanent(error.to_string())),
        }
    }

    /// A rejected commit task fails its publish; other queues have nothing
    /// linked.
    async fn fail_linked_publish(&self, task: &Task) {
        if task.queue == COMMIT_QUEUE {
            self.engine.fail_publish(task).await;
        }
    }
}
