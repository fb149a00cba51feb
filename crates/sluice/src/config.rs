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

//! Configuration for the publish pipeline.
//!
//! [`Settings`] is assembled once at process start (from the builder, a TOML
//! file, or both) and passed by reference into each component constructor.
//! Pattern and cron fields are kept as plain strings here and compiled where
//! they are used, so a bad pattern fails at component construction rather
//! than deep inside a commit.
//!
//! # Construction
//!
//! ```rust,ignore
//! let settings = Settings::builder()
//!     .write_batch_size(25)
//!     .write_max_workers(8)
//!     .build();
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// One cache flush rule: purge templates plus include/exclude path filters.
///
/// A template containing `{path}` is rendered by substitution (ARL style,
/// `{ttl}` is also available); otherwise it is treated as a base URL and the
/// path is appended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlushRuleConfig {
    pub name: String,
    pub templates: Vec<String>,
    #[serde(default)]
    pub includes: Vec<String>,
    #[serde(default)]
    pub excludes: Vec<String>,
}

/// A target environment: which store tables a publish lands in, and which
/// flush rules apply after a successful commit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Environment {
    name: String,
    bucket: String,
    table: String,
    config_table: String,
    #[serde(default)]
    cdn_url: Option<String>,
    #[serde(default)]
    flush_rules: Vec<FlushRuleConfig>,
}

impl Environment {
    /// Creates an environment definition.
    pub fn new(
        name: impl Into<String>,
        bucket: impl Into<String>,
        table: impl Into<String>,
        config_table: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            bucket: bucket.into(),
            table: table.into(),
            config_table: config_table.into(),
            cdn_url: None,
            flush_rules: Vec::new(),
        }
    }

    /// Sets the public base URL of this environment's CDN.
    pub fn with_cdn_url(mut self, url: impl Into<String>) -> Self {
        self.cdn_url = Some(url.into());
        self
    }

    /// Attaches a flush rule to this environment.
    pub fn with_flush_rule(mut self, rule: FlushRuleConfig) -> Self {
        self.flush_rules.push(rule);
        self
    }

    /// Environment name, referenced by publishes.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Blob storage bucket holding uploaded content.
    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    /// Versioned store table for content entries.
    pub fn table(&self) -> &str {
        &self.table
    }

    /// Versioned store table for auxiliary config entries.
    pub fn config_table(&self) -> &str {
        &self.config_table
    }

    /// Public base URL of this environment's CDN, when known.
    pub fn cdn_url(&self) -> Option<&str> {
        self.cdn_url.as_deref()
    }

    /// Flush rules evaluated after a successful commit.
    pub fn flush_rules(&self) -> &[FlushRuleConfig] {
        &self.flush_rules
    }

    /// Whether cache flushing is configured for this environment.
    pub fn cache_flush_enabled(&self) -> bool {
        !self.flush_rules.is_empty()
    }
}

/// Pipeline-wide configuration.
///
/// All durations are wall-clock. Defaults match a mid-size deployment and
/// are safe for tests.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub struct Settings {
    environments: Vec<Environment>,
    db_pool_size: usize,
    item_yield_size: usize,
    write_batch_size: usize,
    write_max_tries: u32,
    write_max_workers: usize,
    write_queue_size: usize,
    write_queue_timeout: Duration,
    actor_max_backoff: Duration,
    actor_time_limit: Duration,
    publish_timeout: Duration,
    history_timeout: Duration,
    result_ttl: Duration,
    task_deadline: Duration,
    db_session_max_tries: u32,
    worker_keepalive_timeout: Duration,
    worker_keepalive_interval: Duration,
    cron_cleanup: String,
    scheduler_interval: Duration,
    scheduler_delay: Duration,
    max_concurrent_tasks: usize,
    queue_poll_interval: Duration,
    flush_max_tries: u32,
    cdn_max_expire_days: u32,
    deferred_patterns: Vec<String>,
}

impl Settings {
    /// Creates a new settings builder with default values.
    pub fn builder() -> SettingsBuilder {
        SettingsBuilder::default()
    }

    /// Loads settings from a TOML file, falling back to defaults for any
    /// field the file leaves out.
    pub fn from_toml(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        let file: SettingsFile = toml::from_str(&raw)?;
        Ok(file.apply(Self::builder()).build())
    }

    /// Looks up an environment by name.
    pub fn environment(&self, name: &str) -> Option<&Environment> {
        self.environments.iter().find(|e| e.name() == name)
    }

    /// All configured environments.
    pub fn environments(&self) -> &[Environment] {
        &self.environments
    }

    /// Number of relational database connections in the pool.
    pub fn db_pool_size(&self) -> usize {
        self.db_pool_size
    }

    /// Page size when streaming items out of the database.
    pub fn item_yield_size(&self) -> usize {
        self.item_yield_size
    }

    /// Maximum entries per store write request.
    pub fn write_batch_size(&self) -> usize {
        self.write_batch_size
    }

    /// Attempts per batch before the writer gives up on it.
    pub fn write_max_tries(&self) -> u32 {
        self.write_max_tries
    }

    /// Size of the batched writer's consumer pool.
    pub fn write_max_workers(&self) -> usize {
        self.write_max_workers
    }

    /// Bounded queue depth between planner and writer pool.
    pub fn write_queue_size(&self) -> usize {
        self.write_queue_size
    }

    /// How long a producer may block on a full writer queue.
    pub fn write_queue_timeout(&self) -> Duration {
        self.write_queue_timeout
    }

    /// Upper bound on exponential backoff between write retries.
    pub fn actor_max_backoff(&self) -> Duration {
        self.actor_max_backoff
    }

    /// Wall-clock limit for one task execution attempt.
    pub fn actor_time_limit(&self) -> Duration {
        self.actor_time_limit
    }

    /// Age beyond which a still-open publish is considered abandoned.
    pub fn publish_timeout(&self) -> Duration {
        self.publish_timeout
    }

    /// Retention of terminal publishes and superseded store history.
    pub fn history_timeout(&self) -> Duration {
        self.history_timeout
    }

    /// Retention of terminal task rows and their results.
    pub fn result_ttl(&self) -> Duration {
        self.result_ttl
    }

    /// Hard bound on a task's total outstanding time.
    pub fn task_deadline(&self) -> Duration {
        self.task_deadline
    }

    /// Attempts per task before it is rejected.
    pub fn db_session_max_tries(&self) -> u32 {
        self.db_session_max_tries
    }

    /// Heartbeat age after which a worker is presumed dead.
    pub fn worker_keepalive_timeout(&self) -> Duration {
        self.worker_keepalive_timeout
    }

    /// Interval between worker heartbeats.
    pub fn worker_keepalive_interval(&self) -> Duration {
        self.worker_keepalive_interval
    }

    /// Cron expression gating the cleanup pass.
    pub fn cron_cleanup(&self) -> &str {
        &self.cron_cleanup
    }

    /// How often the scheduler wakes to run due maintenance.
    pub fn scheduler_interval(&self) -> Duration {
        self.scheduler_interval
    }

    /// Random startup jitter before the first scheduler pass.
    pub fn scheduler_delay(&self) -> Duration {
        self.scheduler_delay
    }

    /// Maximum tasks a worker executes concurrently.
    pub fn max_concurrent_tasks(&self) -> usize {
        self.max_concurrent_tasks
    }

    /// How often a worker polls the queue for claimable tasks.
    pub fn queue_poll_interval(&self) -> Duration {
        self.queue_poll_interval
    }

    /// Attempts per purge submission before logging and moving on.
    pub fn flush_max_tries(&self) -> u32 {
        self.flush_max_tries
    }

    /// Edge cache lifetime cap; stale caches expire by this even without a
    /// successful flush.
    pub fn cdn_max_expire_days(&self) -> u32 {
        self.cdn_max_expire_days
    }

    /// Path patterns whose writes are deferred to phase 2 of a commit.
    pub fn deferred_patterns(&self) -> &[String] {
        &self.deferred_patterns
    }
}

impl Default for Settings {
    fn default() -> Self {
        SettingsBuilder::default().build()
    }
}

/// Builder for [`Settings`].
#[derive(Debug, Clone)]
pub struct SettingsBuilder {
    config: Settings,
}

impl Default for SettingsBuilder {
    fn default() -> Self {
        Self {
            config: Settings {
                environments: Vec::new(),
                db_pool_size: 10,
                item_yield_size: 5000,
                write_batch_size: 25,
                write_max_tries: 20,
                write_max_workers: 4,
                write_queue_size: 1000,
                write_queue_timeout: Duration::from_secs(10 * 60),
                actor_max_backoff: Duration::from_secs(5 * 60),
                actor_time_limit: Duration::from_secs(30 * 60),
                publish_timeout: Duration::from_secs(24 * 60 * 60),
                history_timeout: Duration::from_secs(14 * 24 * 60 * 60),
                result_ttl: Duration::from_secs(7 * 24 * 60 * 60),
                task_deadline: Duration::from_secs(2 * 60 * 60),
                db_session_max_tries: 3,
                worker_keepalive_timeout: Duration::from_secs(5 * 60),
                worker_keepalive_interval: Duration::from_secs(60),
                cron_cleanup: "0 */12 * * *".to_string(),
                scheduler_interval: Duration::from_secs(15 * 60),
                scheduler_delay: Duration::from_secs(5 * 60),
                max_concurrent_tasks: 4,
                queue_poll_interval: Duration::from_secs(1),
                flush_max_tries: 3,
                cdn_max_expire_days: 365,
                deferred_patterns: vec![
                    r"/repomd\.xml$".to_string(),
                    r"/repomd\.xml\.asc$".to_string(),
                    r"/PULP_MANIFEST$".to_string(),
                    r"/listing$".to_string(),
                ],
            },
        }
    }
}

impl SettingsBuilder {
    /// Adds a target environment.
    pub fn environment(mut self, env: Environment) -> Self {
        self.config.environments.push(env);
        self
    }

    /// Sets the database pool size.
    pub fn db_pool_size(mut self, value: usize) -> Self {
        self.config.db_pool_size = value;
        self
    }

    /// Sets the item streaming page size.
    pub fn item_yield_size(mut self, value: usize) -> Self {
        self.config.item_yield_size = value;
        self
    }

    /// Sets the maximum entries per store write request.
    pub fn write_batch_size(mut self, value: usize) -> Self {
        self.config.write_batch_size = value;
        self
    }

    /// Sets the attempts per batch.
    pub fn write_max_tries(mut self, value: u32) -> Self {
        self.config.write_max_tries = value;
        self
    }

    /// Sets the writer pool size.
    pub fn write_max_workers(mut self, value: usize) -> Self {
        self.config.write_max_workers = value;
        self
    }

    /// Sets the writer queue depth.
    pub fn write_queue_size(mut self, value: usize) -> Self {
        self.config.write_queue_size = value;
        self
    }

    /// Sets the producer blocking bound on a full writer queue.
    pub fn write_queue_timeout(mut self, value: Duration) -> Self {
        self.config.write_queue_timeout = value;
        self
    }

    /// Sets the backoff cap between write retries.
    pub fn actor_max_backoff(mut self, value: Duration) -> Self {
        self.config.actor_max_backoff = value;
        self
    }

    /// Sets the per-attempt task execution limit.
    pub fn actor_time_limit(mut self, value: Duration) -> Self {
        self.config.actor_time_limit = value;
        self
    }

    /// Sets the abandoned-publish age bound.
    pub fn publish_timeout(mut self, value: Duration) -> Self {
        self.config.publish_timeout = value;
        self
    }

    /// Sets the terminal publish retention.
    pub fn history_timeout(mut self, value: Duration) -> Self {
        self.config.history_timeout = value;
        self
    }

    /// Sets the terminal task retention.
    pub fn result_ttl(mut self, value: Duration) -> Self {
        self.config.result_ttl = value;
        self
    }

    /// Sets the task deadline.
    pub fn task_deadline(mut self, value: Duration) -> Self {
        self.config.task_deadline = value;
        self
    }

    /// Sets the attempts per task.
    pub fn db_session_max_tries(mut self, value: u32) -> Self {
        self.config.db_session_max_tries = value;
        self
    }

    /// Sets the heartbeat staleness bound.
    pub fn worker_keepalive_timeout(mut self, value: Duration) -> Self {
        self.config.worker_keepalive_timeout = value;
        self
    }

    /// Sets the heartbeat interval.
    pub fn worker_keepalive_interval(mut self, value: Duration) -> Self {
        self.config.worker_keepalive_interval = value;
        self
    }

    /// Sets the cleanup cron expression.
    pub fn cron_cleanup(mut self, value: impl Into<String>) -> Self {
        self.config.cron_cleanup = value.into();
        self
    }

    /// Sets the scheduler wake interval.
    pub fn scheduler_interval(mut self, value: Duration) -> Self {
        self.config.scheduler_interval = value;
        self
    }

    /// Sets the scheduler startup jitter.
    pub fn scheduler_delay(mut self, value: Duration) -> Self {
        self.config.scheduler_delay = value;
        self
    }

    /// Sets the per-worker task concurrency.
    pub fn max_concurrent_tasks(mut self, value: usize) -> Self {
        self.config.max_concurrent_tasks = value;
        self
    }

    /// Sets the queue poll interval.
    pub fn queue_poll_interval(mut self, value: Duration) -> Self {
        self.config.queue_poll_interval = value;
        self
    }

    /// Sets the purge submission attempts.
    pub fn flush_max_tries(mut self, value: u32) -> Self {
        self.config.flush_max_tries = value;
        self
    }

    /// Sets the edge cache lifetime cap in days.
    pub fn cdn_max_expire_days(mut self, value: u32) -> Self {
        self.config.cdn_max_expire_days = value;
        self
    }

    /// Replaces the deferred path patterns.
    pub fn deferred_patterns(mut self, value: Vec<String>) -> Self {
        self.config.deferred_patterns = value;
        self
    }

    /// Builds the settings.
    pub fn build(self) -> Settings {
        self.config
    }
}

/// Raw file form of [`Settings`]; every field optional, durations in seconds.
#[derive(Debug, Default, Deserialize)]
struct SettingsFile {
    environments: Option<Vec<Environment>>,
    db_pool_size: Option<usize>,
    item_yield_size: Option<usize>,
    write_batch_size: Option<usize>,
    write_max_tries: Option<u32>,
    write_max_workers: Option<usize>,
    write_queue_size: Option<usize>,
    write_queue_timeout_secs: Option<u64>,
    actor_max_backoff_secs: Option<u64>,
    actor_time_limit_secs: Option<u64>,
    publish_timeout_secs: Option<u64>,
    history_timeout_secs: Option<u64>,
    result_ttl_secs: Option<u64>,
    task_deadline_secs: Option<u64>,
    db_session_max_tries: Option<u32>,
    worker_keepalive_timeout_secs: Option<u64>,
    worker_keepalive_interval_secs: Option<u64>,
    cron_cleanup: Option<String>,
    scheduler_interval_secs: Option<u64>,
    scheduler_delay_secs: Option<u64>,
    max_concurrent_tasks: Option<usize>,
    queue_poll_interval_secs: Option<u64>,
    flush_max_tries: Option<u32>,
    cdn_max_expire_days: Option<u32>,
    deferred_patterns: Option<Vec<String>>,
}

impl SettingsFile {
    fn apply(self, mut builder: SettingsBuilder) -> SettingsBuilder {
        if let Some(envs) = self.environments {
            for env in envs {
                builder = builder.environment(env);
            }
        }
        if let Some(v) = self.db_pool_size {
            builder = builder.db_pool_size(v);
        }
        if let Some(v) = self.item_yield_size {
            builder = builder.item_yield_size(v);
        }
        if let Some(v) = self.write_batch_size {
            builder = builder.write_batch_size(v);
        }
        if let Some(v) = self.write_max_tries {
            builder = builder.write_max_tries(v);
        }
        if let Some(v) = self.write_max_workers {
            builder = builder.write_max_workers(v);
        }
        if let Some(v) = self.write_queue_size {
            builder = builder.write_queue_size(v);
        }
        if let Some(v) = self.write_queue_timeout_secs {
            builder = builder.write_queue_timeout(Duration::from_secs(v));
        }
        if let Some(v) = self.actor_max_backoff_secs {
            builder = builder.actor_max_backoff(Duration::from_secs(v));
        }
        if let Some(v) = self.actor_time_limit_secs {
            builder = builder.actor_time_limit(Duration::from_secs(v));
        }
        if let Some(v) = self.publish_timeout_secs {
            builder = builder.publish_timeout(Duration::from_secs(v));
        }
        if let Some(v) = self.history_timeout_secs {
            builder = builder.history_timeout(Duration::from_secs(v));
        }
        if let Some(v) = self.result_ttl_secs {
            builder = builder.result_ttl(Duration::from_secs(v));
        }
        if let Some(v) = self.task_deadline_secs {
            builder = builder.task_deadline(Duration::from_secs(v));
        }
        if let Some(v) = self.db_session_max_tries {
            builder = builder.db_session_max_tries(v);
        }
        if let Some(v) = self.worker_keepalive_timeout_secs {
            builder = builder.worker_keepalive_timeout(Duration::from_secs(v));
        }
        if let Some(v) = self.worker_keepalive_interval_secs {
            builder = builder.worker_keepalive_interval(Duration::from_secs(v));
        }
        if let Some(v) = self.cron_cleanup {
            builder = builder.cron_cleanup(v);
        }
        if let Some(v) = self.scheduler_interval_secs {
            builder = builder.scheduler_interval(Duration::from_secs(v));
        }
        if let Some(v) = self.scheduler_delay_secs {
            builder = builder.scheduler_delay(Duration::from_secs(v));
        }
        if let Some(v) = self.max_concurrent_tasks {
            builder = builder.max_concurrent_tasks(v);
        }
        if let Some(v) = self.queue_poll_interval_secs {
            builder = builder.queue_poll_interval(Duration::from_secs(v));
        }
        if let Some(v) = self.flush_max_tries {
            builder = builder.flush_max_tries(v);
        }
        if let Some(v) = self.cdn_max_expire_days {
            builder = builder.cdn_max_expire_days(v);
        }
        if let Some(v) = self.deferred_patterns {
            builder = builder.deferred_patterns(v);
        }
        builder
    }
}

/// Resolves the database URL from the environment, loading `.env` if present.
pub fn database_url_from_env() -> Option<String> {
    dotenvy::dotenv().ok();
    std::env::var("DATABASE_URL").ok()
}

/// Converts a configured window to a chrono duration, clamping values chrono
/// cannot represent to ten years.
pub(crate) fn chrono_duration(window: Duration) -> chrono::Duration {
    chrono::Duration::from_std(window).unwrap_or_else(|_| chrono::Duration::days(3650))
}
