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

//! Error types used across the publish pipeline.
//!
//! The taxonomy separates synchronous rejections (validation, state
//! conflicts) from asynchronous store failures, which are further classified
//! as transient (retried with backoff) or permanent (failed immediately).

use thiserror::Error;
use uuid::Uuid;

/// Errors from invalid input data. Rejected synchronously, never retried.
#[derive(Debug, Error)]
pub enum ValidationError {
    /// Duplicate web URI within a single batch or against stored items.
    #[error("Duplicate web_uri in publish: '{0}'")]
    DuplicatePath(String),

    /// Web URIs must be absolute paths under the CDN root.
    #[error("Invalid web_uri (must be an absolute path): '{0}'")]
    InvalidPath(String),

    /// Object keys are lowercase hex SHA-256 digests of uploaded content.
    #[error("Invalid object_key (expected 64-char lowercase hex digest): '{0}'")]
    InvalidObjectKey(String),

    /// An item must reference content either directly or via a link.
    #[error("Item '{0}' must have exactly one of object_key or link_to")]
    AmbiguousContentSource(String),

    /// Link targets must be absolute web URIs.
    #[error("Invalid link_to (must be an absolute path): '{0}'")]
    InvalidLinkTarget(String),

    /// The named environment is not configured.
    #[error("Unknown environment: '{0}'")]
    UnknownEnvironment(String),
}

/// Errors from operating on a publish in the wrong state.
#[derive(Debug, Error)]
pub enum ConflictError {
    /// Items can be added and commits requested only while a publish is
    /// still pending.
    #[error("Publish {id} is in state '{state}' and can no longer be modified")]
    PublishNotPending { id: Uuid, state: String },
}

/// Errors from the relational database layer.
#[derive(Debug, Error)]
pub enum DatabaseError {
    #[error("Connection pool error: {0}")]
    ConnectionPool(String),

    #[error("Query failed: {0}")]
    Query(#[from] diesel::result::Error),

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Errors from the external versioned config store.
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    /// Timeouts, throttling, unprocessed batch remainders. Safe to retry.
    #[error("Transient store error: {0}")]
    Transient(String),

    /// Malformed or oversized writes. Retrying cannot help.
    #[error("Permanent store error: {0}")]
    Permanent(String),
}

impl StoreError {
    /// Whether a retry with backoff may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Transient(_))
    }
}

/// Errors from publish manager operations.
#[derive(Debug, Error)]
pub enum PublishError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Conflict(#[from] ConflictError),

    #[error(transparent)]
    Database(#[from] DatabaseError),

    #[error("Publish not found: {0}")]
    NotFound(Uuid),
}

/// Errors from a commit attempt.
///
/// [`CommitError::is_retryable`] decides whether the worker requeues the
/// task: database failures are retried (writes are idempotent, so a new
/// attempt redoes the plan safely), while plan-level failures are final
/// because the write retry budget was already spent inside the batched
/// writer. A payload that fails to deserialize fails the same way on every
/// attempt and is rejected outright.
#[derive(Debug, Error)]
pub enum CommitError {
    #[error(transparent)]
    Database(#[from] DatabaseError),

    #[error("Serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Broken deployment configuration, e.g. an invalid deferred pattern.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// A link_to item whose target is absent from the publish.
    #[error("Unable to resolve link in publish: {web_uri} => {link_to}")]
    UnresolvedLink { web_uri: String, link_to: String },

    /// The publish named by the task payload does not exist.
    #[error("Publish not found: {0}")]
    PublishNotFound(Uuid),

    /// The batched writer reported failures after exhausting retries.
    #[error("Commit {phase} failed: {failed} of {total} writes did not complete")]
    PhaseFailed {
        phase: &'static str,
        failed: usize,
        total: usize,
    },

    /// The publish left the committing state underneath the task.
    #[error("Publish {id} is in state '{state}', expected '{expected}'")]
    WrongPublishState {
        id: Uuid,
        state: String,
        expected: String,
    },

    /// The task outlived its deadline before the commit completed.
    #[error("Commit task for publish {id} exceeded its deadline")]
    DeadlineExceeded { id: Uuid },
}

impl CommitError {
    /// Whether the owning task should be requeued for another attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(self, CommitError::Database(_))
    }
}

/// Errors from cache flush submission. Always non-fatal to the commit.
#[derive(Debug, Error)]
pub enum FlushError {
    #[error("Purge request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Purge endpoint returned status {0}")]
    Status(u16),

    #[error("Invalid purge URL '{0}': {1}")]
    InvalidUrl(String, String),
}

impl FlushError {
    /// Whether resubmitting the purge may succeed. Throttling and server
    /// errors are worth another try; client errors are not.
    pub fn is_retryable(&self) -> bool {
        match self {
            FlushError::Http(_) => true,
            FlushError::Status(status) => *status == 429 || (500..600).contains(status),
            FlushError::InvalidUrl(_, _) => false,
        }
    }
}

/// Errors from configuration loading and validation.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid pattern '{pattern}': {source}")]
    InvalidPattern {
        pattern: String,
        source: regex::Error,
    },

    #[error("Invalid cron expression '{0}'")]
    InvalidCron(String),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Errors starting the worker pool.
#[derive(Debug, Error)]
pub enum WorkerError {
    #[error(transparent)]
    Database(#[from] DatabaseError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}
