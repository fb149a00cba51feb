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

//! Task Model
//!
//! Tasks are durable queue entries living in the same relational database as
//! the publishes they act on, so enqueueing a task and flipping a publish
//! state commit in one transaction. Workers claim tasks by flipping
//! `queued` rows to `consumed` under their own consumer id.

use std::fmt;
use std::str::FromStr;

use chrono::NaiveDateTime;
use diesel::prelude::*;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Queue carrying publish commit tasks.
pub const COMMIT_QUEUE: &str = "commits";

/// Queue carrying cache flush tasks.
pub const FLUSH_QUEUE: &str = "flushes";

/// Lifecycle state of a task.
///
/// Stored in lowercase. The API layer maps these to the coarser external
/// vocabulary (`QUEUED`, `IN_PROGRESS`, `COMPLETE`, `FAILED`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskState {
    /// Waiting to be claimed, or returned after a failed attempt.
    Queued,
    /// Claimed by a worker and executing.
    Consumed,
    /// Finished successfully. Terminal.
    Done,
    /// Failed permanently or exhausted its attempts. Terminal.
    Rejected,
}

impl TaskState {
    /// Stored string form of this state.
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskState::Queued => "queued",
            TaskState::Consumed => "consumed",
            TaskState::Done => "done",
            TaskState::Rejected => "rejected",
        }
    }

    /// External (API) name for this state.
    pub fn external_str(&self) -> &'static str {
        match self {
            TaskState::Queued => "QUEUED",
            TaskState::Consumed => "IN_PROGRESS",
            TaskState::Done => "COMPLETE",
            TaskState::Rejected => "FAILED",
        }
    }

    /// Whether this state permits no further transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskState::Done | TaskState::Rejected)
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(TaskState::Queued),
            "consumed" => Ok(TaskState::Consumed),
            "done" => Ok(TaskState::Done),
            "rejected" => Ok(TaskState::Rejected),
            other => Err(format!("unknown task state: {}", other)),
        }
    }
}

/// Represents a task record in the database.
#[derive(Debug, Clone, Queryable, Selectable, Serialize, Deserialize)]
#[diesel(table_name = crate::database::schema::tasks)]
pub struct Task {
    /// Unique identifier (UUID, stored in hyphenated text form)
    pub id: String,
    /// Queue this task belongs to
    pub queue: String,
    /// Current lifecycle state
    pub state: String,
    /// Timestamp of the last state change; claim order follows it
    pub mtime: NaiveDateTime,
    /// JSON-serialized work description
    pub payload: String,
    /// JSON-serialized outcome, set on completion
    pub result: Option<String>,
    /// When the stored result (and the row) may be deleted
    pub result_expiry: Option<NaiveDateTime>,
    /// Execution attempts made so far
    pub attempt: i32,
    /// Attempts allowed before the task is rejected
    pub max_attempts: i32,
    /// Worker currently holding the task, while `consumed`
    pub consumer_id: Option<String>,
    /// Hard wall-clock bound on total outstanding time
    pub deadline: Option<NaiveDateTime>,
}

impl Task {
    /// Whether the task's deadline has passed as of `now`.
    pub fn deadline_expired(&self, now: NaiveDateTime) -> bool {
        matches!(self.deadline, Some(deadline) if deadline < now)
    }
}

/// Represents a new task to be inserted into the database.
///
/// `attempt` starts at the column default of zero.
#[derive(Debug, Insertable)]
#[diesel(table_name = crate::database::schema::tasks)]
pub struct NewTask {
    /// Unique identifier (UUID, stored in hyphenated text form)
    pub id: String,
    /// Queue this task belongs to
    pub queue: String,
    /// Initial lifecycle state, always `queued`
    pub state: String,
    /// Enqueue timestamp
    pub mtime: NaiveDateTime,
    /// JSON-serialized work description
    pub payload: String,
    /// Attempts allowed before the task is rejected
    pub max_attempts: i32,
    /// Hard wall-clock bound on total outstanding time
    pub deadline: Option<NaiveDateTime>,
}

/// Work description for a publish commit task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommitPayload {
    /// Publish to commit
    pub publish_id: Uuid,
    /// Environment the publish targets
    pub env: String,
    /// Store version stamp for every entry written by this commit
    pub from_date: NaiveDateTime,
}

/// Work description for a standalone cache flush task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlushPayload {
    /// Environment whose flush rules apply
    pub env: String,
    /// CDN paths to flush
    pub paths: Vec<String>,
}
