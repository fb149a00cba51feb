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

//! JSON-facing views of pipeline objects.
//!
//! These DTOs are protocol-agnostic: any transport that speaks JSON can
//! serialize them as-is. They differ from the `models` rows in two ways.
//! Each object carries navigation links, and task state appears in its
//! external form (`QUEUED`/`IN_PROGRESS`/`COMPLETE`/`FAILED`) rather than
//! the queue's internal names.
//!
//! A commit request answers with a [`Task`] view of the freshly queued
//! task; clients poll that task's `self` link until the state is terminal.
//!
//! Item batches are accepted as lists of [`ItemInput`](crate::publish::ItemInput).

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

use crate::models;
use crate::models::task::TaskState;

/// Navigation links for a publish.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishLinks {
    /// Path of the publish itself.
    #[serde(rename = "self")]
    pub self_link: String,
    /// Path to request a commit of the publish.
    pub commit: String,
}

impl PublishLinks {
    fn new(env: &str, id: &str) -> Self {
        let self_link = format!("/{}/publish/{}", env, id);
        let commit = format!("{}/commit", self_link);
        Self { self_link, commit }
    }
}

/// A publish with its links, optionally carrying its items.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Publish {
    pub id: String,
    pub env: String,
    pub state: String,
    pub links: PublishLinks,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub items: Vec<Item>,
}

impl Publish {
    /// View of `row` including `items`.
    pub fn with_items(row: &models::Publish, items: Vec<Item>) -> Self {
        Self {
            links: PublishLinks::new(&row.env, &row.id),
            id: row.id.clone(),
            env: row.env.clone(),
            state: row.state.clone(),
            items,
        }
    }
}

impl From<&models::Publish> for Publish {
    fn from(row: &models::Publish) -> Self {
        Publish::with_items(row, Vec::new())
    }
}

/// One published path and its content source.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Item {
    pub web_uri: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub object_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub link_to: Option<String>,
}

impl From<&models::Item> for Item {
    fn from(row: &models::Item) -> Self {
        Self {
            web_uri: row.web_uri.clone(),
            object_key: row.object_key.clone(),
            content_type: row.content_type.clone(),
            link_to: row.link_to.clone(),
        }
    }
}

/// Navigation links for a task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskLinks {
    /// Path to poll this task.
    #[serde(rename = "self")]
    pub self_link: String,
}

/// A queued task as seen by clients polling for completion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    /// External state name; see [`TaskState::external_str`].
    pub state: String,
    /// Timestamp of the last state change.
    pub updated: NaiveDateTime,
    pub links: TaskLinks,
    /// Recorded outcome, present once the task is terminal.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
}

impl From<&models::Task> for Task {
    fn from(row: &models::Task) -> Self {
        // An unrecognized state is passed through rather than dropped; it
        // can only come from a newer schema revision.
        let state = row
            .state
            .parse::<TaskState>()
            .map(|s| s.external_str().to_string())
            .unwrap_or_else(|_| row.state.to_uppercase());

        Self {
            id: row.id.clone(),
            state,
            updated: row.mtime,
            links: TaskLinks {
                self_link: format!("/task/{}", row.id),
            },
            result: row
                .result
                .as_deref()
                .and_then(|raw| serde_json::from_str(raw).ok()),
        }
    }
}

/// A human-readable message, used for error detail bodies.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageResponse {
    pub detail: String,
}
