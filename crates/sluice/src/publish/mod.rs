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

//! Publish Manager
//!
//! The synchronous face of the pipeline: creating publishes, validating and
//! adding items, and turning a finished publish into a queued commit task.
//! Everything here answers immediately; the heavy lifting happens later on
//! a worker.
//!
//! Item validation is strict at intake so commits never meet malformed
//! data: paths absolute, object keys 64-char lowercase hex, exactly one
//! content source per item, no duplicate paths.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{NaiveDateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::{chrono_duration, Settings};
use crate::dal::item::LinkResolution;
use crate::dal::DAL;
use crate::error::{CommitError, ConfigError, ConflictError, PublishError, ValidationError};
use crate::models::item::{Item, NewItem};
use crate::models::publish::{Publish, PublishState};
use crate::models::task::{CommitPayload, FlushPayload, Task, COMMIT_QUEUE, FLUSH_QUEUE};
use crate::store::ConfigEntry;

/// One incoming item: a path plus its content source.
///
/// Doubles as the wire form for item batches; exactly one of `object_key`
/// and `link_to` must be set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ItemInput {
    /// Absolute path under the CDN root
    pub web_uri: String,
    /// Checksum key of previously uploaded content
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub object_key: Option<String>,
    /// MIME type to serve
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    /// Path of another item in the same publish to mirror
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub link_to: Option<String>,
}

impl ItemInput {
    /// An item backed directly by an object key.
    pub fn content(
        web_uri: impl Into<String>,
        object_key: impl Into<String>,
        content_type: Option<String>,
    ) -> Self {
        Self {
            web_uri: web_uri.into(),
            object_key: Some(object_key.into()),
            content_type,
            link_to: None,
        }
    }

    /// An item aliasing another path in the same publish.
    pub fn link(web_uri: impl Into<String>, link_to: impl Into<String>) -> Self {
        Self {
            web_uri: web_uri.into(),
            object_key: None,
            content_type: None,
            link_to: Some(link_to.into()),
        }
    }
}

/// Classification rules for one commit run: which paths are written in
/// phase 2, and the shared `from_date` stamped on every entry.
#[derive(Debug)]
pub struct WritePlan {
    from_date: NaiveDateTime,
    deferred: Vec<Regex>,
}

impl WritePlan {
    /// The `from_date` shared by every entry of this commit.
    pub fn from_date(&self) -> NaiveDateTime {
        self.from_date
    }

    /// Whether an item's write is deferred to phase 2.
    ///
    /// Deferred: paths matching a configured pattern (listings, repository
    /// indexes), plus everything that arrived as a link. Both are discovery
    /// points; clients must not see them until the content they reference
    /// is durable.
    pub fn is_deferred(&self, item: &Item) -> bool {
        item.is_link() || self.deferred.iter().any(|re| re.is_match(&item.web_uri))
    }

    /// Splits one page of items into (phase 1, phase 2) store entries.
    pub fn partition(&self, items: Vec<Item>) -> (Vec<ConfigEntry>, Vec<ConfigEntry>) {
        let mut phase1 = Vec::new();
        let mut phase2 = Vec::new();

        for item in items {
            let Some(object_key) = item.object_key.clone() else {
                // Links are resolved before planning, so every item should
                // carry a key by now.
                warn!(web_uri = %item.web_uri, "Skipping item with no object key");
                continue;
            };
            let entry = ConfigEntry::new(
                item.web_uri.clone(),
                self.from_date,
                object_key,
                item.content_type.clone(),
            );
            if self.is_deferred(&item) {
                phase2.push(entry);
            } else {
                phase1.push(entry);
            }
        }

        (phase1, phase2)
    }
}

/// Orchestrates the publish lifecycle up to the point a commit is queued.
#[derive(Clone)]
pub struct PublishManager {
    dal: Arc<DAL>,
    settings: Arc<Settings>,
}

impl PublishManager {
    /// Creates a new manager.
    pub fn new(dal: Arc<DAL>, settings: Arc<Settings>) -> Self {
        Self { dal, settings }
    }

    /// Creates a new `PENDING` publish in `env`.
    pub async fn create_publish(&self, env: &str) -> Result<Publish, PublishError> {
        if self.settings.environment(env).is_none() {
            return Err(ValidationError::UnknownEnvironment(env.to_string()).into());
        }

        let publish = self.dal.publish().create(env).await?;
        info!(publish_id = %publish.id, env, "Created publish");
        Ok(publish)
    }

    /// Loads a publish, or fails with `NotFound`.
    pub async fn get_publish(&self, publish_id: Uuid) -> Result<Publish, PublishError> {
        self.dal
            .publish()
            .get(publish_id)
            .await?
            .ok_or(PublishError::NotFound(publish_id))
    }

    /// Validates and adds a batch of items to a `PENDING` publish. The whole
    /// batch is accepted or rejected; nothing partial is stored.
    pub async fn add_items(
        &self,
        publish_id: Uuid,
        items: Vec<ItemInput>,
    ) -> Result<usize, PublishError> {
        let publish = self.get_publish(publish_id).await?;
        if publish.state != PublishState::Pending.as_str() {
            return Err(ConflictError::PublishNotPending {
                id: publish_id,
                state: publish.state,
            }
            .into());
        }

        validate_batch(&items)?;

        // Re-adding a path already on the publish is rejected too.
        let uris: Vec<String> = items.iter().map(|i| i.web_uri.clone()).collect();
        let existing = self.dal.item().by_uris(publish_id, uris).await?;
        if let Some(item) = existing.first() {
            return Err(ValidationError::DuplicatePath(item.web_uri.clone()).into());
        }

        let now = Utc::now().naive_utc();
        let new_items: Vec<NewItem> = items
            .into_iter()
            .map(|input| NewItem {
                id: Uuid::new_v4().to_string(),
                publish_id: publish_id.to_string(),
                web_uri: input.web_uri,
                object_key: input.object_key,
                content_type: input.content_type,
                link_to: input.link_to,
                updated: now,
            })
            .collect();

        let inserted = self
            .dal
            .item()
            .insert_batch(publish_id, new_items, self.settings.write_batch_size())
            .await?;

        debug!(publish_id = %publish_id, inserted, "Added items to publish");
        Ok(inserted)
    }

    /// Requests an asynchronous commit of a `PENDING` publish.
    ///
    /// Atomically flips the publish to `COMMITTING` and enqueues the commit
    /// task; the task's payload carries the single `from_date` every store
    /// entry of this commit will share.
    pub async fn request_commit(&self, publish_id: Uuid) -> Result<Task, PublishError> {
        let publish = self.get_publish(publish_id).await?;
        if publish.state != PublishState::Pending.as_str() {
            return Err(ConflictError::PublishNotPending {
                id: publish_id,
                state: publish.state,
            }
            .into());
        }

        let now = Utc::now().naive_utc();
        let payload = CommitPayload {
            publish_id,
            env: publish.env.clone(),
            from_date: now,
        };
        let payload_json =
            serde_json::to_string(&payload).map_err(crate::error::DatabaseError::from)?;

        let deadline = now + chrono_duration(self.settings.task_deadline());
        let task = self
            .dal
            .publish()
            .begin_commit(
                publish_id,
                COMMIT_QUEUE,
                payload_json,
                self.settings.db_session_max_tries() as i32,
                deadline,
                now,
            )
            .await?;

        match task {
            Some(task) => {
                info!(publish_id = %publish_id, task_id = %task.id, "Commit requested");
                Ok(task)
            }
            None => {
                // Lost the race; report whatever state won.
                let current = self.get_publish(publish_id).await?;
                Err(ConflictError::PublishNotPending {
                    id: publish_id,
                    state: current.state,
                }
                .into())
            }
        }
    }

    /// Enqueues a standalone cache flush of `paths` in `env`.
    pub async fn request_flush(
        &self,
        env: &str,
        paths: Vec<String>,
    ) -> Result<Task, PublishError> {
        if self.settings.environment(env).is_none() {
            return Err(ValidationError::UnknownEnvironment(env.to_string()).into());
        }
        for path in &paths {
            if !path.starts_with('/') {
                return Err(ValidationError::InvalidPath(path.clone()).into());
            }
        }

        let payload = FlushPayload {
            env: env.to_string(),
            paths,
        };
        let payload_json =
            serde_json::to_string(&payload).map_err(crate::error::DatabaseError::from)?;

        let now = Utc::now().naive_utc();
        let deadline = now + chrono_duration(self.settings.task_deadline());
        let task = self
            .dal
            .task()
            .enqueue(
                FLUSH_QUEUE,
                payload_json,
                self.settings.db_session_max_tries() as i32,
                Some(deadline),
            )
            .await?;

        info!(env, task_id = %task.id, "Cache flush requested");
        Ok(task)
    }

    /// Resolves every link item of a publish to its target's content.
    ///
    /// Single pass: a link whose target is itself an unresolved link fails.
    /// Targets must carry both an object key and a content type. Safe to
    /// rerun; a second pass reapplies the same values.
    pub async fn resolve_links(&self, publish_id: Uuid) -> Result<usize, CommitError> {
        let link_items = self.dal.item().link_items(publish_id).await?;
        if link_items.is_empty() {
            return Ok(0);
        }

        let target_uris: Vec<String> = link_items
            .iter()
            .filter_map(|item| item.link_to.clone())
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();
        let targets = self.dal.item().by_uris(publish_id, target_uris).await?;

        let mut resolutions = Vec::with_capacity(link_items.len());
        let now = Utc::now().naive_utc();

        for link_item in &link_items {
            let Some(link_to) = link_item.link_to.as_deref() else {
                continue;
            };
            let target = targets.iter().find(|t| t.web_uri == link_to);
            let resolved = target.and_then(|t| {
                match (&t.object_key, &t.content_type) {
                    (Some(key), Some(content_type)) => Some((key.clone(), content_type.clone())),
                    _ => None,
                }
            });

            match resolved {
                Some((object_key, content_type)) => resolutions.push(LinkResolution {
                    item_id: link_item.id.clone(),
                    object_key,
                    content_type: Some(content_type),
                }),
                None => {
                    return Err(CommitError::UnresolvedLink {
                        web_uri: link_item.web_uri.clone(),
                        link_to: link_to.to_string(),
                    });
                }
            }
        }

        let resolved = self
            .dal
            .item()
            .apply_link_resolutions(resolutions, now)
            .await?;
        debug!(publish_id = %publish_id, resolved, "Resolved links");
        Ok(resolved)
    }

    /// Builds the classification rules for one commit run.
    pub fn build_write_plan(&self, from_date: NaiveDateTime) -> Result<WritePlan, ConfigError> {
        Ok(WritePlan {
            from_date,
            deferred: compile_patterns(self.settings.deferred_patterns())?,
        })
    }
}

fn compile_patterns(patterns: &[String]) -> Result<Vec<Regex>, ConfigError> {
    patterns
        .iter()
        .map(|pattern| {
            Regex::new(pattern).map_err(|source| ConfigError::InvalidPattern {
                pattern: pattern.clone(),
                source,
            })
        })
        .collect()
}

/// Validates a batch of incoming items.
fn validate_batch(items: &[ItemInput]) -> Result<(), ValidationError> {
    let mut seen = HashSet::with_capacity(items.len());

    for item in items {
        if item.web_uri.is_empty() || !item.web_uri.starts_with('/') {
            return Err(ValidationError::InvalidPath(item.web_uri.clone()));
        }
        if !seen.insert(item.web_uri.as_str()) {
            return Err(ValidationError::DuplicatePath(item.web_uri.clone()));
        }

        match (&item.object_key, &item.link_to) {
            (Some(key), None) => {
                if !is_valid_object_key(key) {
                    return Err(ValidationError::InvalidObjectKey(key.clone()));
                }
            }
            (None, Some(link_to)) => {
                if link_to.is_empty() || !link_to.starts_with('/') || link_to == &item.web_uri {
                    return Err(ValidationError::InvalidLinkTarget(link_to.clone()));
                }
            }
            _ => {
                return Err(ValidationError::AmbiguousContentSource(
                    item.web_uri.clone(),
                ));
            }
        }
    }

    Ok(())
}

/// An object key is the SHA-256 of uploaded content: 64 lowercase hex chars.
fn is_valid_object_key(key: &str) -> bool {
    key.len() == 64
        && !key.bytes().any(|b| b.is_ascii_uppercase())
        && hex::decode(key).is_ok()
}
