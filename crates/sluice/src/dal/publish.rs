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

//! Publish DAL
//!
//! Publish lifecycle queries. State transitions are compare-and-set so two
//! concurrent callers can never both move the same publish; the caller that
//! loses the race reloads and reports the conflict.

use chrono::{NaiveDateTime, Utc};
use diesel::prelude::*;
use uuid::Uuid;

use super::DAL;
use crate::database::schema::{items, publishes, tasks};
use crate::error::DatabaseError;
use crate::models::publish::{NewPublish, Publish, PublishState};
use crate::models::task::{NewTask, Task, TaskState};

/// Data access operations for publishes.
pub struct PublishDAL<'a> {
    dal: &'a DAL,
}

impl<'a> PublishDAL<'a> {
    /// Creates a new PublishDAL instance.
    pub fn new(dal: &'a DAL) -> Self {
        PublishDAL { dal }
    }

    /// Creates a new publish in `PENDING` state.
    pub async fn create(&self, env: &str) -> Result<Publish, DatabaseError> {
        let conn = self.dal.database.connection().await?;

        let new_publish = NewPublish {
            id: Uuid::new_v4().to_string(),
            env: env.to_string(),
            state: PublishState::Pending.as_str().to_string(),
            updated: Utc::now().naive_utc(),
        };
        let publish = Publish {
            id: new_publish.id.clone(),
            env: new_publish.env.clone(),
            state: new_publish.state.clone(),
            updated: new_publish.updated,
        };

        conn.interact(move |conn| {
            diesel::insert_into(publishes::table)
                .values(&new_publish)
                .execute(conn)
        })
        .await
        .map_err(|e| DatabaseError::ConnectionPool(e.to_string()))??;

        Ok(publish)
    }

    /// Retrieves a publish by id, or `None` if it does not exist.
    pub async fn get(&self, id: Uuid) -> Result<Option<Publish>, DatabaseError> {
        let conn = self.dal.database.connection().await?;

        let id_text = id.to_string();
        let publish = conn
            .interact(move |conn| {
                publishes::table
                    .find(id_text)
                    .first::<Publish>(conn)
                    .optional()
            })
            .await
            .map_err(|e| DatabaseError::ConnectionPool(e.to_string()))??;

        Ok(publish)
    }

    /// Moves a publish from `from` to `to` if and only if it is still in
    /// `from`. Returns whether the transition happened.
    pub async fn transition(
        &self,
        id: Uuid,
        from: PublishState,
        to: PublishState,
    ) -> Result<bool, DatabaseError> {
        let conn = self.dal.database.connection().await?;

        let id_text = id.to_string();
        let rows = conn
            .interact(move |conn| {
                diesel::update(
                    publishes::table
                        .find(id_text)
                        .filter(publishes::state.eq(from.as_str())),
                )
                .set((
                    publishes::state.eq(to.as_str()),
                    publishes::updated.eq(Utc::now().naive_utc()),
                ))
                .execute(conn)
            })
            .await
            .map_err(|e| DatabaseError::ConnectionPool(e.to_string()))??;

        Ok(rows == 1)
    }

    /// Atomically moves a `PENDING` publish to `COMMITTING` and enqueues its
    /// commit task. Returns `None` if the publish was no longer `PENDING`,
    /// in which case nothing was written.
    pub async fn begin_commit(
        &self,
        id: Uuid,
        queue: &str,
        payload: String,
        max_attempts: i32,
        deadline: NaiveDateTime,
        now: NaiveDateTime,
    ) -> Result<Option<Task>, DatabaseError> {
        let conn = self.dal.database.connection().await?;

        let id_text = id.to_string();
        let new_task = NewTask {
            id: Uuid::new_v4().to_string(),
            queue: queue.to_string(),
            state: TaskState::Queued.as_str().to_string(),
            mtime: now,
            payload,
            max_attempts,
            deadline: Some(deadline),
        };
        let task = Task {
            id: new_task.id.clone(),
            queue: new_task.queue.clone(),
            state: new_task.state.clone(),
            mtime: new_task.mtime,
            payload: new_task.payload.clone(),
            result: None,
            result_expiry: None,
            attempt: 0,
            max_attempts: new_task.max_attempts,
            consumer_id: None,
            deadline: new_task.deadline,
        };

        let committed = conn
            .interact(move |conn| {
                conn.transaction::<bool, diesel::result::Error, _>(|conn| {
                    let rows = diesel::update(
                        publishes::table
                            .find(&id_text)
                            .filter(publishes::state.eq(PublishState::Pending.as_str())),
                    )
                    .set((
                        publishes::state.eq(PublishState::Committing.as_str()),
                        publishes::updated.eq(now),
                    ))
                    .execute(conn)?;

                    if rows == 0 {
                        return Ok(false);
                    }

                    diesel::insert_into(tasks::table)
                        .values(&new_task)
                        .execute(conn)?;

                    Ok(true)
                })
            })
            .await
            .map_err(|e| DatabaseError::ConnectionPool(e.to_string()))??;

        Ok(committed.then_some(task))
    }

    /// Fails every non-terminal publish last touched before `cutoff`.
    /// Returns how many were failed.
    pub async fn fail_abandoned(&self, cutoff: NaiveDateTime) -> Result<usize, DatabaseError> {
        let conn = self.dal.database.connection().await?;

        let rows = conn
            .interact(move |conn| {
                diesel::update(
                    publishes::table
                        .filter(publishes::state.eq_any(vec![
                            PublishState::Pending.as_str(),
                            PublishState::Committing.as_str(),
                        ]))
                        .filter(publishes::updated.lt(cutoff)),
                )
                .set((
                    publishes::state.eq(PublishState::Failed.as_str()),
                    publishes::updated.eq(Utc::now().naive_utc()),
                ))
                .execute(conn)
            })
            .await
            .map_err(|e| DatabaseError::ConnectionPool(e.to_string()))??;

        Ok(rows)
    }

    /// Deletes terminal publishes last touched before `cutoff`, along with
    /// their items. Returns how many publishes were deleted.
    pub async fn delete_old(&self, cutoff: NaiveDateTime) -> Result<usize, DatabaseError> {
        let conn = self.dal.database.connection().await?;

        let deleted = conn
            .interact(move |conn| {
                conn.transaction::<usize, diesel::result::Error, _>(|conn| {
                    let old_ids: Vec<String> = publishes::table
                        .filter(publishes::state.eq_any(vec![
                            PublishState::Committed.as_str(),
                            PublishState::Failed.as_str(),
                        ]))
                        .filter(publishes::updated.lt(cutoff))
                        .select(publishes::id)
                        .load(conn)?;

                    if old_ids.is_empty() {
                        return Ok(0);
                    }

                    diesel::delete(items::table.filter(items::publish_id.eq_any(&old_ids)))
                        .execute(conn)?;
                    diesel::delete(publishes::table.filter(publishes::id.eq_any(&old_ids)))
                        .execute(conn)?;

                    Ok(old_ids.len())
                })
            })
            .await
            .map_err(|e| DatabaseError::ConnectionPool(e.to_string()))??;

        Ok(deleted)
    }
}
