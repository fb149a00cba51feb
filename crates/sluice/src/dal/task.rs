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

//! Task DAL
//!
//! Durable queue operations over the `tasks` table. Claiming is the one
//! place where the two backends diverge: PostgreSQL claims with a single
//! `FOR UPDATE SKIP LOCKED` statement so concurrent workers never block each
//! other, while SQLite serializes claimants through an immediate transaction
//! (there is only one writer anyway).
//!
//! Every state change also bumps `mtime`, which doubles as the claim
//! ordering key via the `(state, mtime)` index.

use chrono::{NaiveDateTime, Utc};
use diesel::prelude::*;
use uuid::Uuid;

use super::DAL;
use crate::database::connection::AnyConnection;
use crate::database::schema::{tasks, workers};
use crate::error::DatabaseError;
use crate::models::task::{NewTask, Task, TaskState};

/// Row shape returned by the PostgreSQL claim statement.
#[derive(Debug, QueryableByName)]
struct ClaimedRow {
    #[diesel(sql_type = diesel::sql_types::Text)]
    id: String,
    #[diesel(sql_type = diesel::sql_types::Text)]
    queue: String,
    #[diesel(sql_type = diesel::sql_types::Text)]
    state: String,
    #[diesel(sql_type = diesel::sql_types::Timestamp)]
    mtime: NaiveDateTime,
    #[diesel(sql_type = diesel::sql_types::Text)]
    payload: String,
    #[diesel(sql_type = diesel::sql_types::Nullable<diesel::sql_types::Text>)]
    result: Option<String>,
    #[diesel(sql_type = diesel::sql_types::Nullable<diesel::sql_types::Timestamp>)]
    result_expiry: Option<NaiveDateTime>,
    #[diesel(sql_type = diesel::sql_types::Integer)]
    attempt: i32,
    #[diesel(sql_type = diesel::sql_types::Integer)]
    max_attempts: i32,
    #[diesel(sql_type = diesel::sql_types::Nullable<diesel::sql_types::Text>)]
    consumer_id: Option<String>,
    #[diesel(sql_type = diesel::sql_types::Nullable<diesel::sql_types::Timestamp>)]
    deadline: Option<NaiveDateTime>,
}

impl From<ClaimedRow> for Task {
    fn from(row: ClaimedRow) -> Self {
        Task {
            id: row.id,
            queue: row.queue,
            state: row.state,
            mtime: row.mtime,
            payload: row.payload,
            result: row.result,
            result_expiry: row.result_expiry,
            attempt: row.attempt,
            max_attempts: row.max_attempts,
            consumer_id: row.consumer_id,
            deadline: row.deadline,
        }
    }
}

/// Data access operations for the durable task queue.
pub struct TaskDAL<'a> {
    dal: &'a DAL,
}

impl<'a> TaskDAL<'a> {
    /// Creates a new TaskDAL instance.
    pub fn new(dal: &'a DAL) -> Self {
        TaskDAL { dal }
    }

    /// Enqueues a new task in `queued` state.
    pub async fn enqueue(
        &self,
        queue: &str,
        payload: String,
        max_attempts: i32,
        deadline: Option<NaiveDateTime>,
    ) -> Result<Task, DatabaseError> {
        let conn = self.dal.database.connection().await?;

        let new_task = NewTask {
            id: Uuid::new_v4().to_string(),
            queue: queue.to_string(),
            state: TaskState::Queued.as_str().to_string(),
            mtime: Utc::now().naive_utc(),
            payload,
            max_attempts,
            deadline,
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

        conn.interact(move |conn| {
            diesel::insert_into(tasks::table)
                .values(&new_task)
                .execute(conn)
        })
        .await
        .map_err(|e| DatabaseError::ConnectionPool(e.to_string()))??;

        Ok(task)
    }

    /// Retrieves a task by id, or `None` if it does not exist.
    pub async fn get(&self, id: Uuid) -> Result<Option<Task>, DatabaseError> {
        let conn = self.dal.database.connection().await?;

        let id_text = id.to_string();
        let task = conn
            .interact(move |conn| tasks::table.find(id_text).first::<Task>(conn).optional())
            .await
            .map_err(|e| DatabaseError::ConnectionPool(e.to_string()))??;

        Ok(task)
    }

    /// Atomically claims the oldest `queued` task for `consumer_id`, flipping
    /// it to `consumed`. Returns `None` when the queue is empty.
    ///
    /// Exactly one of two racing claimants can win a given row. On
    /// PostgreSQL the losing claimant skips the locked row and takes the
    /// next one; on SQLite it waits for the immediate transaction to finish
    /// and then sees the row already consumed.
    pub async fn claim(&self, consumer_id: &str) -> Result<Option<Task>, DatabaseError> {
        let conn = self.dal.database.connection().await?;

        let consumer = consumer_id.to_string();
        let now = Utc::now().naive_utc();

        let claimed = conn
            .interact(move |conn| match conn {
                AnyConnection::Postgres(pg) => claim_postgres(pg, &consumer, now),
                AnyConnection::Sqlite(sqlite) => claim_sqlite(sqlite, &consumer, now),
            })
            .await
            .map_err(|e| DatabaseError::ConnectionPool(e.to_string()))??;

        Ok(claimed)
    }

    /// Marks a `consumed` task as `done`, recording its result and when that
    /// result may be reaped.
    pub async fn mark_done(
        &self,
        task_id: &str,
        result: Option<String>,
        result_expiry: NaiveDateTime,
    ) -> Result<(), DatabaseError> {
        let conn = self.dal.database.connection().await?;

        let id_text = task_id.to_string();
        conn.interact(move |conn| {
            diesel::update(tasks::table.find(id_text))
                .set((
                    tasks::state.eq(TaskState::Done.as_str()),
                    tasks::result.eq(result),
                    tasks::result_expiry.eq(Some(result_expiry)),
                    tasks::mtime.eq(Utc::now().naive_utc()),
                ))
                .execute(conn)
        })
        .await
        .map_err(|e| DatabaseError::ConnectionPool(e.to_string()))??;

        Ok(())
    }

    /// Rejects a task outright, recording the failure as its result. Used
    /// for permanent errors where further attempts cannot help.
    pub async fn reject(
        &self,
        task_id: &str,
        result: Option<String>,
        result_expiry: NaiveDateTime,
    ) -> Result<(), DatabaseError> {
        let conn = self.dal.database.connection().await?;

        let id_text = task_id.to_string();
        conn.interact(move |conn| {
            diesel::update(tasks::table.find(id_text))
                .set((
                    tasks::state.eq(TaskState::Rejected.as_str()),
                    tasks::result.eq(result),
                    tasks::result_expiry.eq(Some(result_expiry)),
                    tasks::mtime.eq(Utc::now().naive_utc()),
                ))
                .execute(conn)
        })
        .await
        .map_err(|e| DatabaseError::ConnectionPool(e.to_string()))??;

        Ok(())
    }

    /// Returns a failed task to the queue for another attempt, or rejects it
    /// when its attempt budget is spent. Returns the state the task ended in.
    pub async fn requeue_or_reject(
        &self,
        task_id: &str,
        result: Option<String>,
        result_expiry: NaiveDateTime,
    ) -> Result<TaskState, DatabaseError> {
        let conn = self.dal.database.connection().await?;

        let id_text = task_id.to_string();
        let final_state = conn
            .interact(move |conn| {
                conn.transaction::<TaskState, diesel::result::Error, _>(|conn| {
                    let task: Task = tasks::table.find(&id_text).first(conn)?;
                    let new_attempt = task.attempt + 1;
                    let now = Utc::now().naive_utc();

                    let final_state = if new_attempt < task.max_attempts {
                        TaskState::Queued
                    } else {
                        TaskState::Rejected
                    };

                    match final_state {
                        TaskState::Queued => {
                            diesel::update(tasks::table.find(&id_text))
                                .set((
                                    tasks::state.eq(TaskState::Queued.as_str()),
                                    tasks::attempt.eq(new_attempt),
                                    tasks::consumer_id.eq(None::<String>),
                                    tasks::mtime.eq(now),
                                ))
                                .execute(conn)?;
                        }
                        _ => {
                            diesel::update(tasks::table.find(&id_text))
                                .set((
                                    tasks::state.eq(TaskState::Rejected.as_str()),
                                    tasks::attempt.eq(new_attempt),
                                    tasks::result.eq(&result),
                                    tasks::result_expiry.eq(Some(result_expiry)),
                                    tasks::mtime.eq(now),
                                ))
                                .execute(conn)?;
                        }
                    }

                    Ok(final_state)
                })
            })
            .await
            .map_err(|e| DatabaseError::ConnectionPool(e.to_string()))??;

        Ok(final_state)
    }

    /// Returns `consumed` tasks whose worker is gone to the queue.
    ///
    /// A worker is gone when its liveness row is missing or its last
    /// heartbeat is older than `alive_cutoff`. Each lost task goes through
    /// the usual attempt accounting, so a task repeatedly stranded by dying
    /// workers is eventually rejected rather than looping forever. Returns
    /// the ids of requeued tasks and of rejected ones.
    pub async fn reclaim_lost(
        &self,
        alive_cutoff: NaiveDateTime,
        result_expiry: NaiveDateTime,
    ) -> Result<(Vec<String>, Vec<String>), DatabaseError> {
        let conn = self.dal.database.connection().await?;

        let outcome = conn
            .interact(move |conn| {
                conn.transaction::<(Vec<String>, Vec<String>), diesel::result::Error, _>(|conn| {
                    let live_workers: Vec<String> = workers::table
                        .filter(workers::last_alive.ge(alive_cutoff))
                        .select(workers::id)
                        .load(conn)?;

                    let lost: Vec<Task> = tasks::table
                        .filter(tasks::state.eq(TaskState::Consumed.as_str()))
                        .load::<Task>(conn)?
                        .into_iter()
                        .filter(|task| match &task.consumer_id {
                            Some(consumer) => !live_workers.contains(consumer),
                            None => true,
                        })
                        .collect();

                    let mut requeued = Vec::new();
                    let mut rejected = Vec::new();
                    let now = Utc::now().naive_utc();

                    for task in lost {
                        let new_attempt = task.attempt + 1;
                        if new_attempt < task.max_attempts {
                            diesel::update(tasks::table.find(&task.id))
                                .set((
                                    tasks::state.eq(TaskState::Queued.as_str()),
                                    tasks::attempt.eq(new_attempt),
                                    tasks::consumer_id.eq(None::<String>),
                                    tasks::mtime.eq(now),
                                ))
                                .execute(conn)?;
                            requeued.push(task.id);
                        } else {
                            diesel::update(tasks::table.find(&task.id))
                                .set((
                                    tasks::state.eq(TaskState::Rejected.as_str()),
                                    tasks::attempt.eq(new_attempt),
                                    tasks::result
                                        .eq(Some("{\"error\":\"worker lost\"}".to_string())),
                                    tasks::result_expiry.eq(Some(result_expiry)),
                                    tasks::mtime.eq(now),
                                ))
                                .execute(conn)?;
                            rejected.push(task.id);
                        }
                    }

                    Ok((requeued, rejected))
                })
            })
            .await
            .map_err(|e| DatabaseError::ConnectionPool(e.to_string()))??;

        Ok(outcome)
    }

    /// Rejects every non-terminal task whose deadline has passed and returns
    /// the affected tasks, so the caller can fail whatever the tasks were
    /// working on.
    pub async fn expire_deadlines(
        &self,
        now: NaiveDateTime,
        result_expiry: NaiveDateTime,
    ) -> Result<Vec<Task>, DatabaseError> {
        let conn = self.dal.database.connection().await?;

        let expired = conn
            .interact(move |conn| {
                conn.transaction::<Vec<Task>, diesel::result::Error, _>(|conn| {
                    let expired: Vec<Task> = tasks::table
                        .filter(tasks::state.eq_any(vec![
                            TaskState::Queued.as_str(),
                            TaskState::Consumed.as_str(),
                        ]))
                        .filter(tasks::deadline.is_not_null())
                        .filter(tasks::deadline.lt(now))
                        .load(conn)?;

                    if expired.is_empty() {
                        return Ok(expired);
                    }

                    let ids: Vec<&String> = expired.iter().map(|t| &t.id).collect();
                    diesel::update(tasks::table.filter(tasks::id.eq_any(ids)))
                        .set((
                            tasks::state.eq(TaskState::Rejected.as_str()),
                            tasks::result.eq(Some("{\"error\":\"deadline exceeded\"}".to_string())),
                            tasks::result_expiry.eq(Some(result_expiry)),
                            tasks::mtime.eq(now),
                        ))
                        .execute(conn)?;

                    Ok(expired)
                })
            })
            .await
            .map_err(|e| DatabaseError::ConnectionPool(e.to_string()))??;

        Ok(expired)
    }

    /// Deletes terminal tasks whose `result_expiry` has passed. Returns how
    /// many were deleted.
    pub async fn delete_expired(&self, now: NaiveDateTime) -> Result<usize, DatabaseError> {
        let conn = self.dal.database.connection().await?;

        let deleted = conn
            .interact(move |conn| {
                diesel::delete(
                    tasks::table
                        .filter(tasks::state.eq_any(vec![
                            TaskState::Done.as_str(),
                            TaskState::Rejected.as_str(),
                        ]))
                        .filter(tasks::result_expiry.is_not_null())
                        .filter(tasks::result_expiry.lt(now)),
                )
                .execute(conn)
            })
            .await
            .map_err(|e| DatabaseError::ConnectionPool(e.to_string()))??;

        Ok(deleted)
    }
}

/// PostgreSQL claim: one statement, contention handled by `SKIP LOCKED`.
fn claim_postgres(
    conn: &mut PgConnection,
    consumer_id: &str,
    now: NaiveDateTime,
) -> Result<Option<Task>, diesel::result::Error> {
    use diesel::sql_types::{Text, Timestamp};

    let rows: Vec<ClaimedRow> = diesel::sql_query(
        r#"
        UPDATE tasks
        SET state = 'consumed', consumer_id = $1, mtime = $2
        WHERE id = (
            SELECT id FROM tasks
            WHERE state = 'queued'
            ORDER BY mtime ASC
            LIMIT 1
            FOR UPDATE SKIP LOCKED
        )
        RETURNING id, queue, state, mtime, payload, result, result_expiry,
                  attempt, max_attempts, consumer_id, deadline
        "#,
    )
    .bind::<Text, _>(consumer_id)
    .bind::<Timestamp, _>(now)
    .load(conn)?;

    Ok(rows.into_iter().next().map(Task::from))
}

/// SQLite claim: BEGIN IMMEDIATE takes the write lock up front, so the
/// select-then-update pair cannot interleave with another claimant.
fn claim_sqlite(
    conn: &mut SqliteConnection,
    consumer_id: &str,
    now: NaiveDateTime,
) -> Result<Option<Task>, diesel::result::Error> {
    conn.immediate_transaction::<Option<Task>, diesel::result::Error, _>(|conn| {
        let candidate: Option<Task> = tasks::table
            .filter(tasks::state.eq(TaskState::Queued.as_str()))
            .order(tasks::mtime.asc())
            .first(conn)
            .optional()?;

        let Some(mut task) = candidate else {
            return Ok(None);
        };

        diesel::update(tasks::table.find(&task.id))
            .set((
                tasks::state.eq(TaskState::Consumed.as_str()),
                tasks::consumer_id.eq(Some(consumer_id)),
                tasks::mtime.eq(now),
            ))
            .execute(conn)?;

        task.state = TaskState::Consumed.as_str().to_string();
        task.consumer_id = Some(consumer_id.to_string());
        task.mtime = now;

        Ok(Some(task))
    })
}
