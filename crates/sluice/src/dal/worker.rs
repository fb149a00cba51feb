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

//! Worker DAL
//!
//! Liveness registry queries. Heartbeats are update-then-insert inside one
//! transaction rather than a native upsert, so the statement stays portable
//! across both backends.

use chrono::NaiveDateTime;
use diesel::prelude::*;

use super::DAL;
use crate::database::schema::workers;
use crate::error::DatabaseError;
use crate::models::worker::{NewWorker, Worker};

/// Data access operations for worker liveness records.
pub struct WorkerDAL<'a> {
    dal: &'a DAL,
}

impl<'a> WorkerDAL<'a> {
    /// Creates a new WorkerDAL instance.
    pub fn new(dal: &'a DAL) -> Self {
        WorkerDAL { dal }
    }

    /// Records a heartbeat for `worker_id`, registering the worker if it has
    /// no row yet.
    pub async fn heartbeat(
        &self,
        worker_id: &str,
        now: NaiveDateTime,
    ) -> Result<(), DatabaseError> {
        let conn = self.dal.database.connection().await?;

        let id_text = worker_id.to_string();
        conn.interact(move |conn| {
            conn.transaction::<(), diesel::result::Error, _>(|conn| {
                let updated = diesel::update(workers::table.find(&id_text))
                    .set(workers::last_alive.eq(now))
                    .execute(conn)?;

                if updated == 0 {
                    diesel::insert_into(workers::table)
                        .values(&NewWorker {
                            id: id_text.clone(),
                            last_alive: now,
                        })
                        .execute(conn)?;
                }

                Ok(())
            })
        })
        .await
        .map_err(|e| DatabaseError::ConnectionPool(e.to_string()))??;

        Ok(())
    }

    /// Removes a worker's liveness row on clean shutdown.
    pub async fn deregister(&self, worker_id: &str) -> Result<(), DatabaseError> {
        let conn = self.dal.database.connection().await?;

        let id_text = worker_id.to_string();
        conn.interact(move |conn| {
            diesel::delete(workers::table.find(id_text)).execute(conn)
        })
        .await
        .map_err(|e| DatabaseError::ConnectionPool(e.to_string()))??;

        Ok(())
    }

    /// Lists all registered workers.
    pub async fn list(&self) -> Result<Vec<Worker>, DatabaseError> {
        let conn = self.dal.database.connection().await?;

        let all = conn
            .interact(|conn| workers::table.load::<Worker>(conn))
            .await
            .map_err(|e| DatabaseError::ConnectionPool(e.to_string()))??;

        Ok(all)
    }

    /// Deletes workers whose last heartbeat is older than `cutoff`. Returns
    /// the removed worker ids.
    pub async fn delete_stale(&self, cutoff: NaiveDateTime) -> Result<Vec<String>, DatabaseError> {
        let conn = self.dal.database.connection().await?;

        let removed = conn
            .interact(move |conn| {
                conn.transaction::<Vec<String>, diesel::result::Error, _>(|conn| {
                    let stale: Vec<String> = workers::table
                        .filter(workers::last_alive.lt(cutoff))
                        .select(workers::id)
                        .load(conn)?;

                    if !stale.is_empty() {
                        diesel::delete(workers::table.filter(workers::id.eq_any(&stale)))
                            .execute(conn)?;
                    }

                    Ok(stale)
                })
            })
            .await
            .map_err(|e| DatabaseError::ConnectionPool(e.to_string()))??;

        Ok(removed)
    }
}
