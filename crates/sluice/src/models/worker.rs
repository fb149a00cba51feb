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

//! Worker Model
//!
//! Worker liveness records. Each running worker heartbeats its row; a row
//! whose `last_alive` falls behind the keepalive timeout marks a dead
//! worker whose claimed tasks must be returned to the queue.

use chrono::NaiveDateTime;
use diesel::prelude::*;
use serde::{Deserialize, Serialize};

/// Represents a worker liveness record in the database.
#[derive(Debug, Clone, Queryable, Selectable, Serialize, Deserialize)]
#[diesel(table_name = crate::database::schema::workers)]
pub struct Worker {
    /// Worker identifier, also used as task `consumer_id`
    pub id: String,
    /// Timestamp of the most recent heartbeat
    pub last_alive: NaiveDateTime,
}

/// Represents a new worker registration to be inserted into the database.
#[derive(Debug, Insertable)]
#[diesel(table_name = crate::database::schema::workers)]
pub struct NewWorker {
    /// Worker identifier, also used as task `consumer_id`
    pub id: String,
    /// Registration timestamp
    pub last_alive: NaiveDateTime,
}
