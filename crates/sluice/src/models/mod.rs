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

//! Database Models
//!
//! Row structs for the publish pipeline tables. Identifiers and timestamps
//! are stored as plain `TEXT`/`TIMESTAMP` so the same structs work unchanged
//! on both PostgreSQL and SQLite; conversion to richer types happens at the
//! data access layer.

pub mod item;
pub mod publish;
pub mod task;
pub mod worker;

pub use item::{Item, NewItem};
pub use publish::{NewPublish, Publish, PublishState};
pub use task::{CommitPayload, FlushPayload, NewTask, Task, TaskState};
pub use worker::{NewWorker, Worker};
