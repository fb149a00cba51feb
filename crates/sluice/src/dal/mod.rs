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

//! Data Access Layer
//!
//! All SQL lives here. Queries are written once against the multi-backend
//! connection; the sole per-backend split is task claiming, where PostgreSQL
//! uses `FOR UPDATE SKIP LOCKED` and SQLite serializes claimants through an
//! immediate transaction.
//!
//! # Example
//!
//! ```rust,ignore
//! use sluice::dal::DAL;
//! use sluice::database::Database;
//!
//! let db = Database::new("postgres://localhost/sluice", "sluice", 10);
//! let dal = DAL::new(db);
//!
//! let publish = dal.publish().create("test").await?;
//! ```

use crate::database::{BackendType, Database};

pub mod item;
pub mod publish;
pub mod task;
pub mod worker;

pub use item::ItemDAL;
pub use publish::PublishDAL;
pub use task::TaskDAL;
pub use worker::WorkerDAL;

/// The Data Access Layer struct.
///
/// # Thread Safety
///
/// `DAL` is `Clone` and can be safely shared between threads. Each clone
/// references the same underlying database connection pool.
#[derive(Clone, Debug)]
pub struct DAL {
    /// The database instance with connection pool
    pub database: Database,
}

impl DAL {
    /// Creates a new DAL instance.
    pub fn new(database: Database) -> Self {
        DAL { database }
    }

    /// Returns the backend type for this DAL instance.
    pub fn backend(&self) -> BackendType {
        self.database.backend()
    }

    /// Returns a reference to the underlying database.
    pub fn database(&self) -> &Database {
        &self.database
    }

    /// Returns a publish DAL for publish lifecycle operations.
    pub fn publish(&self) -> PublishDAL {
        PublishDAL::new(self)
    }

    /// Returns an item DAL for publish item operations.
    pub fn item(&self) -> ItemDAL {
        ItemDAL::new(self)
    }

    /// Returns a task DAL for queue operations.
    pub fn task(&self) -> TaskDAL {
        TaskDAL::new(self)
    }

    /// Returns a worker DAL for liveness operations.
    pub fn worker(&self) -> WorkerDAL {
        WorkerDAL::new(self)
    }
}
