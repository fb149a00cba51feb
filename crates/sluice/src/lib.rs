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

//! # Sluice
//!
//! Sluice is a publishing pipeline for content delivery networks. Callers
//! accumulate content items onto a *publish*, then commit the publish to make
//! every item visible at once. Visibility is driven by a versioned external
//! config store: each CDN path maps to the object key of its content, stamped
//! with the date from which that mapping is live.
//!
//! ## Core Concepts
//!
//! - **Publish**: an open batch of items. Items can be added while the
//!   publish is `PENDING`; a commit moves it through `COMMITTING` to
//!   `COMMITTED` (or `FAILED`).
//! - **Item**: one CDN path bound to content, either directly by object key
//!   or as a link to another path in the same publish.
//! - **Commit**: a two-phase write of the publish's items into the store.
//!   Ordinary content lands first; entrypoint paths (package manifests,
//!   listing files) land only after every ordinary write succeeded, so
//!   clients never discover content that is not yet fully available.
//! - **Task queue**: commits run asynchronously on a pool of workers backed
//!   by a durable relational queue. Workers heartbeat; a janitor returns
//!   tasks from dead workers to the queue.
//! - **Flush**: after a successful commit, cached CDN paths are purged so
//!   the new content becomes visible without waiting for TTL expiry.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use sluice::config::{Environment, Settings};
//! use sluice::dal::DAL;
//! use sluice::database::Database;
//! use sluice::publish::{ItemInput, PublishManager};
//! use sluice::store::MemoryStore;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     sluice::init_logging(None);
//!
//!     let settings = Settings::builder()
//!         .environment(Environment::new("live", "bucket", "table", "config"))
//!         .build();
//!
//!     let database = Database::new("sluice.db", "", 1);
//!     database.run_migrations().await?;
//!     let dal = Arc::new(DAL::new(database));
//!
//!     let manager = PublishManager::new(dal.clone(), Arc::new(settings));
//!     let publish = manager.create_publish("live").await?;
//!     manager
//!         .add_items(
//!             publish.id.parse()?,
//!             vec![ItemInput::content(
//!                 "/content/file.rpm",
//!                 "a".repeat(64),
//!                 Some("application/x-rpm".to_string()),
//!             )],
//!         )
//!         .await?;
//!     let task = manager.request_commit(publish.id.parse()?).await?;
//!     println!("commit queued as task {}", task.id);
//!     Ok(())
//! }
//! ```
//!
//! ## Database Support
//!
//! Both PostgreSQL and SQLite are supported through a single connection
//! pool; the backend is detected at runtime from the connection URL.

pub mod commit;
pub mod config;
pub mod dal;
pub mod database;
pub mod error;
pub mod flush;
pub mod models;
pub mod publish;
pub mod schemas;
pub mod store;
pub mod worker;
pub mod writer;

pub use commit::CommitEngine;
pub use config::{Environment, FlushRuleConfig, Settings};
pub use dal::DAL;
pub use database::Database;
pub use error::{
    CommitError, ConfigError, ConflictError, DatabaseError, FlushError, PublishError, StoreError,
    ValidationError, WorkerError,
};
pub use flush::{Flusher, HttpPurgeClient, PurgeClient};
pub use models::{Item, Publish, PublishState, Task, TaskState};
pub use publish::{ItemInput, PublishManager};
pub use store::{ConfigEntry, ConfigStore, MemoryStore};
pub use worker::{Janitor, WorkerPool};
pub use writer::{BatchWriter, WriteResult};

/// Initializes logging for the pipeline.
///
/// Filter resolution order: the explicit `filter` argument, then the
/// `RUST_LOG` environment variable, then `sluice=info`. Calling this twice
/// is a no-op (the second subscriber fails to install and is discarded),
/// which keeps it safe to call from tests.
pub fn init_logging(filter: Option<&str>) {
    use tracing_subscriber::EnvFilter;

    let env_filter = match filter {
        Some(f) => EnvFilter::new(f),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("sluice=info")),
    };

    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .try_init();
}
