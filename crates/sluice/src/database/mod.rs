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

//! Database layer with runtime backend selection.
//!
//! The relational store holds publishes, their items, the durable task queue
//! and the worker liveness registry. Both PostgreSQL and SQLite are supported
//! through Diesel's `MultiConnection` derive; the backend is detected at
//! runtime from the connection URL. All four tables use the same column types
//! on both backends (UUIDs as text, naive UTC timestamps), so queries are
//! written once against the multi-backend connection and only claim locking
//! differs per backend.

pub mod connection;
pub mod schema;

pub use connection::{
    run_migrations_postgres, run_migrations_sqlite, AnyConnection, BackendType, Database,
    DbConnection, DbPool,
};

use diesel_migrations::{embed_migrations, EmbeddedMigrations};

/// Embedded PostgreSQL migrations.
pub const POSTGRES_MIGRATIONS: EmbeddedMigrations = embed_migrations!("migrations/postgres");

/// Embedded SQLite migrations.
pub const SQLITE_MIGRATIONS: EmbeddedMigrations = embed_migrations!("migrations/sqlite");

/// Helper macro for matching on `AnyConnection` variants.
///
/// This macro simplifies pattern matching on connection types when
/// executing backend-specific queries.
///
/// # Example
///
/// ```rust,ignore
/// connection_match!(conn, pg_conn => {
///     // Use pg_conn for PostgreSQL operations
///     diesel::select(1).get_result::<i32>(pg_conn)
/// }, sqlite_conn => {
///     // Use sqlite_conn for SQLite operations
///     diesel::select(1).get_result::<i32>(sqlite_conn)
/// })
/// ```
#[macro_export]
macro_rules! connection_match {
    ($conn:expr, $pg_var:ident => $pg_block:block, $sqlite_var:ident => $sqlite_block:block) => {
        match $conn {
            $crate::database::AnyConnection::Postgres($pg_var) => $pg_block,
            $crate::database::AnyConnection::Sqlite($sqlite_var) => $sqlite_block,
        }
    };
}
