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

//! Publish Model
//!
//! A publish is the unit of atomic content exposure: items accumulate on a
//! `PENDING` publish and become visible together when the publish commits.

use std::fmt;
use std::str::FromStr;

use chrono::NaiveDateTime;
use diesel::prelude::*;
use serde::{Deserialize, Serialize};

/// Lifecycle state of a publish.
///
/// `Committed` and `Failed` are terminal; a publish never leaves them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PublishState {
    Pending,
    Committing,
    Committed,
    Failed,
}

impl PublishState {
    /// Stored string form of this state.
    pub fn as_str(&self) -> &'static str {
        match self {
            PublishState::Pending => "PENDING",
            PublishState::Committing => "COMMITTING",
            PublishState::Committed => "COMMITTED",
            PublishState::Failed => "FAILED",
        }
    }

    /// Whether this state permits no further transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(self, PublishState::Committed | PublishState::Failed)
    }
}

impl fmt::Display for PublishState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PublishState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(PublishState::Pending),
            "COMMITTING" => Ok(PublishState::Committing),
            "COMMITTED" => Ok(PublishState::Committed),
            "FAILED" => Ok(PublishState::Failed),
            other => Err(format!("unknown publish state: {}", other)),
        }
    }
}

/// Represents a publish record in the database.
#[derive(Debug, Clone, Queryable, Selectable, Serialize, Deserialize)]
#[diesel(table_name = crate::database::schema::publishes)]
pub struct Publish {
    /// Unique identifier (UUID, stored in hyphenated text form)
    pub id: String,
    /// Target environment name
    pub env: String,
    /// Current lifecycle state
    pub state: String,
    /// Timestamp of the last state change or item addition
    pub updated: NaiveDateTime,
}

/// Represents a new publish to be inserted into the database.
#[derive(Debug, Insertable)]
#[diesel(table_name = crate::database::schema::publishes)]
pub struct NewPublish {
    /// Unique identifier (UUID, stored in hyphenated text form)
    pub id: String,
    /// Target environment name
    pub env: String,
    /// Initial lifecycle state, always `PENDING`
    pub state: String,
    /// Creation timestamp
    pub updated: NaiveDateTime,
}
