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

//! Item Model
//!
//! An item binds a CDN path to content: either directly via an object key,
//! or indirectly as a link to another path in the same publish. Link items
//! are resolved to concrete object keys during commit.

use chrono::NaiveDateTime;
use diesel::prelude::*;
use serde::{Deserialize, Serialize};

/// Represents a publish item record in the database.
///
/// At intake exactly one of `object_key` and `link_to` is set; link
/// resolution later fills `object_key` on link items while keeping
/// `link_to`. `(publish_id, web_uri)` is unique; re-adding a path within a
/// publish is rejected at validation.
#[derive(Debug, Clone, Queryable, Selectable, Serialize, Deserialize)]
#[diesel(table_name = crate::database::schema::items)]
pub struct Item {
    /// Unique identifier (UUID, stored in hyphenated text form)
    pub id: String,
    /// Owning publish
    pub publish_id: String,
    /// Absolute path under the CDN root
    pub web_uri: String,
    /// Checksum key of the content object (lowercase hex)
    pub object_key: Option<String>,
    /// MIME type served for this path
    pub content_type: Option<String>,
    /// Path of another item in the same publish to mirror
    pub link_to: Option<String>,
    /// Timestamp when the item was added
    pub updated: NaiveDateTime,
}

impl Item {
    /// Whether this item is a link awaiting resolution.
    pub fn is_link(&self) -> bool {
        self.link_to.is_some()
    }
}

/// Represents a new item to be inserted into the database.
///
/// `None` fields bind SQL NULL explicitly (`treat_none_as_default_value =
/// false`) so chunked batch inserts stay a single statement on every
/// backend; the nullable `items` columns have no defaults, so the stored
/// rows are identical either way.
#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = crate::database::schema::items)]
#[diesel(treat_none_as_default_value = false)]
pub struct NewItem {
    /// Unique identifier (UUID, stored in hyphenated text form)
    pub id: String,
    /// Owning publish
    pub publish_id: String,
    /// Absolute path under the CDN root
    pub web_uri: String,
    /// Checksum key of the content object (lowercase hex)
    pub object_key: Option<String>,
    /// MIME type served for this path
    pub content_type: Option<String>,
    /// Path of another item in the same publish to mirror
    pub link_to: Option<String>,
    /// Timestamp when the item was added
    pub updated: NaiveDateTime,
}
