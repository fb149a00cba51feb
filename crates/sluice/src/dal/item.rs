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

//! Item DAL
//!
//! Bulk item operations for publishes. Inserts are chunked so a single
//! statement never carries an unbounded number of bind parameters, and the
//! whole batch lands in one transaction so a partially-added request is
//! never visible. Reads are paged for commit-time streaming.

use chrono::{NaiveDateTime, Utc};
use diesel::prelude::*;
use uuid::Uuid;

use super::DAL;
use crate::database::schema::{items, publishes};
use crate::error::DatabaseError;
use crate::models::item::{Item, NewItem};

/// A resolved link: the concrete content fields to copy onto a link item.
///
/// `link_to` is kept on the row after resolution; it marks the item for
/// deferred (phase 2) writing and makes re-resolution on a redone commit a
/// no-op.
#[derive(Debug, Clone)]
pub struct LinkResolution {
    /// Item to update
    pub item_id: String,
    /// Object key copied from the link target
    pub object_key: String,
    /// Content type copied from the link target
    pub content_type: Option<String>,
}

/// Data access operations for publish items.
pub struct ItemDAL<'a> {
    dal: &'a DAL,
}

impl<'a> ItemDAL<'a> {
    /// Creates a new ItemDAL instance.
    pub fn new(dal: &'a DAL) -> Self {
        ItemDAL { dal }
    }

    /// Inserts a batch of items in chunks of `chunk_size` rows per statement,
    /// all within one transaction, and refreshes the owning publish's
    /// `updated` timestamp. Returns how many items were inserted.
    pub async fn insert_batch(
        &self,
        publish_id: Uuid,
        new_items: Vec<NewItem>,
        chunk_size: usize,
    ) -> Result<usize, DatabaseError> {
        if new_items.is_empty() {
            return Ok(0);
        }

        let conn = self.dal.database.connection().await?;
        let publish_id_text = publish_id.to_string();
        let chunk_size = chunk_size.max(1);

        let inserted = conn
            .interact(move |conn| {
                conn.transaction::<usize, diesel::result::Error, _>(|conn| {
                    let mut inserted = 0;
                    for chunk in new_items.chunks(chunk_size) {
                        // Multi-row VALUES isn't expressible through the
                        // MultiConnection backend; run the same statement on
                        // the concrete connection.
                        inserted += crate::connection_match!(conn, conn => {
                            diesel::insert_into(items::table)
                                .values(chunk)
                                .execute(conn)?
                        }, conn => {
                            diesel::insert_into(items::table)
                                .values(chunk)
                                .execute(conn)?
                        });
                    }

                    diesel::update(publishes::table.find(&publish_id_text))
                        .set(publishes::updated.eq(Utc::now().naive_utc()))
                        .execute(conn)?;

                    Ok(inserted)
                })
            })
            .await
            .map_err(|e| DatabaseError::ConnectionPool(e.to_string()))??;

        Ok(inserted)
    }

    /// Counts the items belonging to a publish.
    pub async fn count(&self, publish_id: Uuid) -> Result<i64, DatabaseError> {
        let conn = self.dal.database.connection().await?;

        let publish_id_text = publish_id.to_string();
        let count = conn
            .interact(move |conn| {
                items::table
                    .filter(items::publish_id.eq(publish_id_text))
                    .count()
                    .get_result::<i64>(conn)
            })
            .await
            .map_err(|e| DatabaseError::ConnectionPool(e.to_string()))??;

        Ok(count)
    }

    /// Loads one page of a publish's items, ordered by `web_uri` so repeated
    /// walks see a stable order.
    pub async fn page(
        &self,
        publish_id: Uuid,
        offset: i64,
        limit: i64,
    ) -> Result<Vec<Item>, DatabaseError> {
        let conn = self.dal.database.connection().await?;

        let publish_id_text = publish_id.to_string();
        let page = conn
            .interact(move |conn| {
                items::table
                    .filter(items::publish_id.eq(publish_id_text))
                    .order(items::web_uri.asc())
                    .limit(limit)
                    .offset(offset)
                    .load::<Item>(conn)
            })
            .await
            .map_err(|e| DatabaseError::ConnectionPool(e.to_string()))??;

        Ok(page)
    }

    /// Loads the items of a publish whose `web_uri` is in `uris`.
    ///
    /// Used both to detect re-added paths at intake and to look up link
    /// targets during resolution.
    pub async fn by_uris(
        &self,
        publish_id: Uuid,
        uris: Vec<String>,
    ) -> Result<Vec<Item>, DatabaseError> {
        if uris.is_empty() {
            return Ok(Vec::new());
        }

        let conn = self.dal.database.connection().await?;

        let publish_id_text = publish_id.to_string();
        let found = conn
            .interact(move |conn| {
                items::table
                    .filter(items::publish_id.eq(publish_id_text))
                    .filter(items::web_uri.eq_any(uris))
                    .load::<Item>(conn)
            })
            .await
            .map_err(|e| DatabaseError::ConnectionPool(e.to_string()))??;

        Ok(found)
    }

    /// Loads every link item (non-null `link_to`) of a publish.
    pub async fn link_items(&self, publish_id: Uuid) -> Result<Vec<Item>, DatabaseError> {
        let conn = self.dal.database.connection().await?;

        let publish_id_text = publish_id.to_string();
        let links = conn
            .interact(move |conn| {
                items::table
                    .filter(items::publish_id.eq(publish_id_text))
                    .filter(items::link_to.is_not_null())
                    .load::<Item>(conn)
            })
            .await
            .map_err(|e| DatabaseError::ConnectionPool(e.to_string()))??;

        Ok(links)
    }

    /// Applies link resolutions: copies the target's content fields onto each
    /// link item. All updates land in one transaction.
    pub async fn apply_link_resolutions(
        &self,
        resolutions: Vec<LinkResolution>,
        now: NaiveDateTime,
    ) -> Result<usize, DatabaseError> {
        if resolutions.is_empty() {
            return Ok(0);
        }

        let conn = self.dal.database.connection().await?;

        let updated = conn
            .interact(move |conn| {
                conn.transaction::<usize, diesel::result::Error, _>(|conn| {
                    let mut updated = 0;
                    for resolution in &resolutions {
                        updated += diesel::update(items::table.find(&resolution.item_id))
                            .set((
                                items::object_key.eq(&resolution.object_key),
                                items::content_type.eq(&resolution.content_type),
                                items::updated.eq(now),
                            ))
                            .execute(conn)?;
                    }
                    Ok(updated)
                })
            })
            .await
            .map_err(|e| DatabaseError::ConnectionPool(e.to_string()))??;

        Ok(updated)
    }
}
