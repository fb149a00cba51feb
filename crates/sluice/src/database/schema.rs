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

//! Diesel table definitions shared by both backends.
//!
//! Column types are deliberately restricted to text, integer and naive
//! timestamp so the same definitions compile against the multi-backend
//! connection. UUIDs are stored as text.

diesel::table! {
    publishes (id) {
        id -> Text,
        env -> Text,
        state -> Text,
        updated -> Timestamp,
    }
}

diesel::table! {
    items (id) {
        id -> Text,
        publish_id -> Text,
        web_uri -> Text,
        object_key -> Nullable<Text>,
        content_type -> Nullable<Text>,
        link_to -> Nullable<Text>,
        updated -> Timestamp,
    }
}

diesel::table! {
    tasks (id) {
        id -> Text,
        queue -> Text,
        state -> Text,
        mtime -> Timestamp,
        payload -> Text,
        result -> Nullable<Text>,
        result_expiry -> Nullable<Timestamp>,
        attempt -> Integer,
        max_attempts -> Integer,
        consumer_id -> Nullable<Text>,
        deadline -> Nullable<Timestamp>,
    }
}

diesel::table! {
    workers (id) {
        id -> Text,
        last_alive -> Timestamp,
    }
}

diesel::joinable!(items -> publishes (publish_id));

diesel::allow_tables_to_appear_in_same_query!(publishes, items, tasks, workers);
